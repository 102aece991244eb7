//! CIDR sweep: a liveness check per address, then a short fixed-port scan
//! of every host that answered.
//!
//! Addresses are streamed from the block into the same [`WorkerPool`] the
//! port scanner uses, so a sweep of `n` unreachable addresses takes roughly
//! `ceil(n / W)` liveness rounds rather than `n`.
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_resolver::TokioAsyncResolver;
use log::{debug, info};
use serde_derive::Serialize;

use crate::address::{get_reverse_resolver, reverse_lookup};
use crate::error::{InvalidSpec, Result};
use crate::scanner::probe::DEFAULT_LIVENESS_TIMEOUT;
use crate::scanner::{Cancellation, Prober, WorkerPool, DEFAULT_CONCURRENCY};
use crate::service::{PortTableClassifier, ServiceClassifier};
use crate::target::CidrBlock;

/// Ports tried, in order, to decide whether a host is alive.
pub const DEFAULT_LIVENESS_PORTS: [u16; 2] = [80, 22];

/// Ports scanned on every live host.
pub const COMMON_PORTS: [u16; 12] = [21, 22, 23, 25, 53, 80, 110, 143, 443, 3306, 5432, 8080];

/// Connect deadline for each port of the per-host scan.
pub const DEFAULT_HOST_PORT_TIMEOUT: Duration = Duration::from_secs(1);

/// A live host with at least one open port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostRecord {
    ip: IpAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
    open_ports: Vec<u16>,
    services: BTreeMap<u16, String>,
}

impl HostRecord {
    /// Host address.
    pub const fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Reverse-resolved name, when the lookup succeeded.
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Open ports in scan order. Never empty.
    pub fn open_ports(&self) -> &[u16] {
        &self.open_ports
    }

    /// Service name for each open port.
    pub const fn services(&self) -> &BTreeMap<u16, String> {
        &self.services
    }
}

/// Configuration of a CIDR sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryJob {
    /// Block to sweep, network and broadcast addresses included.
    pub network: CidrBlock,
    /// Worker count `W`, at least 1.
    pub concurrency: usize,
    /// Connect deadline of each liveness attempt.
    pub liveness_timeout: Duration,
    /// Connect deadline of each port of the per-host scan.
    pub port_timeout: Duration,
    /// Tried in order; the first one that accepts marks the host alive.
    pub liveness_ports: Vec<u16>,
    /// Scanned one after another on every live host.
    pub ports: Vec<u16>,
    /// Attempt a PTR lookup for hosts that end up in the result.
    pub reverse_lookup: bool,
}

impl DiscoveryJob {
    /// A sweep of `network` with the default ports and deadlines.
    pub fn new(network: CidrBlock) -> Self {
        Self {
            network,
            concurrency: DEFAULT_CONCURRENCY,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            port_timeout: DEFAULT_HOST_PORT_TIMEOUT,
            liveness_ports: DEFAULT_LIVENESS_PORTS.to_vec(),
            ports: COMMON_PORTS.to_vec(),
            reverse_lookup: true,
        }
    }

    /// Checks the job and returns its worker count.
    pub fn validate(&self) -> Result<NonZeroUsize> {
        let workers = NonZeroUsize::new(self.concurrency).ok_or(InvalidSpec::ZeroConcurrency)?;
        if self.liveness_timeout.is_zero() {
            return Err(InvalidSpec::ZeroTimeout("liveness"));
        }
        if self.port_timeout.is_zero() {
            return Err(InvalidSpec::ZeroTimeout("host port"));
        }
        if self.liveness_ports.is_empty() {
            return Err(InvalidSpec::EmptyPortList("liveness"));
        }
        if self.ports.is_empty() {
            return Err(InvalidSpec::EmptyPortList("host"));
        }
        Ok(workers)
    }
}

/// Per-address work shared by all workers of one sweep.
struct HostSweep {
    liveness: Prober,
    sub_scan: Prober,
    liveness_ports: Vec<u16>,
    ports: Vec<u16>,
    resolver: Option<TokioAsyncResolver>,
    classifier: Arc<dyn ServiceClassifier>,
}

impl HostSweep {
    async fn is_alive(&self, ip: IpAddr) -> bool {
        for &port in &self.liveness_ports {
            if self.liveness.is_open(SocketAddr::new(ip, port)).await {
                return true;
            }
        }
        false
    }

    async fn sweep(&self, ip: IpAddr) -> Option<HostRecord> {
        if !self.is_alive(ip).await {
            return None;
        }
        debug!("{ip} is alive, scanning {} ports", self.ports.len());

        let mut open_ports = Vec::new();
        for &port in &self.ports {
            if self.sub_scan.is_open(SocketAddr::new(ip, port)).await {
                open_ports.push(port);
            }
        }
        if open_ports.is_empty() {
            debug!("{ip} is alive but none of its scanned ports are open");
            return None;
        }

        let hostname = match &self.resolver {
            Some(resolver) => reverse_lookup(resolver, ip).await,
            None => None,
        };
        let services = open_ports
            .iter()
            .map(|&port| (port, self.classifier.identify(&[], port).name))
            .collect();

        Some(HostRecord {
            ip,
            hostname,
            open_ports,
            services,
        })
    }
}

/// Runs a validated [`DiscoveryJob`].
pub struct Discoverer {
    job: DiscoveryJob,
    workers: NonZeroUsize,
    resolver: Option<TokioAsyncResolver>,
    classifier: Arc<dyn ServiceClassifier>,
}

impl fmt::Debug for Discoverer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Discoverer")
            .field("job", &self.job)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl Discoverer {
    /// Validates `job`. Services are named from the well-known port table.
    pub fn new(job: DiscoveryJob) -> Result<Self> {
        let workers = job.validate()?;
        Ok(Self {
            job,
            workers,
            resolver: None,
            classifier: Arc::new(PortTableClassifier),
        })
    }

    /// Uses `resolver` for reverse lookups instead of the system one. See
    /// [`get_reverse_resolver`] for one with short lookup deadlines.
    #[must_use]
    pub fn with_resolver(mut self, resolver: TokioAsyncResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Names services with `classifier`; it only ever sees empty banners.
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn ServiceClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// The job being run.
    pub const fn job(&self) -> &DiscoveryJob {
        &self.job
    }

    /// Sweeps the whole block and returns once all workers are done.
    pub async fn run(&self) -> Vec<HostRecord> {
        self.run_until(&Cancellation::new()).await
    }

    /// Like [`run`](Self::run), but stops early when `cancel` fires.
    ///
    /// Records come back ordered by address.
    pub async fn run_until(&self, cancel: &Cancellation) -> Vec<HostRecord> {
        let resolver = if self.job.reverse_lookup {
            match &self.resolver {
                Some(resolver) => Some(resolver.clone()),
                None => Some(get_reverse_resolver(None).await),
            }
        } else {
            None
        };

        let sweep = Arc::new(HostSweep {
            liveness: Prober::new(self.job.liveness_timeout),
            sub_scan: Prober::new(self.job.port_timeout),
            liveness_ports: self.job.liveness_ports.clone(),
            ports: self.job.ports.clone(),
            resolver,
            classifier: Arc::clone(&self.classifier),
        });

        debug!(
            "Start sweeping {}.\nWorkers {}\nAddresses {}",
            self.job.network,
            self.workers,
            self.job.network.len()
        );
        let started = Instant::now();

        let mut hosts = WorkerPool::new(self.workers)
            .run(self.job.network.addresses(), cancel, move |ip| {
                let sweep = Arc::clone(&sweep);
                async move { sweep.sweep(ip).await }
            })
            .await;
        hosts.sort_unstable_by_key(HostRecord::ip);

        info!(
            "Sweep of {} finished in {:.2?}: {} hosts with open ports, cancelled: {}",
            self.job.network,
            started.elapsed(),
            hosts.len(),
            cancel.is_cancelled()
        );
        hosts
    }
}

/// Validates and runs a CIDR sweep, returning once every address was tried.
pub async fn run_discovery(job: DiscoveryJob) -> Result<Vec<HostRecord>> {
    Ok(Discoverer::new(job)?.run().await)
}
