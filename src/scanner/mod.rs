//! Core functionality for actual scanning behaviour.
//!
//! A [`Scanner`] validates its [`ScanJob`] up front, then streams the job's
//! units through a [`WorkerPool`] whose workers each run a [`Prober`]. Open
//! results are labelled by a [`ServiceClassifier`] before they reach the
//! aggregator.
pub mod aggregator;
pub mod cancel;
pub mod pool;
pub mod probe;

pub use cancel::Cancellation;
pub use pool::{PoolState, WorkerPool};
pub use probe::Prober;

use std::borrow::Cow;
use std::fmt;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use serde_derive::Serialize;

use crate::error::{InvalidSpec, Result};
use crate::service::{DefaultClassifier, ServiceClassifier, ServiceLabel};
use crate::target::{PortRange, Protocol, ScanUnit, Target};
use probe::{DEFAULT_BANNER_TIMEOUT, DEFAULT_PROBE_TIMEOUT};

/// Worker count used when none is configured.
pub const DEFAULT_CONCURRENCY: usize = 50;

/// Outcome of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    /// The connection was established.
    Open,
    /// Refused, timed out or unreachable.
    Closed,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("open"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

/// Raw bytes a service sent right after the connection was accepted,
/// with surrounding ASCII whitespace trimmed. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Banner(Vec<u8>);

impl Banner {
    /// Trims `raw`; `None` when nothing but whitespace is left.
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        let trimmed = raw.trim_ascii();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_vec()))
        }
    }

    /// Banner bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Banner as text, invalid UTF-8 replaced.
    pub fn to_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl fmt::Display for Banner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl serde::Serialize for Banner {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Immutable outcome of probing one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    #[serde(flatten)]
    unit: ScanUnit,
    state: PortState,
    #[serde(skip_serializing_if = "Option::is_none")]
    banner: Option<Banner>,
    #[serde(skip_serializing_if = "Option::is_none")]
    service: Option<ServiceLabel>,
}

impl ScanResult {
    pub(crate) const fn open(unit: ScanUnit, banner: Option<Banner>) -> Self {
        Self {
            unit,
            state: PortState::Open,
            banner,
            service: None,
        }
    }

    pub(crate) const fn closed(unit: ScanUnit) -> Self {
        Self {
            unit,
            state: PortState::Closed,
            banner: None,
            service: None,
        }
    }

    #[must_use]
    pub(crate) fn with_service(self, service: ServiceLabel) -> Self {
        Self {
            service: Some(service),
            ..self
        }
    }

    /// The probed unit.
    pub const fn unit(&self) -> ScanUnit {
        self.unit
    }

    /// Probed address.
    pub const fn host(&self) -> IpAddr {
        self.unit.host
    }

    /// Probed port.
    pub const fn port(&self) -> u16 {
        self.unit.port
    }

    /// Transport of the probe.
    pub const fn protocol(&self) -> Protocol {
        self.unit.protocol
    }

    /// Open or closed.
    pub const fn state(&self) -> PortState {
        self.state
    }

    /// Shorthand for `state() == PortState::Open`.
    pub fn is_open(&self) -> bool {
        self.state == PortState::Open
    }

    /// Captured banner, if the service sent one in time.
    pub const fn banner(&self) -> Option<&Banner> {
        self.banner.as_ref()
    }

    /// Service label, set on open results only.
    pub const fn service(&self) -> Option<&ServiceLabel> {
        self.service.as_ref()
    }
}

/// Configuration of a port scan. Read-only once handed to a [`Scanner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanJob {
    /// Host or block to scan.
    pub target: Target,
    /// Ports probed on every address of the target.
    pub ports: PortRange,
    /// Worker count `W`, at least 1.
    pub concurrency: usize,
    /// Connect deadline per unit.
    pub timeout: Duration,
    /// Banner read deadline; `None` skips banner capture.
    pub banner_timeout: Option<Duration>,
    /// Transport to probe with.
    pub protocol: Protocol,
    /// Also report closed units. Off by default, so only open units come back.
    pub include_closed: bool,
}

impl ScanJob {
    /// A TCP job with the default worker count and deadlines.
    pub const fn new(target: Target, ports: PortRange) -> Self {
        Self {
            target,
            ports,
            concurrency: DEFAULT_CONCURRENCY,
            timeout: DEFAULT_PROBE_TIMEOUT,
            banner_timeout: Some(DEFAULT_BANNER_TIMEOUT),
            protocol: Protocol::Tcp,
            include_closed: false,
        }
    }

    /// Checks the job and returns its worker count.
    pub fn validate(&self) -> Result<NonZeroUsize> {
        let workers = NonZeroUsize::new(self.concurrency).ok_or(InvalidSpec::ZeroConcurrency)?;
        if self.timeout.is_zero() {
            return Err(InvalidSpec::ZeroTimeout("probe"));
        }
        if self.banner_timeout.is_some_and(|wait| wait.is_zero()) {
            return Err(InvalidSpec::ZeroTimeout("banner"));
        }
        Ok(workers)
    }

    /// The job's units in enumeration order, produced lazily.
    pub fn units(&self) -> impl Iterator<Item = ScanUnit> {
        self.target.units(self.ports, self.protocol)
    }
}

/// Runs a validated [`ScanJob`].
pub struct Scanner {
    job: ScanJob,
    workers: NonZeroUsize,
    prober: Prober,
    classifier: Arc<dyn ServiceClassifier>,
}

impl fmt::Debug for Scanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scanner")
            .field("job", &self.job)
            .field("workers", &self.workers)
            .field("prober", &self.prober)
            .finish_non_exhaustive()
    }
}

impl Scanner {
    /// Validates `job`; labels open ports with [`DefaultClassifier`].
    pub fn new(job: ScanJob) -> Result<Self> {
        Self::with_classifier(job, Arc::new(DefaultClassifier))
    }

    /// Validates `job`; labels open ports with `classifier`.
    pub fn with_classifier(job: ScanJob, classifier: Arc<dyn ServiceClassifier>) -> Result<Self> {
        let workers = job.validate()?;
        let prober = Prober::new(job.timeout).with_banner_timeout(job.banner_timeout);
        Ok(Self {
            job,
            workers,
            prober,
            classifier,
        })
    }

    /// The job being run.
    pub const fn job(&self) -> &ScanJob {
        &self.job
    }

    /// Scans every unit of the job and returns once all workers are done.
    pub async fn run(&self) -> Vec<ScanResult> {
        self.run_until(&Cancellation::new()).await
    }

    /// Like [`run`](Self::run), but stops early when `cancel` fires and
    /// returns what was collected until then.
    pub async fn run_until(&self, cancel: &Cancellation) -> Vec<ScanResult> {
        let prober = self.prober;
        let classifier = Arc::clone(&self.classifier);
        let include_closed = self.job.include_closed;

        debug!(
            "Start scanning {}.\nWorkers {}\nPorts {}\nTargets all together {}",
            self.job.target,
            self.workers,
            self.job.ports,
            self.job.target.unit_count(self.job.ports)
        );
        let started = Instant::now();

        let results = WorkerPool::new(self.workers)
            .run(self.job.units(), cancel, move |unit| {
                let classifier = Arc::clone(&classifier);
                async move {
                    let result = prober.probe(unit).await;
                    if result.is_open() {
                        let banner = result.banner().map_or(&[][..], Banner::as_bytes);
                        let service = classifier.identify(banner, unit.port);
                        Some(result.with_service(service))
                    } else if include_closed {
                        Some(result)
                    } else {
                        None
                    }
                }
            })
            .await;

        info!(
            "Scan of {} finished in {:.2?}: {} open, cancelled: {}",
            self.job.target,
            started.elapsed(),
            results.iter().filter(|result| result.is_open()).count(),
            cancel.is_cancelled()
        );
        results
    }
}

/// Validates and runs a port scan, returning once every unit was probed.
///
/// Only an invalid job is an error; unreachable units are closed results.
pub async fn run_scan(job: ScanJob) -> Result<Vec<ScanResult>> {
    Ok(Scanner::new(job)?.run().await)
}
