//! Turns target strings into [`Target`]s and addresses back into names.
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use hickory_resolver::{
    config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};
use log::debug;
use tokio::{fs, io};

use crate::error::{InvalidSpec, Result};
use crate::target::Target;

/// Deadline for a single reverse lookup.
pub const REVERSE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Given a string, parse it as an IP address, a CIDR block or a host name.
///
/// Host names are resolved through the system first and `resolver`
/// second; the first address returned wins.
///
/// ```rust
/// # use sweepscan::address::{get_resolver, resolve_target};
/// # use sweepscan::target::Target;
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let resolver = get_resolver(None).await;
/// let target = resolve_target("10.0.0.0/30", &resolver).await.unwrap();
/// assert!(matches!(target, Target::Network(_)));
/// # });
/// ```
pub async fn resolve_target(input: &str, resolver: &TokioAsyncResolver) -> Result<Target> {
    match Target::from_str(input) {
        Err(InvalidSpec::UnresolvableHost(_)) => resolve_ip_from_host(input.trim(), resolver)
            .await
            .map(Target::Host)
            .ok_or_else(|| InvalidSpec::UnresolvableHost(input.to_owned())),
        parsed => parsed,
    }
}

/// Uses DNS to get the first IP associated with host.
async fn resolve_ip_from_host(source: &str, backup_resolver: &TokioAsyncResolver) -> Option<IpAddr> {
    if let Ok(mut addrs) = tokio::net::lookup_host((source, 80)).await {
        if let Some(addr) = addrs.next() {
            return Some(addr.ip());
        }
    }

    match backup_resolver.lookup_ip(source).await {
        Ok(addrs) => addrs.iter().next(),
        Err(e) => {
            debug!("Could not resolve {source}: {e}");
            None
        }
    }
}

/// Best-effort PTR lookup. Any failure, including a timeout, is `None`.
pub async fn reverse_lookup(resolver: &TokioAsyncResolver, ip: IpAddr) -> Option<String> {
    match tokio::time::timeout(REVERSE_LOOKUP_TIMEOUT, resolver.reverse_lookup(ip)).await {
        Ok(Ok(names)) => names
            .iter()
            .next()
            .map(|name| name.to_string().trim_end_matches('.').to_owned()),
        Ok(Err(e)) => {
            debug!("Reverse lookup of {ip} failed: {e}");
            None
        }
        Err(_) => {
            debug!("Reverse lookup of {ip} timed out");
            None
        }
    }
}

/// Derive a DNS resolver.
///
/// 1. if the `resolver` parameter has been set:
///     1. assume the parameter is a path and attempt to read IPs.
///     2. parse the input as a comma-separated list of IPs.
/// 2. if `resolver` is not set:
///    1. attempt to derive a resolver from the system config. (e.g.
///       `/etc/resolv.conf` on *nix).
///    2. finally, build a CloudFlare-based resolver (default
///       behaviour).
pub async fn get_resolver(resolver: Option<&str>) -> TokioAsyncResolver {
    build_resolver(resolver, |opts| opts).await
}

/// Same name servers as [`get_resolver`], tuned for best-effort PTR lookups:
/// one attempt bounded by [`REVERSE_LOOKUP_TIMEOUT`].
pub async fn get_reverse_resolver(resolver: Option<&str>) -> TokioAsyncResolver {
    build_resolver(resolver, reverse_lookup_opts).await
}

fn reverse_lookup_opts(mut opts: ResolverOpts) -> ResolverOpts {
    opts.timeout = REVERSE_LOOKUP_TIMEOUT;
    opts.attempts = 1;
    opts
}

async fn build_resolver(
    resolver: Option<&str>,
    tune: fn(ResolverOpts) -> ResolverOpts,
) -> TokioAsyncResolver {
    match resolver {
        Some(r) => {
            let mut config = ResolverConfig::new();
            let resolver_ips = match read_resolver_from_file(r).await {
                Ok(ips) => ips,
                Err(_) => r
                    .split(',')
                    .filter_map(|r| IpAddr::from_str(r.trim()).ok())
                    .collect::<Vec<_>>(),
            };
            for ip in resolver_ips {
                config.add_name_server(NameServerConfig::new(
                    SocketAddr::new(ip, 53),
                    Protocol::Udp,
                ));
            }
            TokioAsyncResolver::tokio(config, tune(ResolverOpts::default()))
        }
        None => match hickory_resolver::system_conf::read_system_conf() {
            Ok((config, opts)) => TokioAsyncResolver::tokio(config, tune(opts)),
            Err(e) => {
                debug!("No system resolver configuration ({e}), using Cloudflare");
                TokioAsyncResolver::tokio(ResolverConfig::cloudflare_tls(), tune(ResolverOpts::default()))
            }
        },
    }
}

/// Parses and input file of IPs for use in DNS resolution.
async fn read_resolver_from_file(path: &str) -> io::Result<Vec<IpAddr>> {
    let ips = fs::read_to_string(path)
        .await?
        .lines()
        .filter_map(|line| IpAddr::from_str(line.trim()).ok())
        .collect();

    Ok(ips)
}
