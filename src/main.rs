#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::doc_markdown, clippy::if_not_else, clippy::non_ascii_literal)]

use std::fmt::Write as _;

use anyhow::bail;
use log::{debug, info};
use sweepscan::address::{get_resolver, get_reverse_resolver, resolve_target};
use sweepscan::discovery::{Discoverer, HostRecord};
use sweepscan::input::Opts;
use sweepscan::scanner::{Cancellation, ScanResult, Scanner};
use sweepscan::{detail, output, warning};

#[cfg(unix)]
const DEFAULT_FILE_DESCRIPTORS_LIMIT: u64 = 8000;
// Descriptors kept free for the resolver, stdio and the runtime itself.
#[cfg(unix)]
const RESERVED_FILE_DESCRIPTORS: u64 = 100;

/// Reads the command line and config file, runs a port scan or a host
/// discovery sweep and prints what it found.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    #[cfg(windows)]
    let _ = colored::control::set_virtual_terminal(true);

    env_logger::init();

    let mut opts: Opts = Opts::read();
    let config = opts.load_config()?;
    opts.merge(&config);
    // JSON goes to stdout, so nothing else may
    if opts.json {
        opts.greppable = true;
    }

    debug!("Main() `opts` arguments are {opts:?}");

    let Some(address) = opts.address.clone() else {
        bail!("No target given. Pass an IP, CIDR block or host name with --address.");
    };

    #[cfg(unix)]
    {
        let ulimit = adjust_ulimit_size(&opts);
        opts.workers = infer_workers(&opts, ulimit);
    }

    let cancel = Cancellation::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, stopping workers");
                cancel.cancel();
            }
        });
    }

    let resolver = get_resolver(opts.resolver.as_deref()).await;
    let target = resolve_target(&address, &resolver).await?;

    if opts.discover {
        let job = opts.discovery_job(target.block());
        detail!(
            format!("Sweeping {} with {} workers", job.network, job.concurrency),
            opts.greppable,
            opts.accessible
        );
        let hosts = Discoverer::new(job)?
            .with_resolver(get_reverse_resolver(opts.resolver.as_deref()).await)
            .run_until(&cancel)
            .await;
        print_hosts(&opts, &hosts)?;
    } else {
        let job = opts.scan_job(target);
        detail!(
            format!(
                "Scanning {} ports {} with {} workers",
                job.target, job.ports, job.concurrency
            ),
            opts.greppable,
            opts.accessible
        );
        let mut results = Scanner::new(job)?.run_until(&cancel).await;
        results.sort_unstable_by_key(|result| (result.host(), result.port()));
        print_results(&opts, &results)?;
    }

    if cancel.is_cancelled() {
        warning!(
            "Interrupted, the results above are partial.",
            opts.greppable,
            opts.accessible
        );
    }

    Ok(())
}

fn print_results(opts: &Opts, results: &[ScanResult]) -> anyhow::Result<()> {
    if opts.json {
        println!("{}", serde_json::to_string_pretty(results)?);
        return Ok(());
    }

    if results.is_empty() {
        warning!(empty_scan_message(opts), opts.greppable, opts.accessible);
        return Ok(());
    }

    for result in results {
        let mut line = format!("{} {}", result.unit(), result.state());
        if let Some(service) = result.service() {
            write!(line, " {service}")?;
        }
        if let Some(banner) = result.banner() {
            write!(line, " {:?}", banner.to_text())?;
        }

        if opts.greppable {
            println!("{line}");
        } else {
            output!(line, false, opts.accessible);
        }
    }
    Ok(())
}

fn empty_scan_message(opts: &Opts) -> &'static str {
    if opts.include_closed {
        "No ports were probed."
    } else {
        "Looks like I didn't find any open ports."
    }
}

fn print_hosts(opts: &Opts, hosts: &[HostRecord]) -> anyhow::Result<()> {
    if opts.json {
        println!("{}", serde_json::to_string_pretty(hosts)?);
        return Ok(());
    }

    if hosts.is_empty() {
        warning!("No live hosts with open ports found.", opts.greppable, opts.accessible);
        return Ok(());
    }

    for host in hosts {
        let mut line = host.ip().to_string();
        if let Some(name) = host.hostname() {
            write!(line, " ({name})")?;
        }
        let ports: Vec<String> = host
            .services()
            .iter()
            .map(|(port, service)| format!("{port}/{service}"))
            .collect();
        write!(line, " -> [{}]", ports.join(", "))?;

        if opts.greppable {
            println!("{line}");
        } else {
            output!(line, false, opts.accessible);
        }
    }
    Ok(())
}

#[cfg(unix)]
fn adjust_ulimit_size(opts: &Opts) -> u64 {
    use rlimit::Resource;

    if let Some(limit) = opts.ulimit {
        if Resource::NOFILE.set(limit, limit).is_ok() {
            detail!(
                format!("Automatically increasing ulimit value to {limit}."),
                opts.greppable,
                opts.accessible
            );
        } else {
            warning!("ERROR. Failed to set ulimit value.", opts.greppable, opts.accessible);
        }
    }

    Resource::NOFILE
        .get()
        .map_or(DEFAULT_FILE_DESCRIPTORS_LIMIT, |(soft, _)| soft)
}

/// Lowers the worker count when every worker holding a socket would exceed
/// the open file limit.
#[cfg(unix)]
fn infer_workers(opts: &Opts, ulimit: u64) -> usize {
    let wanted = u64::try_from(opts.workers).unwrap_or(u64::MAX);
    let available = ulimit.saturating_sub(RESERVED_FILE_DESCRIPTORS).max(1);

    if wanted <= available {
        return opts.workers;
    }

    warning!(
        format!("{wanted} workers exceed the open file limit of {ulimit}, using {available}."),
        opts.greppable,
        opts.accessible
    );
    if opts.ulimit.is_none() {
        detail!(
            "You can raise the limit with '--ulimit <limit>'.",
            opts.greppable,
            opts.accessible
        );
    }
    usize::try_from(available).unwrap_or(opts.workers)
}
