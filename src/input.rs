//! Provides a means to read, parse and hold configuration options for scans.
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_derive::Deserialize;

use crate::discovery::DiscoveryJob;
use crate::scanner::ScanJob;
use crate::target::{CidrBlock, PortRange, Protocol, Target};

const CONFIG_FILE_NAME: &str = ".sweepscan.toml";

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sweepscan",
    version = env!("CARGO_PKG_VERSION"),
    max_term_width = 120,
    help_template = "{bin} {version}\n{about}\n\nUSAGE:\n    {usage}\n\nOPTIONS:\n{options}",
)]
#[allow(clippy::struct_excessive_bools)]
/// Concurrent connect scanner and CIDR host discovery.
/// WARNING Do not use this program against infrastructure you are not
/// allowed to probe.
pub struct Opts {
    /// An IP address, a CIDR block or a host name to scan. With --discover,
    /// the CIDR block to sweep.
    #[arg(short, long)]
    pub address: Option<String>,

    /// Inclusive port range to scan. Examples: 1-1000 or 443.
    #[arg(short, long, default_value = "1-65535")]
    pub range: PortRange,

    /// Whether to ignore the configuration file or not.
    #[arg(short, long)]
    pub no_config: bool,

    /// Custom path to config file
    #[arg(short, long, value_parser)]
    pub config_path: Option<PathBuf>,

    /// Greppable mode. Only output the results, one per line.
    #[arg(short, long)]
    pub greppable: bool,

    /// Accessible mode. Turns off features which negatively affect screen readers.
    #[arg(long)]
    pub accessible: bool,

    /// Print the results as a JSON array instead of text.
    #[arg(long)]
    pub json: bool,

    /// A comma-delimited list or file of DNS resolvers.
    #[arg(long)]
    pub resolver: Option<String>,

    /// Number of concurrent workers. Depends on the open file limit of
    /// your OS.
    #[arg(short, long, default_value = "50")]
    pub workers: usize,

    /// The timeout in milliseconds before a port is assumed to be closed.
    #[arg(short, long, default_value = "3000")]
    pub timeout: u64,

    /// How long, in milliseconds, to wait for a service to greet us after
    /// connecting.
    #[arg(long, default_value = "2000")]
    pub banner_timeout: u64,

    /// Connect only, never read banners.
    #[arg(long)]
    pub no_banner_grab: bool,

    /// Automatically ups the ULIMIT with the value you provided.
    #[arg(short, long)]
    pub ulimit: Option<u64>,

    /// UDP scanning mode. Any port that accepts a UDP "connect" is reported
    /// open.
    #[arg(long)]
    pub udp: bool,

    /// Also report closed ports.
    #[arg(long)]
    pub include_closed: bool,

    /// Sweep the address block for live hosts instead of scanning a range.
    #[arg(long)]
    pub discover: bool,

    /// Discovery: connect timeout in milliseconds of each liveness check.
    #[arg(long, default_value = "1000")]
    pub liveness_timeout: u64,

    /// Discovery: connect timeout in milliseconds of each port scanned on a
    /// live host.
    #[arg(long, default_value = "1000")]
    pub host_port_timeout: u64,

    /// Discovery: do not look up host names of live hosts.
    #[arg(long)]
    pub no_reverse_lookup: bool,
}

#[cfg(not(tarpaulin_include))]
impl Opts {
    /// Parses the command line.
    pub fn read() -> Self {
        Self::parse()
    }

    /// Reads the command line arguments into an Opts struct and merge
    /// values found within the user configuration file.
    pub fn merge(&mut self, config: &Config) {
        if !self.no_config {
            self.merge_required(config);
            self.merge_optional(config);
        }
    }

    fn merge_required(&mut self, config: &Config) {
        macro_rules! merge_required {
            ($($field: ident),+) => {
                $(
                    if let Some(e) = &config.$field {
                        self.$field = e.clone();
                    }
                )+
            }
        }

        merge_required!(
            range,
            greppable,
            accessible,
            json,
            workers,
            timeout,
            banner_timeout,
            no_banner_grab,
            udp,
            include_closed,
            liveness_timeout,
            host_port_timeout,
            no_reverse_lookup
        );
    }

    fn merge_optional(&mut self, config: &Config) {
        macro_rules! merge_optional {
            ($($field: ident),+) => {
                $(
                    if config.$field.is_some() {
                        self.$field = config.$field.clone();
                    }
                )+
            }
        }

        // The command line target wins over the configured one
        if self.address.is_none() {
            self.address = config.address.clone();
        }

        merge_optional!(resolver, ulimit);
    }

    /// The configuration file to merge, or an empty one under
    /// `--no-config` so a broken file cannot get in the way.
    pub fn load_config(&self) -> anyhow::Result<Config> {
        if self.no_config {
            return Ok(Config::default());
        }
        Config::read(self.config_path.clone())
    }

    /// Port scan of `target` with these options.
    pub fn scan_job(&self, target: Target) -> ScanJob {
        ScanJob {
            concurrency: self.workers,
            timeout: Duration::from_millis(self.timeout),
            banner_timeout: (!self.no_banner_grab)
                .then(|| Duration::from_millis(self.banner_timeout)),
            protocol: if self.udp { Protocol::Udp } else { Protocol::Tcp },
            include_closed: self.include_closed,
            ..ScanJob::new(target, self.range)
        }
    }

    /// Host discovery over `network` with these options.
    pub fn discovery_job(&self, network: CidrBlock) -> DiscoveryJob {
        DiscoveryJob {
            concurrency: self.workers,
            liveness_timeout: Duration::from_millis(self.liveness_timeout),
            port_timeout: Duration::from_millis(self.host_port_timeout),
            reverse_lookup: !self.no_reverse_lookup,
            ..DiscoveryJob::new(network)
        }
    }
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            address: None,
            range: PortRange::default(),
            no_config: true,
            config_path: None,
            greppable: true,
            accessible: false,
            json: false,
            resolver: None,
            workers: 0,
            timeout: 0,
            banner_timeout: 0,
            no_banner_grab: false,
            ulimit: None,
            udp: false,
            include_closed: false,
            discover: false,
            liveness_timeout: 0,
            host_port_timeout: 0,
            no_reverse_lookup: false,
        }
    }
}

/// Struct used to deserialize the options specified within our config file.
/// These will be further merged with our command line arguments in order to
/// generate the final Opts struct.
#[cfg(not(tarpaulin_include))]
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    address: Option<String>,
    range: Option<PortRange>,
    greppable: Option<bool>,
    accessible: Option<bool>,
    json: Option<bool>,
    workers: Option<usize>,
    timeout: Option<u64>,
    banner_timeout: Option<u64>,
    no_banner_grab: Option<bool>,
    ulimit: Option<u64>,
    resolver: Option<String>,
    udp: Option<bool>,
    include_closed: Option<bool>,
    liveness_timeout: Option<u64>,
    host_port_timeout: Option<u64>,
    no_reverse_lookup: Option<bool>,
}

#[cfg(not(tarpaulin_include))]
#[allow(clippy::doc_link_with_quotes)]
impl Config {
    /// Reads the configuration file with TOML format and parses it into a
    /// Config struct. A missing file is an empty config.
    ///
    /// # Format
    ///
    /// address = "192.168.0.0/24"
    /// range = { start = 1, end = 1000 }
    /// workers = 200
    /// timeout = 1500
    /// greppable = true
    /// udp = false
    ///
    pub fn read(custom_config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let Some(config_path) = custom_config_path.or_else(default_config_path) else {
            return Ok(Self::default());
        };
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Could not read {}", config_path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Invalid configuration file {}", config_path.display()))
    }

    fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// Constructs default path to config toml
pub fn default_config_path() -> Option<PathBuf> {
    let mut config_path = dirs::home_dir()?;
    config_path.push(CONFIG_FILE_NAME);
    Some(config_path)
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};
    use parameterized::parameterized;
    use std::time::Duration;

    use super::{Config, Opts};
    use crate::target::{CidrBlock, PortRange, Protocol, Target};

    fn sample_config() -> Config {
        Config {
            address: Some("10.0.0.0/30".to_owned()),
            greppable: Some(true),
            workers: Some(200),
            timeout: Some(1_000),
            accessible: Some(true),
            udp: Some(false),
            ..Config::default()
        }
    }

    #[test]
    fn verify_cli() {
        Opts::command().debug_assert();
    }

    #[test]
    fn cli_defaults() {
        let opts = Opts::parse_from(["sweepscan", "-a", "127.0.0.1"]);

        assert_eq!(opts.address.as_deref(), Some("127.0.0.1"));
        assert_eq!(opts.range, PortRange::new(1, 65535));
        assert_eq!(opts.workers, 50);
        assert_eq!(opts.timeout, 3000);
        assert_eq!(opts.banner_timeout, 2000);
        assert_eq!(opts.liveness_timeout, 1000);
        assert!(!opts.discover);
    }

    #[parameterized(input = {
        vec!["sweepscan", "-a", "127.0.0.1", "-r", "20-25"],
        vec!["sweepscan", "-a", "127.0.0.1", "--range", "443"],
        vec!["sweepscan", "-a", "127.0.0.1", "-r", "9-5"],
    }, range = {
        PortRange::new(20, 25),
        PortRange::new(443, 443),
        PortRange::new(9, 5),
    })]
    fn parse_range(input: Vec<&str>, range: PortRange) {
        let opts = Opts::parse_from(input);
        assert_eq!(opts.range, range);
    }

    #[test]
    fn malformed_range_is_rejected() {
        assert!(Opts::try_parse_from(["sweepscan", "-r", "1-2-3"]).is_err());
        assert!(Opts::try_parse_from(["sweepscan", "-r", "0-10"]).is_err());
    }

    #[test]
    fn opts_no_merge_when_config_is_ignored() {
        let mut opts = Opts::default();
        let config = sample_config();

        opts.merge(&config);

        assert_eq!(opts.address, None);
        assert!(opts.greppable);
        assert!(!opts.accessible);
        assert_eq!(opts.timeout, 0);
        assert_eq!(opts.workers, 0);
    }

    #[test]
    fn opts_merge_required_arguments() {
        let mut opts = Opts::default();
        let config = sample_config();

        opts.merge_required(&config);

        assert_eq!(opts.greppable, config.greppable.unwrap());
        assert_eq!(opts.timeout, config.timeout.unwrap());
        assert_eq!(opts.workers, config.workers.unwrap());
        assert_eq!(opts.accessible, config.accessible.unwrap());
        assert_eq!(opts.range, PortRange::default());
    }

    #[test]
    fn opts_merge_optional_arguments() {
        let mut opts = Opts::default();
        let mut config = sample_config();
        config.ulimit = Some(1_000);
        config.resolver = Some("1.1.1.1".to_owned());

        opts.merge_optional(&config);

        assert_eq!(opts.address, config.address);
        assert_eq!(opts.ulimit, config.ulimit);
        assert_eq!(opts.resolver, config.resolver);
    }

    #[test]
    fn cli_address_wins_over_config() {
        let mut opts = Opts {
            address: Some("127.0.0.1".to_owned()),
            ..Opts::default()
        };

        opts.merge_optional(&sample_config());

        assert_eq!(opts.address.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn config_parses_from_toml() {
        let config = Config::parse(
            r#"
            address = "192.168.0.0/24"
            range = { start = 1, end = 1000 }
            workers = 10
            include_closed = true
            "#,
        )
        .unwrap();

        assert_eq!(config.address.as_deref(), Some("192.168.0.0/24"));
        assert_eq!(config.range, Some(PortRange::new(1, 1000)));
        assert_eq!(config.workers, Some(10));
        assert_eq!(config.include_closed, Some(true));
    }

    #[test]
    fn unknown_value_type_is_an_error() {
        assert!(Config::parse("workers = \"many\"").is_err());
    }

    #[test]
    fn broken_config_is_skipped_under_no_config() {
        let path = std::env::temp_dir().join(format!("sweepscan-broken-{}.toml", std::process::id()));
        std::fs::write(&path, "workers = [").unwrap();

        let ignoring = Opts {
            config_path: Some(path.clone()),
            ..Opts::default()
        };
        let reading = Opts {
            no_config: false,
            ..ignoring.clone()
        };
        let ignored = ignoring.load_config();
        let read = reading.load_config();
        std::fs::remove_file(&path).unwrap();

        assert!(ignored.unwrap().workers.is_none());
        assert!(read.is_err());
    }

    #[test]
    fn scan_job_follows_options() {
        let opts = Opts::parse_from([
            "sweepscan",
            "-r",
            "1-10",
            "-w",
            "8",
            "-t",
            "250",
            "--no-banner-grab",
            "--udp",
            "--include-closed",
        ]);
        let target = Target::Host("127.0.0.1".parse().unwrap());

        let job = opts.scan_job(target);

        assert_eq!(job.target, target);
        assert_eq!(job.ports, PortRange::new(1, 10));
        assert_eq!(job.concurrency, 8);
        assert_eq!(job.timeout, Duration::from_millis(250));
        assert_eq!(job.banner_timeout, None);
        assert_eq!(job.protocol, Protocol::Udp);
        assert!(job.include_closed);
    }

    #[test]
    fn discovery_job_follows_options() {
        let opts = Opts::parse_from([
            "sweepscan",
            "--discover",
            "--liveness-timeout",
            "300",
            "--host-port-timeout",
            "400",
            "--no-reverse-lookup",
        ]);
        let network = CidrBlock::parse("10.0.0.0/30").unwrap();

        let job = opts.discovery_job(network);

        assert_eq!(job.network, network);
        assert_eq!(job.concurrency, 50);
        assert_eq!(job.liveness_timeout, Duration::from_millis(300));
        assert_eq!(job.port_timeout, Duration::from_millis(400));
        assert!(!job.reverse_lookup);
    }
}
