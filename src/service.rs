//! Maps a captured banner and a port number to a service label.
//!
//! The scanner only calls [`ServiceClassifier::identify`]; swapping in a
//! richer fingerprinting engine means implementing the trait.
use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use serde_derive::Serialize;

/// Label given to anything the classifier cannot place.
pub const UNKNOWN_SERVICE: &str = "unknown";

static WELL_KNOWN_PORTS: Lazy<HashMap<u16, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (21, "ftp"),
        (22, "ssh"),
        (23, "telnet"),
        (25, "smtp"),
        (53, "dns"),
        (80, "http"),
        (110, "pop3"),
        (143, "imap"),
        (443, "https"),
        (3306, "mysql"),
        (5432, "postgresql"),
        (8080, "http-proxy"),
    ])
});

// Checked in order, the first keyword hit wins. "220" greets both ftp and
// smtp, so ftp-specific keywords come first.
const BANNER_KEYWORDS: &[(&str, &[&str])] = &[
    ("ssh", &["openssh", "ssh-2.0", "ssh-1.", "dropbear"]),
    ("ftp", &["vsftpd", "proftpd", "pure-ftpd", "filezilla", " ftp"]),
    ("smtp", &["esmtp", "postfix", "sendmail", "exim", " smtp"]),
    ("http", &["http/1", "http/2", "server:", "apache", "nginx", "iis"]),
    ("pop3", &["+ok", "pop3"]),
    ("imap", &["* ok", "imap"]),
    ("mysql", &["mysql", "mariadb"]),
    ("postgresql", &["postgresql"]),
    ("telnet", &["login:", "password:"]),
];

/// Service name and, when one could be read off the banner, its version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ServiceLabel {
    /// Short service name such as `ssh`.
    pub name: String,
    /// Version token taken from the banner.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ServiceLabel {
    /// A label without version.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    /// The `unknown` label.
    pub fn unknown() -> Self {
        Self::new(UNKNOWN_SERVICE)
    }

    /// Whether this is the `unknown` label.
    pub fn is_unknown(&self) -> bool {
        self.name == UNKNOWN_SERVICE
    }
}

impl fmt::Display for ServiceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{} {version}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Pure mapping from `(banner, port)` to a label.
///
/// Implementations are shared between workers, so they must not rely on
/// interior mutability for correctness.
pub trait ServiceClassifier: Send + Sync {
    /// Labels an open port. `banner` is empty when nothing was captured.
    fn identify(&self, banner: &[u8], port: u16) -> ServiceLabel;
}

/// Well-known port name, if any.
pub fn port_service(port: u16) -> Option<&'static str> {
    WELL_KNOWN_PORTS.get(&port).copied()
}

/// Banner keywords first, then the well-known port table.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultClassifier;

impl ServiceClassifier for DefaultClassifier {
    fn identify(&self, banner: &[u8], port: u16) -> ServiceLabel {
        let text = String::from_utf8_lossy(banner);
        let lowered = text.to_lowercase();

        let by_banner = BANNER_KEYWORDS.iter().find_map(|(service, keywords)| {
            keywords
                .iter()
                .any(|keyword| lowered.contains(keyword))
                .then_some(*service)
        });

        match by_banner {
            Some(name) => ServiceLabel {
                name: name.to_owned(),
                version: extract_version(&text),
            },
            None => port_service(port).map_or_else(ServiceLabel::unknown, |name| ServiceLabel::new(name)),
        }
    }
}

/// Only consults the port table, never the banner.
#[derive(Debug, Default, Clone, Copy)]
pub struct PortTableClassifier;

impl ServiceClassifier for PortTableClassifier {
    fn identify(&self, _banner: &[u8], port: u16) -> ServiceLabel {
        port_service(port).map_or_else(ServiceLabel::unknown, |name| ServiceLabel::new(name))
    }
}

/// First whitespace-separated token that starts with a digit and carries a dot,
/// after stripping a `name/` or `name_` product prefix (`OpenSSH_8.9p1`,
/// `nginx/1.25.3`).
fn extract_version(banner: &str) -> Option<String> {
    banner
        .split_whitespace()
        .map(|token| token.rsplit(['/', '_']).next().unwrap_or(token))
        .map(|token| token.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '.'))
        .find(|token| token.starts_with(|c: char| c.is_ascii_digit()) && token.contains('.'))
        .map(str::to_owned)
}
