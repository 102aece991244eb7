//! One timeout-bounded connection attempt per unit.
//!
//! All durations are wall-clock [`Duration`]s. A probe makes exactly one
//! connection attempt; refused, timed out and unreachable are all reported
//! as [`PortState::Closed`]. There is no separate "filtered" state.
//!
//! # UDP
//!
//! A UDP "connect" only records the peer address locally, so it succeeds
//! for nearly every reachable route whether or not anything listens on the
//! port. UDP units therefore come back open unless the local socket could
//! not be set up at all. This mirrors connect-scan semantics and is a known
//! false-positive source; treat UDP results as "not provably closed".
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use log::debug;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time;

use super::{Banner, ScanResult};
use crate::target::{Protocol, ScanUnit};

/// Connect deadline for port probes.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
/// Read deadline for banner capture.
pub const DEFAULT_BANNER_TIMEOUT: Duration = Duration::from_secs(2);
/// Connect deadline for host liveness probes.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(1);

const BANNER_BUFFER_SIZE: usize = 1024;

/// Runs single probes. Cheap to clone and share across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prober {
    timeout: Duration,
    banner_timeout: Option<Duration>,
}

impl Prober {
    /// A prober that connects with `timeout` and does not read banners.
    pub const fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            banner_timeout: None,
        }
    }

    /// Enables banner capture with the given read deadline.
    #[must_use]
    pub const fn with_banner_timeout(mut self, banner_timeout: Option<Duration>) -> Self {
        self.banner_timeout = banner_timeout;
        self
    }

    /// Connect deadline.
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probes one unit. Never fails: every failure becomes a closed result.
    pub async fn probe(&self, unit: ScanUnit) -> ScanResult {
        match unit.protocol {
            Protocol::Tcp => self.probe_tcp(unit).await,
            Protocol::Udp => self.probe_udp(unit).await,
        }
    }

    /// TCP connect without banner capture. Used for liveness checks and the
    /// per-host sub-scan of discovery.
    pub async fn is_open(&self, socket: SocketAddr) -> bool {
        match self.connect(socket).await {
            Ok(mut stream) => {
                if let Err(e) = stream.shutdown().await {
                    debug!("Shutdown stream error {e}");
                }
                true
            }
            Err(e) => {
                debug!("{socket} is not accepting connections: {e}");
                false
            }
        }
    }

    async fn probe_tcp(&self, unit: ScanUnit) -> ScanResult {
        let socket = unit.socket();
        let mut stream = match self.connect(socket).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("{unit} closed: {e}");
                return ScanResult::closed(unit);
            }
        };
        debug!("Connection to {unit} was successful");

        let banner = match self.banner_timeout {
            Some(wait) => read_banner(&mut stream, wait).await,
            None => None,
        };

        // The stream is dropped right after, shutdown just makes the close
        // graceful.
        if let Err(e) = stream.shutdown().await {
            debug!("Shutdown stream error {e}");
        }

        ScanResult::open(unit, banner)
    }

    async fn probe_udp(&self, unit: ScanUnit) -> ScanResult {
        let socket = match time::timeout(self.timeout, udp_connect(unit.socket())).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                debug!("{unit} closed: {e}");
                return ScanResult::closed(unit);
            }
            Err(_) => {
                debug!("{unit} closed: UDP setup timed out");
                return ScanResult::closed(unit);
            }
        };

        let banner = match self.banner_timeout {
            Some(wait) => {
                let mut buffer = [0u8; BANNER_BUFFER_SIZE];
                match time::timeout(wait, socket.recv(&mut buffer)).await {
                    Ok(Ok(read)) => Banner::from_bytes(&buffer[..read]),
                    Ok(Err(e)) => {
                        debug!("UDP read from {unit} failed: {e}");
                        None
                    }
                    Err(_) => None,
                }
            }
            None => None,
        };

        ScanResult::open(unit, banner)
    }

    async fn connect(&self, socket: SocketAddr) -> io::Result<TcpStream> {
        time::timeout(self.timeout, async move { TcpStream::connect(socket).await }).await?
    }
}

impl Default for Prober {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT).with_banner_timeout(Some(DEFAULT_BANNER_TIMEOUT))
    }
}

/// Reads at most one buffer. Timeout, end of stream and read errors all
/// mean "no banner".
async fn read_banner(stream: &mut TcpStream, wait: Duration) -> Option<Banner> {
    let mut buffer = [0u8; BANNER_BUFFER_SIZE];
    match time::timeout(wait, stream.read(&mut buffer)).await {
        Ok(Ok(read)) => Banner::from_bytes(&buffer[..read]),
        Ok(Err(e)) => {
            debug!("Banner read error {e}");
            None
        }
        Err(_) => None,
    }
}

async fn udp_connect(socket: SocketAddr) -> io::Result<UdpSocket> {
    let local: SocketAddr = match socket {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };

    let udp = UdpSocket::bind(local).await?;
    udp.connect(socket).await?;
    Ok(udp)
}

#[cfg(test)]
mod tests {
    use super::Prober;
    use crate::scanner::PortState;
    use crate::target::{Protocol, ScanUnit};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::{Duration, Instant};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn prober() -> Prober {
        Prober::new(Duration::from_millis(500)).with_banner_timeout(Some(Duration::from_millis(300)))
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn open_port_with_banner() {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.write_all(b"  SSH-2.0-Test\r\n").await.unwrap();
        });

        let result = prober().probe(ScanUnit::new(LOCALHOST, port, Protocol::Tcp)).await;

        assert_eq!(result.state(), PortState::Open);
        assert_eq!(result.banner().unwrap().as_bytes(), b"SSH-2.0-Test");
    }

    #[tokio::test]
    async fn silent_service_is_open_without_banner() {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            // EOF once the prober releases its side
            conn.read(&mut buf).await.unwrap()
        });

        let result = prober().probe(ScanUnit::new(LOCALHOST, port, Protocol::Tcp)).await;

        assert!(result.is_open());
        assert!(result.banner().is_none());
        assert_eq!(server.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn immediate_close_is_open_without_banner() {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            drop(conn);
        });

        let result = prober().probe(ScanUnit::new(LOCALHOST, port, Protocol::Tcp)).await;

        assert!(result.is_open());
        assert!(result.banner().is_none());
    }

    #[tokio::test]
    async fn refused_port_is_closed() {
        let port = unused_port().await;
        let result = prober().probe(ScanUnit::new(LOCALHOST, port, Protocol::Tcp)).await;

        assert_eq!(result.state(), PortState::Closed);
        assert!(result.banner().is_none());
        assert!(result.service().is_none());
    }

    #[tokio::test]
    async fn unreachable_host_is_closed_within_deadline() {
        let unit = ScanUnit::new(IpAddr::V4(Ipv4Addr::new(10, 255, 255, 1)), 81, Protocol::Tcp);
        let started = Instant::now();

        let result = Prober::new(Duration::from_millis(200)).probe(unit).await;

        assert_eq!(result.state(), PortState::Closed);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn is_open_matches_listener() {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let open = listener.local_addr().unwrap();
        let closed = SocketAddr::new(LOCALHOST, unused_port().await);

        assert!(prober().is_open(open).await);
        assert!(!prober().is_open(closed).await);
    }

    #[tokio::test]
    async fn udp_connect_success_counts_as_open() {
        // Nothing listens here; UDP connect still succeeds.
        let port = unused_port().await;
        let result = Prober::new(Duration::from_millis(200))
            .probe(ScanUnit::new(LOCALHOST, port, Protocol::Udp))
            .await;

        assert!(result.is_open());
        assert_eq!(result.protocol(), Protocol::Udp);
    }
}
