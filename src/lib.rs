//! Core functionality of the sweepscan connect scanner and host discovery
//! engine.
//!
//! sweepscan fans a potentially huge set of probes (every port of a range on
//! every address of a CIDR block) out over a fixed number of workers, while
//! keeping memory bounded by streaming the probes through a bounded queue.
//!
//! ## Architecture Overview
//!
//! 1. **Enumeration**: a [`Target`](crate::target::Target) and a
//!    [`PortRange`](crate::target::PortRange) lazily produce
//!    [`ScanUnit`](crate::target::ScanUnit)s, address-major.
//! 2. **Dispatch**: a [`WorkerPool`](crate::scanner::WorkerPool) of `W`
//!    workers drains a bounded queue filled by the producer.
//! 3. **Probing**: a [`Prober`](crate::scanner::Prober) makes one
//!    timeout-bounded connection per unit and optionally reads a banner.
//! 4. **Collection**: a single collector task appends every kept
//!    [`ScanResult`](crate::scanner::ScanResult).
//!
//! Host discovery ([`discovery`]) reuses the same pool over the addresses of
//! a block: each address gets a liveness check and, when alive, a short scan
//! of common ports.
//!
//! ## Basic Usage Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use sweepscan::scanner::{run_scan, ScanJob};
//! use sweepscan::target::{PortRange, Target};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let job = ScanJob {
//!     concurrency: 10,
//!     timeout: Duration::from_millis(100),
//!     banner_timeout: None,
//!     ..ScanJob::new("127.0.0.1".parse().unwrap(), PortRange::new(1, 100))
//! };
//!
//! for result in run_scan(job).await.unwrap() {
//!     println!("{} is open", result.unit());
//! }
//! # });
//! ```
//!
//! ## Host Discovery
//!
//! ```rust
//! use std::time::Duration;
//!
//! use sweepscan::discovery::{run_discovery, DiscoveryJob};
//! use sweepscan::target::CidrBlock;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let job = DiscoveryJob {
//!     liveness_timeout: Duration::from_millis(200),
//!     reverse_lookup: false,
//!     ..DiscoveryJob::new(CidrBlock::parse("127.0.0.1/32").unwrap())
//! };
//!
//! for host in run_discovery(job).await.unwrap() {
//!     println!("{} {:?}", host.ip(), host.open_ports());
//! }
//! # });
//! ```
#![allow(clippy::needless_doctest_main)]
#![warn(missing_docs)]

pub mod tui;

pub mod input;

pub mod scanner;

pub mod address;

pub mod discovery;

pub mod error;

pub mod service;

pub mod target;

pub use discovery::run_discovery;
pub use error::InvalidSpec;
pub use scanner::run_scan;
