//! mcblast - workload generator for memcached-compatible cache servers
//!
//! Speaks the classic text, meta text, and binary wire protocols from
//! scratch and drives them with a concurrent, statistically shaped load
//! engine: per-connection workers, uniform or Zipfian key selection, a
//! weighted delete/set/get mix, optional pipelining, and shared rate
//! limiting, with latency and outcome statistics merged into a JSON report.
//!
//! # Example
//!
//! ```no_run
//! use mcblast::Config;
//!
//! # async fn run() -> mcblast::Result<()> {
//! let conf = Config {
//!     servers: vec!["127.0.0.1:11211".to_string()],
//!     conn_count: 4,
//!     duration_secs: 30,
//!     ..Config::default()
//! };
//! let report = conf.run().await?;
//! report.pretty_print().ok();
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod control;
pub mod error;
pub mod keygen;
pub mod limiter;
pub mod report;
pub mod stats;
pub mod workload;
pub mod zipf;

pub use client::{BinStatus, Client, Item, MetaResponse, RespCode};
pub use control::{BasicConfig, WorkerGroup, WorkloadSpec};
pub use error::{McError, Result};
pub use limiter::Limiter;
pub use report::Report;
pub use stats::{LatencySampler, Metrics, Stats};
pub use workload::{generate_entries, CacheEntry, Config, Protocol};
pub use zipf::ZipfSampler;
