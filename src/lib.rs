//! Transparent proxy for memcached and Redis server pools.
//!
//! `porter` terminates the client wire protocol (memcached text, memcached
//! binary, or Redis RESP2), decodes pipelined requests, routes each one over
//! a ketama consistent-hash ring, batches co-routed requests per backend,
//! dispatches the batches concurrently, and re-encodes the responses in the
//! order the client issued them.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use porter::{spawn_cluster, CacheType, ClusterConfig, ProxyMetrics};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> porter::Result<()> {
//!     let cc = ClusterConfig::new("sessions", CacheType::Redis, "0.0.0.0:26379")
//!         .with_servers(&["10.0.0.1:6379:1", "10.0.0.2:6379:1"]);
//!     let cancel = CancellationToken::new();
//!     spawn_cluster(cc, Arc::new(ProxyMetrics::new()), cancel.clone()).await?;
//!     // ... run until shutdown ...
//!     cancel.cancel();
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! client ──▶ codec.decode ──▶ router.dispatch ──▶ node.write_batch
//!    ▲                                                   │
//!    └── codec.encode ◀── frame latch ◀── node.read_batch┘
//! ```
//!
//! The hot path holds no lock across a suspension point: the ring is an
//! atomically swapped snapshot, each backend socket is owned by exactly one
//! worker task, and per-frame completion is a channel acting as a countdown
//! latch.

pub mod bufio;
pub mod cluster;
pub mod config;
pub mod error;
pub mod metrics;
pub mod proto;
pub mod proxy;

pub use cluster::ring::{HashDistribution, HashMethod, Ring, RingBuilder};
pub use cluster::{Backend, Cluster};
pub use config::{ClusterConfig, ClusterConfigs, Config, ListenProto};
pub use error::{Error, Result};
pub use metrics::ProxyMetrics;
pub use proto::{CacheType, Message, Request};
pub use proxy::{spawn_cluster, spawn_stat_listener};
