//! memc-load library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Loads gzip-compressed "apps installed" logs into memcached, one cache per
//! device type.
//!
//! # Pipeline
//!
//! - **Ingestion**: one blocking stage per source file parses lines and
//!   routes them to an endpoint ([`pipeline::ingest`])
//! - **Workers**: a fixed pool writes protobuf payloads with reconnect
//!   backoff ([`writer`], [`pipeline::worker`])
//! - **Aggregation**: outcomes are tallied into processed/errors and judged
//!   against an error-rate threshold ([`pipeline::aggregator`],
//!   [`pipeline::gate`])
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use memc_load::config::LoadConfig;
//! use memc_load::endpoints::EndpointTable;
//! use memc_load::pipeline::RunCoordinator;
//! use memc_load::retry::SeededJitter;
//! use memc_load::writer::CacheWriter;
//!
//! #[tokio::main]
//! async fn main() -> memc_load::error::Result<()> {
//!     let config = Arc::new(LoadConfig::default());
//!     let table = EndpointTable::connect(&config.device_endpoints, config.workers, config.io_timeout());
//!     let writer = CacheWriter::new(config.retry.clone(), Arc::new(SeededJitter::from_entropy()));
//!
//!     let report = RunCoordinator::new(config, Arc::new(table), writer).run().await?;
//!     println!("{:?}", report.verdict);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod endpoints;
pub mod error;
pub mod memcache;
pub mod pipeline;
pub mod proto;
pub mod record;
pub mod retry;
pub mod source;
pub mod testing;
pub mod writer;

pub use config::LoadConfig;
pub use error::{LoadError, Result};
