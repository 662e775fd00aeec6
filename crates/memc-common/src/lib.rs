//! memc-load common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Ambient functionality shared by the memc-load binaries:
//!
//! - **Error Handling**: the setup error type and result alias
//! - **Logging**: tracing subscriber configuration and initialisation
//!
//! # Example
//!
//! ```no_run
//! use memc_common::logging::{init_logging, LogConfig};
//! use tracing::info;
//!
//! fn main() -> memc_common::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     info!("Loader started");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
