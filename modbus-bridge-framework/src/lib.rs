//! Modbus Bridge Framework
//!
//! Lifecycle plumbing shared by the bridge binaries.
//!
//! # Overview
//!
//! This framework provides:
//! - [`BridgeConfig`] trait for configuration loading and validation
//! - [`BridgeRunner`] for managing bridge lifecycle (startup, shutdown, signal handling)
//! - [`BridgeArgs`] for common CLI argument parsing
//!
//! # Example
//!
//! ```ignore
//! use modbus_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = BridgeArgs::parse_with_default("mybridge.json5");
//!     let config = MyBridgeConfig::load(&args.config)?;
//!
//!     let mut runner = BridgeRunner::new("mybridge", config, Some(&args))?;
//!     runner.spawn(my_worker());
//!
//!     // Run until Ctrl+C, then release resources
//!     runner.run(|| async { /* shutdown */ }).await
//! }
//! ```

mod args;
mod config;
mod error;
mod runner;

pub use args::BridgeArgs;
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use runner::BridgeRunner;

// Re-export commonly used types from modbus-bridge-common
pub use modbus_bridge_common::{Format, LogFormat, LoggingConfig};
