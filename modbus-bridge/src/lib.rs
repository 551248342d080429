//! Resilient Modbus client and register bridge.
//!
//! The crate talks to Modbus devices over TCP or RTU (serial) through a
//! client that retries transient failures and reconnects between
//! attempts. On top of it, a supervisor runs one periodic worker per
//! configured block, copying registers from a source endpoint to a
//! destination endpoint.
//!
//! # Register mapping
//!
//! ```text
//! coils             -> coils
//! discrete_inputs   -> coils
//! holding_registers -> holding_registers
//! input_registers   -> holding_registers
//! ```
//!
//! Local server endpoints (see [`server`]) expose an in-memory register
//! bank that can be persisted between runs.

pub mod board;
pub mod client;
pub mod codec;
pub mod config;
pub mod mock;
pub mod sensor;
pub mod server;
pub mod supervisor;
pub mod transport;
pub mod worker;

pub use client::{ClientError, ResilientClient};
pub use config::ModbusBridgeConfig;
pub use supervisor::BridgeSupervisor;
pub use transport::{Connector, ModbusConnector};
