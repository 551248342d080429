//! Transport seam between the resilient client and the Modbus wire library.
//!
//! A [`Connector`] turns an [`EndpointConfig`] into a connected
//! [`Transport`]. Construction is all it does: retry and reconnect policy
//! live in [`crate::client`]. [`ModbusConnector`] is the production
//! connector, built on `tokio-modbus` and `tokio-serial`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{error::Elapsed, timeout};
use tokio_modbus::ExceptionCode;
use tokio_modbus::client::{Context, Reader, Writer};
use tokio_modbus::prelude::*;
use tracing::debug;

use crate::config::{EndpointConfig, EndpointUri, Parity};

/// Boxed future borrowed from a transport for one operation.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Modbus exception: {0:?}")]
    Exception(ExceptionCode),
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("Invalid endpoint: {0}")]
    Config(String),
}

/// A connected Modbus client handle.
///
/// Implementations are not required to be internally synchronized: the
/// resilient client owns its transport exclusively.
#[async_trait]
pub trait Transport: Send {
    /// Select the unit/server addressed by the following requests.
    fn set_unit(&mut self, unit: u8);

    async fn read_coils(&mut self, address: u16, quantity: u16) -> Result<Vec<bool>, TransportError>;

    async fn read_discrete_inputs(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>, TransportError>;

    async fn read_holding_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, TransportError>;

    async fn read_input_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, TransportError>;

    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<(), TransportError>;

    async fn write_multiple_coils(
        &mut self,
        address: u16,
        values: &[bool],
    ) -> Result<(), TransportError>;

    async fn write_multiple_registers(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> Result<(), TransportError>;

    /// Release the underlying connection.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Builds connected transports from endpoint configuration.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, endpoint: &EndpointConfig) -> Result<Box<dyn Transport>, TransportError>;
}

/// Connector backed by `tokio-modbus` (TCP and RTU).
///
/// ASCII endpoints are valid configuration but `tokio-modbus` has no ASCII
/// framing, so opening one fails with [`TransportError::Unsupported`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ModbusConnector;

#[async_trait]
impl Connector for ModbusConnector {
    async fn open(&self, endpoint: &EndpointConfig) -> Result<Box<dyn Transport>, TransportError> {
        let uri = endpoint
            .uri()
            .map_err(|e| TransportError::Config(e.to_string()))?;
        let io_timeout = endpoint.timeout();

        let ctx = match &uri {
            EndpointUri::Tcp { host, port } => {
                let slave = endpoint.server_id.map(Slave).unwrap_or_else(Slave::tcp_device);
                let addr = tokio::net::lookup_host((host.as_str(), *port))
                    .await
                    .map_err(|e| TransportError::Connect(format!("Resolve {}: {}", host, e)))?
                    .next()
                    .ok_or_else(|| TransportError::Connect(format!("No address for {}", host)))?;

                timeout(io_timeout, tcp::connect_slave(addr, slave))
                    .await
                    .map_err(|_| TransportError::Timeout(io_timeout))?
                    .map_err(|e| TransportError::Connect(e.to_string()))?
            }
            EndpointUri::Rtu { path } => {
                let slave = Slave(endpoint.server_id.unwrap_or(1));
                let builder = tokio_serial::new(path, endpoint.speed)
                    .parity(serial_parity(endpoint.parity))
                    .stop_bits(serial_stop_bits(endpoint.stop_bits))
                    .data_bits(serial_data_bits(endpoint.effective_data_bits()))
                    .timeout(io_timeout);

                let serial = tokio_serial::SerialStream::open(&builder).map_err(|e| {
                    TransportError::Connect(format!("Serial open {} failed: {}", path, e))
                })?;
                rtu::attach_slave(serial, slave)
            }
            EndpointUri::Ascii { .. } => {
                return Err(TransportError::Unsupported(format!(
                    "ascii framing is not available for {}",
                    uri
                )));
            }
        };

        debug!(endpoint = %endpoint.name, uri = %uri, "Transport opened");
        Ok(Box::new(ModbusTransport {
            ctx,
            timeout: io_timeout,
        }))
    }
}

fn serial_parity(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    }
}

fn serial_stop_bits(stop_bits: u8) -> tokio_serial::StopBits {
    match stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    }
}

fn serial_data_bits(data_bits: u8) -> tokio_serial::DataBits {
    match data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    }
}

/// A `tokio-modbus` client context with every call bounded by a timeout.
struct ModbusTransport {
    ctx: Context,
    timeout: Duration,
}

type ModbusOutcome<T> = Result<Result<Result<T, ExceptionCode>, tokio_modbus::Error>, Elapsed>;

fn flatten<T>(outcome: ModbusOutcome<T>, limit: Duration) -> Result<T, TransportError> {
    outcome
        .map_err(|_| TransportError::Timeout(limit))?
        .map_err(|e| TransportError::Io(e.to_string()))?
        .map_err(TransportError::Exception)
}

#[async_trait]
impl Transport for ModbusTransport {
    fn set_unit(&mut self, unit: u8) {
        self.ctx.set_slave(Slave(unit));
    }

    async fn read_coils(&mut self, address: u16, quantity: u16) -> Result<Vec<bool>, TransportError> {
        let outcome = timeout(self.timeout, self.ctx.read_coils(address, quantity)).await;
        flatten(outcome, self.timeout)
    }

    async fn read_discrete_inputs(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>, TransportError> {
        let outcome = timeout(self.timeout, self.ctx.read_discrete_inputs(address, quantity)).await;
        flatten(outcome, self.timeout)
    }

    async fn read_holding_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let outcome =
            timeout(self.timeout, self.ctx.read_holding_registers(address, quantity)).await;
        flatten(outcome, self.timeout)
    }

    async fn read_input_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let outcome = timeout(self.timeout, self.ctx.read_input_registers(address, quantity)).await;
        flatten(outcome, self.timeout)
    }

    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<(), TransportError> {
        let outcome = timeout(self.timeout, self.ctx.write_single_coil(address, value)).await;
        flatten(outcome, self.timeout)
    }

    async fn write_multiple_coils(
        &mut self,
        address: u16,
        values: &[bool],
    ) -> Result<(), TransportError> {
        let outcome = timeout(self.timeout, self.ctx.write_multiple_coils(address, values)).await;
        flatten(outcome, self.timeout)
    }

    async fn write_multiple_registers(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> Result<(), TransportError> {
        let outcome =
            timeout(self.timeout, self.ctx.write_multiple_registers(address, values)).await;
        flatten(outcome, self.timeout)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match timeout(self.timeout, self.ctx.disconnect()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Io(e.to_string())),
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ascii_is_unsupported() {
        let endpoint = EndpointConfig::new("ascii", "ascii:///dev/ttyS0");
        let result = ModbusConnector.open(&endpoint).await;
        assert!(matches!(result, Err(TransportError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_invalid_uri_is_config_error() {
        let endpoint = EndpointConfig::new("bad", "udp://127.0.0.1:502");
        let result = ModbusConnector.open(&endpoint).await;
        assert!(matches!(result, Err(TransportError::Config(_))));
    }

    #[tokio::test]
    async fn test_tcp_refused_is_connect_error() {
        // Bind then drop to get a local port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = EndpointConfig::new("tcp", format!("tcp://127.0.0.1:{}", port));
        let result = ModbusConnector.open(&endpoint).await;
        assert!(matches!(
            result,
            Err(TransportError::Connect(_)) | Err(TransportError::Timeout(_))
        ));
    }

    #[test]
    fn test_serial_parameter_mapping() {
        assert_eq!(serial_parity(Parity::Even), tokio_serial::Parity::Even);
        assert_eq!(serial_stop_bits(2), tokio_serial::StopBits::Two);
        assert_eq!(serial_data_bits(7), tokio_serial::DataBits::Seven);
        assert_eq!(serial_data_bits(8), tokio_serial::DataBits::Eight);
    }
}
