//! Resilient Modbus client.
//!
//! [`ResilientClient`] owns one transport and serializes every operation
//! on it behind a single async mutex, so selecting a unit id and the
//! request that follows are never interleaved with another caller.
//!
//! Every operation runs the same policy:
//!
//! 1. Apply the effective unit id (per-call value, else the endpoint's
//!    `server_id`, else leave the transport's current unit untouched).
//! 2. Issue the request.
//! 3. On an I/O failure, close the transport, open a new one from the
//!    stored endpoint configuration and try again, up to [`MAX_ATTEMPTS`]
//!    attempts in total. A failed reopen is returned immediately.
//!
//! Modbus exception responses mean the device answered, so they are
//! returned as [`ClientError::Exception`] without a reconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_modbus::ExceptionCode;
use tracing::{debug, info, warn};

use crate::codec::{
    CodecError, Encoding, RegisterValue, ScalarType, ScalarValue, registers_to_bytes,
    registers_to_raw_bytes,
};
use crate::config::{EndpointConfig, ValueRegister};
use crate::transport::{Connector, Transport, TransportError, TransportFuture};

/// Attempts made per operation before giving up.
pub const MAX_ATTEMPTS: u32 = 3;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to open endpoint '{endpoint}': {source}")]
    Open {
        endpoint: String,
        #[source]
        source: TransportError,
    },

    #[error("Reconnect to endpoint '{endpoint}' failed: {source}")]
    Reconnect {
        endpoint: String,
        #[source]
        source: TransportError,
    },

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: TransportError },

    #[error("Endpoint '{endpoint}' answered with exception {code:?}")]
    Exception {
        endpoint: String,
        code: ExceptionCode,
    },

    #[error("Failed to close endpoint '{endpoint}': {source}")]
    Close {
        endpoint: String,
        #[source]
        source: TransportError,
    },

    #[error("Client for endpoint '{0}' is closed")]
    Closed(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

struct Inner {
    /// `None` after a failed reopen; the next call opens a new one.
    transport: Option<Box<dyn Transport>>,
    closed: bool,
}

/// A Modbus client that reconnects and retries on transport failures.
pub struct ResilientClient {
    endpoint: EndpointConfig,
    encoding: Encoding,
    connector: Arc<dyn Connector>,
    inner: Mutex<Inner>,
    attempts: AtomicU64,
    reconnects: AtomicU64,
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("endpoint", &self.endpoint.name)
            .field("attempts", &self.attempts())
            .field("reconnects", &self.reconnects())
            .finish()
    }
}

macro_rules! typed_accessors {
    ($($ty:ty => $read:ident, $write:ident);* $(;)?) => {
        $(
            #[doc = concat!("Read a `", stringify!($ty), "` from holding registers.")]
            pub async fn $read(&self, address: u16, unit: Option<u8>) -> Result<$ty, ClientError> {
                self.read_value::<$ty>(ValueRegister::HoldingRegisters, address, unit).await
            }

            #[doc = concat!("Write a `", stringify!($ty), "` to holding registers.")]
            pub async fn $write(
                &self,
                address: u16,
                value: $ty,
                unit: Option<u8>,
            ) -> Result<(), ClientError> {
                self.write_value(address, value, unit).await
            }
        )*
    };
}

impl ResilientClient {
    /// Open the endpoint and wrap it.
    pub async fn connect(
        endpoint: EndpointConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ClientError> {
        let transport = connector
            .open(&endpoint)
            .await
            .map_err(|source| ClientError::Open {
                endpoint: endpoint.name.clone(),
                source,
            })?;

        info!(endpoint = %endpoint.name, uri = %endpoint.endpoint, "Modbus client connected");

        Ok(Self {
            encoding: endpoint.encoding(),
            endpoint,
            connector,
            inner: Mutex::new(Inner {
                transport: Some(transport),
                closed: false,
            }),
            attempts: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        })
    }

    /// Endpoint name.
    pub fn name(&self) -> &str {
        &self.endpoint.name
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    /// Register encoding used by the typed accessors.
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Total transport attempts made.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Total reopen attempts made after failures.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    /// Close the transport. Later calls fail with [`ClientError::Closed`].
    pub async fn close(&self) -> Result<(), ClientError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;

        if let Some(mut transport) = inner.transport.take() {
            transport.close().await.map_err(|source| ClientError::Close {
                endpoint: self.endpoint.name.clone(),
                source,
            })?;
        }
        info!(endpoint = %self.endpoint.name, "Modbus client closed");
        Ok(())
    }

    async fn reopen(&self) -> Result<Box<dyn Transport>, ClientError> {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        self.connector
            .open(&self.endpoint)
            .await
            .map_err(|source| {
                warn!(endpoint = %self.endpoint.name, error = %source, "Reconnect failed");
                ClientError::Reconnect {
                    endpoint: self.endpoint.name.clone(),
                    source,
                }
            })
    }

    /// Run `op` under the client lock with the retry-and-reconnect policy.
    async fn execute<T, F>(&self, unit: Option<u8>, op: F) -> Result<T, ClientError>
    where
        T: Send,
        F: for<'a> Fn(&'a mut dyn Transport) -> TransportFuture<'a, T> + Send + Sync,
    {
        let unit = unit.or(self.endpoint.server_id);
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(ClientError::Closed(self.endpoint.name.clone()));
        }

        // The transport stays in its slot while a request runs, so a caller
        // that drops this future leaves it owned and open.
        let mut attempts = 0;
        loop {
            if inner.transport.is_none() {
                inner.transport = Some(self.reopen().await?);
            }
            let Some(transport) = inner.transport.as_mut() else {
                continue;
            };

            if let Some(unit) = unit {
                transport.set_unit(unit);
            }
            attempts += 1;
            self.attempts.fetch_add(1, Ordering::Relaxed);

            match op(&mut **transport).await {
                Ok(value) => return Ok(value),
                Err(TransportError::Exception(code)) => {
                    return Err(ClientError::Exception {
                        endpoint: self.endpoint.name.clone(),
                        code,
                    });
                }
                Err(last) if attempts >= MAX_ATTEMPTS => {
                    return Err(ClientError::RetriesExhausted { attempts, last });
                }
                Err(e) => {
                    warn!(
                        endpoint = %self.endpoint.name,
                        attempt = attempts,
                        error = %e,
                        "Modbus request failed, reconnecting"
                    );
                    if let Err(e) = transport.close().await {
                        debug!(endpoint = %self.endpoint.name, error = %e, "Close after failure");
                    }
                    inner.transport = None;
                }
            }
        }
    }

    pub async fn read_coils(
        &self,
        address: u16,
        quantity: u16,
        unit: Option<u8>,
    ) -> Result<Vec<bool>, ClientError> {
        self.execute(unit, move |t| t.read_coils(address, quantity))
            .await
    }

    pub async fn read_coil(&self, address: u16, unit: Option<u8>) -> Result<bool, ClientError> {
        let bits = self.read_coils(address, 1, unit).await?;
        first(bits)
    }

    pub async fn read_discrete_inputs(
        &self,
        address: u16,
        quantity: u16,
        unit: Option<u8>,
    ) -> Result<Vec<bool>, ClientError> {
        self.execute(unit, move |t| t.read_discrete_inputs(address, quantity))
            .await
    }

    pub async fn read_discrete_input(
        &self,
        address: u16,
        unit: Option<u8>,
    ) -> Result<bool, ClientError> {
        let bits = self.read_discrete_inputs(address, 1, unit).await?;
        first(bits)
    }

    pub async fn read_holding_registers(
        &self,
        address: u16,
        quantity: u16,
        unit: Option<u8>,
    ) -> Result<Vec<u16>, ClientError> {
        self.execute(unit, move |t| t.read_holding_registers(address, quantity))
            .await
    }

    pub async fn read_input_registers(
        &self,
        address: u16,
        quantity: u16,
        unit: Option<u8>,
    ) -> Result<Vec<u16>, ClientError> {
        self.execute(unit, move |t| t.read_input_registers(address, quantity))
            .await
    }

    /// Read 16-bit registers from either register table.
    pub async fn read_words(
        &self,
        register: ValueRegister,
        address: u16,
        quantity: u16,
        unit: Option<u8>,
    ) -> Result<Vec<u16>, ClientError> {
        match register {
            ValueRegister::HoldingRegisters => {
                self.read_holding_registers(address, quantity, unit).await
            }
            ValueRegister::InputRegisters => {
                self.read_input_registers(address, quantity, unit).await
            }
        }
    }

    pub async fn write_coil(
        &self,
        address: u16,
        value: bool,
        unit: Option<u8>,
    ) -> Result<(), ClientError> {
        self.execute(unit, move |t| t.write_single_coil(address, value))
            .await
    }

    pub async fn write_coils(
        &self,
        address: u16,
        values: &[bool],
        unit: Option<u8>,
    ) -> Result<(), ClientError> {
        let values = values.to_vec();
        self.execute(unit, move |t| {
            let values = values.clone();
            Box::pin(async move { t.write_multiple_coils(address, &values).await })
        })
        .await
    }

    pub async fn write_registers(
        &self,
        address: u16,
        values: &[u16],
        unit: Option<u8>,
    ) -> Result<(), ClientError> {
        let values = values.to_vec();
        self.execute(unit, move |t| {
            let values = values.clone();
            Box::pin(async move { t.write_multiple_registers(address, &values).await })
        })
        .await
    }

    /// Read and decode a typed value using the endpoint's encoding.
    pub async fn read_value<T: RegisterValue + Send>(
        &self,
        register: ValueRegister,
        address: u16,
        unit: Option<u8>,
    ) -> Result<T, ClientError> {
        let words = self
            .read_words(register, address, T::WORDS as u16, unit)
            .await?;
        Ok(T::decode(&words, self.encoding)?)
    }

    /// Encode and write a typed value to holding registers.
    pub async fn write_value<T: RegisterValue + Send>(
        &self,
        address: u16,
        value: T,
        unit: Option<u8>,
    ) -> Result<(), ClientError> {
        self.write_registers(address, &value.encode(self.encoding), unit)
            .await
    }

    /// Read a value whose type is only known at runtime.
    pub async fn read_scalar(
        &self,
        register: ValueRegister,
        value_type: ScalarType,
        address: u16,
        unit: Option<u8>,
    ) -> Result<ScalarValue, ClientError> {
        let words = self
            .read_words(register, address, value_type.words() as u16, unit)
            .await?;
        Ok(value_type.decode(&words, self.encoding)?)
    }

    pub async fn write_scalar(
        &self,
        address: u16,
        value: ScalarValue,
        unit: Option<u8>,
    ) -> Result<(), ClientError> {
        self.write_registers(address, &value.encode(self.encoding), unit)
            .await
    }

    /// Read registers as bytes after applying the endpoint's byte order.
    pub async fn read_bytes(
        &self,
        register: ValueRegister,
        address: u16,
        quantity: u16,
        unit: Option<u8>,
    ) -> Result<Vec<u8>, ClientError> {
        let words = self.read_words(register, address, quantity, unit).await?;
        Ok(registers_to_bytes(&words, self.encoding))
    }

    /// Read registers as bytes in wire order.
    pub async fn read_raw_bytes(
        &self,
        register: ValueRegister,
        address: u16,
        quantity: u16,
        unit: Option<u8>,
    ) -> Result<Vec<u8>, ClientError> {
        let words = self.read_words(register, address, quantity, unit).await?;
        Ok(registers_to_raw_bytes(&words))
    }

    typed_accessors! {
        u8 => read_u8, write_u8;
        i8 => read_i8, write_i8;
        u16 => read_u16, write_u16;
        i16 => read_i16, write_i16;
        u32 => read_u32, write_u32;
        i32 => read_i32, write_i32;
        u64 => read_u64, write_u64;
        i64 => read_i64, write_i64;
        f32 => read_f32, write_f32;
        f64 => read_f64, write_f64;
    }
}

fn first(bits: Vec<bool>) -> Result<bool, ClientError> {
    bits.first().copied().ok_or(ClientError::Codec(CodecError::InvalidLength {
        expected: 1,
        actual: 0,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ByteOrder, WordOrder};
    use crate::mock::{MockConnector, WriteRecord};
    use std::time::Duration;

    async fn client_for(
        connector: &Arc<MockConnector>,
        endpoint: EndpointConfig,
    ) -> ResilientClient {
        ResilientClient::connect(endpoint, connector.clone())
            .await
            .unwrap()
    }

    fn plc() -> EndpointConfig {
        EndpointConfig::new("plc", "tcp://127.0.0.1:502")
    }

    #[tokio::test]
    async fn test_retries_exhausted_after_three_attempts() {
        let connector = Arc::new(MockConnector::new());
        let device = connector.device("plc");
        device.fail_all(true);

        let client = client_for(&connector, plc()).await;
        let err = client.read_holding_registers(0, 1, None).await.unwrap_err();

        assert!(matches!(
            err,
            ClientError::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(client.attempts(), 3);
        assert_eq!(client.reconnects(), 2);
        assert_eq!(device.log().len(), 3);
        // Initial open plus two reconnects
        assert_eq!(connector.opens(), 3);
    }

    #[tokio::test]
    async fn test_recovers_after_one_failure() {
        let connector = Arc::new(MockConnector::new());
        let device = connector.device("plc");
        device.set_holding_registers(0, &[42]);
        device.fail_next(1);

        let client = client_for(&connector, plc()).await;
        let value = client.read_holding_registers(0, 1, None).await.unwrap();

        assert_eq!(value, vec![42]);
        assert_eq!(client.reconnects(), 1);
        assert_eq!(client.attempts(), 2);
        assert_eq!(connector.open_transports(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_failure_is_immediate() {
        let connector = Arc::new(MockConnector::new());
        let device = connector.device("plc");
        device.set_input_registers(0, &[7]);

        let client = client_for(&connector, plc()).await;
        device.fail_next(1);
        connector.fail_open("plc", true);

        let err = client.read_input_registers(0, 1, None).await.unwrap_err();
        assert!(matches!(err, ClientError::Reconnect { .. }));
        assert_eq!(client.attempts(), 1);

        // The next call opens a fresh transport first.
        connector.fail_open("plc", false);
        assert_eq!(client.read_input_registers(0, 1, None).await.unwrap(), vec![7]);
        assert_eq!(client.reconnects(), 2);
    }

    #[tokio::test]
    async fn test_exception_is_not_retried() {
        let connector = Arc::new(MockConnector::new());
        let device = connector.device("plc");
        device.exception_next(ExceptionCode::IllegalDataAddress);

        let client = client_for(&connector, plc()).await;
        let err = client.read_coils(0, 8, None).await.unwrap_err();

        assert!(matches!(
            err,
            ClientError::Exception {
                code: ExceptionCode::IllegalDataAddress,
                ..
            }
        ));
        assert_eq!(client.reconnects(), 0);
        assert!(client.read_coils(0, 8, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_unit_id_policy() {
        let connector = Arc::new(MockConnector::new());
        let device = connector.device("plc");

        let client = client_for(&connector, plc().with_server_id(5)).await;
        client.read_coils(0, 1, None).await.unwrap();
        client.read_coils(1, 1, Some(9)).await.unwrap();
        client.read_coils(2, 1, None).await.unwrap();

        let units: Vec<_> = device.log().iter().map(|r| r.unit).collect();
        assert_eq!(units, vec![Some(5), Some(9), Some(5)]);
    }

    #[tokio::test]
    async fn test_unset_unit_keeps_transport_unit() {
        let connector = Arc::new(MockConnector::new());
        let device = connector.device("plc");

        let client = client_for(&connector, plc()).await;
        client.read_coils(0, 1, None).await.unwrap();
        client.read_coils(0, 1, Some(3)).await.unwrap();
        client.read_coils(0, 1, None).await.unwrap();

        let units: Vec<_> = device.log().iter().map(|r| r.unit).collect();
        assert_eq!(units, vec![None, Some(3), Some(3)]);
    }

    #[tokio::test]
    async fn test_unit_reapplied_after_reconnect() {
        let connector = Arc::new(MockConnector::new());
        let device = connector.device("plc");
        device.fail_next(1);

        let client = client_for(&connector, plc()).await;
        client.read_coils(0, 1, Some(4)).await.unwrap();

        let units: Vec<_> = device.log().iter().map(|r| r.unit).collect();
        assert_eq!(units, vec![Some(4), Some(4)]);
    }

    #[tokio::test]
    async fn test_concurrent_calls_never_interleave_units() {
        let connector = Arc::new(MockConnector::new());
        let device = connector.device("plc");
        device.set_latency(Duration::from_millis(2));

        let client = Arc::new(client_for(&connector, plc()).await);
        let mut tasks = Vec::new();
        for unit in 1..=16u8 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                // Address doubles as the expected unit id.
                client
                    .read_holding_registers(u16::from(unit), 1, Some(unit))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let log = device.log();
        assert_eq!(log.len(), 16);
        for record in log {
            assert_eq!(record.unit.map(u16::from), Some(record.address));
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let connector = Arc::new(MockConnector::new());
        let client = client_for(&connector, plc()).await;

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(client.is_closed().await);
        assert_eq!(connector.open_transports(), 0);

        let err = client.read_coils(0, 1, None).await.unwrap_err();
        assert!(matches!(err, ClientError::Closed(_)));
    }

    #[tokio::test]
    async fn test_cancelled_call_keeps_transport() {
        let connector = Arc::new(MockConnector::new());
        let device = connector.device("plc");
        device.set_coils(0, &[true]);
        device.set_latency(Duration::from_millis(50));

        let client = client_for(&connector, plc()).await;
        let cancelled =
            tokio::time::timeout(Duration::from_millis(5), client.read_coils(0, 1, None)).await;
        assert!(cancelled.is_err());
        assert_eq!(connector.open_transports(), 1);

        device.set_latency(Duration::ZERO);
        assert_eq!(client.read_coils(0, 1, None).await.unwrap(), vec![true]);
        assert_eq!(client.reconnects(), 0);
        assert_eq!(connector.opens(), 1);
        assert_eq!(connector.open_transports(), 1);

        client.close().await.unwrap();
        assert_eq!(connector.open_transports(), 0);
    }

    #[tokio::test]
    async fn test_typed_values_use_endpoint_encoding() {
        let connector = Arc::new(MockConnector::new());
        let device = connector.device("plc");
        device.set_holding_registers(0, &[0x0001, 0x0002]);

        let high = client_for(&connector, plc()).await;
        assert_eq!(high.read_u32(0, None).await.unwrap(), 0x0001_0002);

        let mut low_endpoint = plc();
        low_endpoint.word_order = WordOrder::LowFirst;
        let low = client_for(&connector, low_endpoint).await;
        assert_eq!(low.read_u32(0, None).await.unwrap(), 0x0002_0001);

        low.write_f32(10, 1.5, None).await.unwrap();
        assert_eq!(low.read_f32(10, None).await.unwrap(), 1.5);
        assert_eq!(high.read_f32(10, None).await.unwrap(), f32::from_bits(0x0000_3FC0));

        let mut little = plc();
        little.byte_order = ByteOrder::Little;
        let little = client_for(&connector, little).await;
        assert_eq!(little.read_u16(0, None).await.unwrap(), 0x0100);
    }

    #[tokio::test]
    async fn test_bytes_and_bits() {
        let connector = Arc::new(MockConnector::new());
        let device = connector.device("plc");
        device.set_input_registers(4, &[0x4142, 0x4344]);

        let client = client_for(&connector, plc()).await;
        let raw = client
            .read_raw_bytes(ValueRegister::InputRegisters, 4, 2, None)
            .await
            .unwrap();
        assert_eq!(raw, b"ABCD");

        client.write_coils(0, &[true, false, true], None).await.unwrap();
        assert!(client.read_coil(2, None).await.unwrap());
        client.write_coil(1, true, None).await.unwrap();
        assert_eq!(device.coils(0, 3), vec![true, true, true]);
        assert_eq!(
            device.writes()[0],
            WriteRecord::Coils {
                address: 0,
                values: vec![true, false, true]
            }
        );

        client.write_i16(20, -2, None).await.unwrap();
        assert_eq!(device.holding_registers(20, 1), vec![0xFFFE]);
        assert_eq!(
            client
                .read_scalar(ValueRegister::HoldingRegisters, ScalarType::Int16, 20, None)
                .await
                .unwrap(),
            ScalarValue::I16(-2)
        );
    }

    #[tokio::test]
    async fn test_open_failure() {
        let connector = Arc::new(MockConnector::new());
        connector.fail_open("plc", true);
        let result = ResilientClient::connect(plc(), connector.clone()).await;
        assert!(matches!(result, Err(ClientError::Open { .. })));
    }
}
