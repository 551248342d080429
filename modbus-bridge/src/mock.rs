//! In-memory devices for exercising clients, workers and supervisors
//! without hardware.
//!
//! A [`MockConnector`] hands out transports backed by named
//! [`MockDevice`]s (one per endpoint name). Devices can be told to fail
//! upcoming operations or answer with an exception, and record every
//! request together with the unit id selected at I/O time.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio_modbus::ExceptionCode;

use crate::config::EndpointConfig;
use crate::transport::{Connector, Transport, TransportError};

/// One request as observed by a mock device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoRecord {
    /// Unit id selected on the transport when the request ran
    pub unit: Option<u8>,
    pub function: &'static str,
    pub address: u16,
}

/// A write applied to a mock device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteRecord {
    Coils { address: u16, values: Vec<bool> },
    Registers { address: u16, values: Vec<u16> },
}

#[derive(Debug, Default)]
struct DeviceState {
    coils: HashMap<u16, bool>,
    discrete_inputs: HashMap<u16, bool>,
    holding_registers: HashMap<u16, u16>,
    input_registers: HashMap<u16, u16>,
    fail_next: u32,
    fail_all: bool,
    exception_next: Option<ExceptionCode>,
    latency: Option<Duration>,
    fail_close: bool,
    log: Vec<IoRecord>,
    writes: Vec<WriteRecord>,
}

fn read_range<T: Copy + Default>(
    table: &HashMap<u16, T>,
    address: u16,
    quantity: u16,
) -> Result<Vec<T>, TransportError> {
    check_range(address, quantity)?;
    Ok((0..quantity)
        .map(|i| table.get(&(address + i)).copied().unwrap_or_default())
        .collect())
}

fn write_range<T: Copy>(
    table: &mut HashMap<u16, T>,
    address: u16,
    values: &[T],
) -> Result<(), TransportError> {
    let quantity = u16::try_from(values.len())
        .map_err(|_| TransportError::Exception(ExceptionCode::IllegalDataValue))?;
    check_range(address, quantity)?;
    for (i, value) in values.iter().enumerate() {
        table.insert(address + i as u16, *value);
    }
    Ok(())
}

fn check_range(address: u16, quantity: u16) -> Result<(), TransportError> {
    if u32::from(address) + u32::from(quantity) > 0x1_0000 {
        return Err(TransportError::Exception(ExceptionCode::IllegalDataAddress));
    }
    Ok(())
}

/// A simulated Modbus device shared by every transport opened on it.
#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_coils(&self, address: u16, values: &[bool]) {
        let mut state = self.lock();
        for (i, v) in values.iter().enumerate() {
            state.coils.insert(address + i as u16, *v);
        }
    }

    pub fn set_discrete_inputs(&self, address: u16, values: &[bool]) {
        let mut state = self.lock();
        for (i, v) in values.iter().enumerate() {
            state.discrete_inputs.insert(address + i as u16, *v);
        }
    }

    pub fn set_holding_registers(&self, address: u16, values: &[u16]) {
        let mut state = self.lock();
        for (i, v) in values.iter().enumerate() {
            state.holding_registers.insert(address + i as u16, *v);
        }
    }

    pub fn set_input_registers(&self, address: u16, values: &[u16]) {
        let mut state = self.lock();
        for (i, v) in values.iter().enumerate() {
            state.input_registers.insert(address + i as u16, *v);
        }
    }

    pub fn coils(&self, address: u16, quantity: u16) -> Vec<bool> {
        let state = self.lock();
        (0..quantity)
            .map(|i| state.coils.get(&(address + i)).copied().unwrap_or_default())
            .collect()
    }

    pub fn holding_registers(&self, address: u16, quantity: u16) -> Vec<u16> {
        let state = self.lock();
        (0..quantity)
            .map(|i| {
                state
                    .holding_registers
                    .get(&(address + i))
                    .copied()
                    .unwrap_or_default()
            })
            .collect()
    }

    /// Fail the next `count` operations with an I/O error.
    pub fn fail_next(&self, count: u32) {
        self.lock().fail_next = count;
    }

    /// Fail every operation until switched off.
    pub fn fail_all(&self, enabled: bool) {
        self.lock().fail_all = enabled;
    }

    /// Answer the next operation with a Modbus exception.
    pub fn exception_next(&self, code: ExceptionCode) {
        self.lock().exception_next = Some(code);
    }

    /// Delay every operation.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    /// Report an error from `close`. The transport is released regardless.
    pub fn fail_close(&self, enabled: bool) {
        self.lock().fail_close = enabled;
    }

    /// Requests seen so far, including failed ones.
    pub fn log(&self) -> Vec<IoRecord> {
        self.lock().log.clone()
    }

    /// Writes applied so far.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }
}

/// Connector handing out transports on [`MockDevice`]s keyed by endpoint name.
#[derive(Debug, Default)]
pub struct MockConnector {
    devices: Mutex<HashMap<String, MockDevice>>,
    failing_opens: Mutex<HashSet<String>>,
    opens: AtomicU64,
    closes: Arc<AtomicU64>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device behind an endpoint name, created on first use.
    pub fn device(&self, name: &str) -> MockDevice {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Make opening `name` fail (or succeed again).
    pub fn fail_open(&self, name: &str, failing: bool) {
        let mut set = self
            .failing_opens
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if failing {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    /// Successful opens so far.
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Transports closed so far.
    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }

    /// Transports opened and not yet closed.
    pub fn open_transports(&self) -> u64 {
        self.opens().saturating_sub(self.closes())
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, endpoint: &EndpointConfig) -> Result<Box<dyn Transport>, TransportError> {
        endpoint
            .uri()
            .map_err(|e| TransportError::Config(e.to_string()))?;

        let failing = self
            .failing_opens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&endpoint.name);
        if failing {
            return Err(TransportError::Connect(format!(
                "{} is unreachable",
                endpoint.name
            )));
        }

        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTransport {
            device: self.device(&endpoint.name),
            unit: endpoint.server_id,
            closed: false,
            closes: self.closes.clone(),
        }))
    }
}

struct MockTransport {
    device: MockDevice,
    unit: Option<u8>,
    closed: bool,
    closes: Arc<AtomicU64>,
}

impl MockTransport {
    async fn io<T, F>(
        &mut self,
        function: &'static str,
        address: u16,
        op: F,
    ) -> Result<T, TransportError>
    where
        F: FnOnce(&mut DeviceState) -> Result<T, TransportError>,
    {
        if self.closed {
            return Err(TransportError::Io("transport closed".to_string()));
        }
        let latency = self.device.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.device.lock();
        state.log.push(IoRecord {
            unit: self.unit,
            function,
            address,
        });
        if state.fail_all {
            return Err(TransportError::Io("injected failure".to_string()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(TransportError::Io("injected failure".to_string()));
        }
        if let Some(code) = state.exception_next.take() {
            return Err(TransportError::Exception(code));
        }
        op(&mut state)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn set_unit(&mut self, unit: u8) {
        self.unit = Some(unit);
    }

    async fn read_coils(&mut self, address: u16, quantity: u16) -> Result<Vec<bool>, TransportError> {
        self.io("read_coils", address, |s| {
            read_range(&s.coils, address, quantity)
        })
        .await
    }

    async fn read_discrete_inputs(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>, TransportError> {
        self.io("read_discrete_inputs", address, |s| {
            read_range(&s.discrete_inputs, address, quantity)
        })
        .await
    }

    async fn read_holding_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.io("read_holding_registers", address, |s| {
            read_range(&s.holding_registers, address, quantity)
        })
        .await
    }

    async fn read_input_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.io("read_input_registers", address, |s| {
            read_range(&s.input_registers, address, quantity)
        })
        .await
    }

    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<(), TransportError> {
        self.io("write_single_coil", address, |s| {
            write_range(&mut s.coils, address, &[value])?;
            s.writes.push(WriteRecord::Coils {
                address,
                values: vec![value],
            });
            Ok(())
        })
        .await
    }

    async fn write_multiple_coils(
        &mut self,
        address: u16,
        values: &[bool],
    ) -> Result<(), TransportError> {
        self.io("write_multiple_coils", address, |s| {
            write_range(&mut s.coils, address, values)?;
            s.writes.push(WriteRecord::Coils {
                address,
                values: values.to_vec(),
            });
            Ok(())
        })
        .await
    }

    async fn write_multiple_registers(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> Result<(), TransportError> {
        self.io("write_multiple_registers", address, |s| {
            write_range(&mut s.holding_registers, address, values)?;
            s.writes.push(WriteRecord::Registers {
                address,
                values: values.to_vec(),
            });
            Ok(())
        })
        .await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.device.lock().fail_close {
                return Err(TransportError::Io("injected close failure".to_string()));
            }
        }
        Ok(())
    }
}
