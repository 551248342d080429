//! Local Modbus server endpoints backed by an in-memory register bank.
//!
//! Every endpoint of one [`ServerBridge`] serves the same
//! [`RegisterBank`]. With `persist_data` set, the bank is loaded from
//! `<data_dir>/registers.<json|cbor>` at start and written back at stop.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use modbus_bridge_common::{Format, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_modbus::server::Service;
use tokio_modbus::server::tcp::{Server as TcpServer, accept_tcp_connection};
use tokio_modbus::{ExceptionCode, Request, Response};
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, EndpointConfig, EndpointUri, Parity, ServerSettings};
use crate::supervisor::{EndpointFailure, join_failures};

/// Entries in each register table.
pub const BANK_SIZE: usize = 65535;

/// Environment variable consulted when `data_dir` is not configured.
pub const DATA_DIR_ENV: &str = "MODBUS_BRIDGE_DATA";

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid server configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("No data directory for persisted registers: {0:?}")]
    NoDataDir(Option<PathBuf>),

    #[error("Failed to start {} server endpoint(s): {}", .0.len(), join_failures(.0))]
    Start(Vec<EndpointFailure>),

    #[error("Persisted register state: {0}")]
    Persist(#[from] modbus_bridge_common::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Non-zero entries of a bank, as persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankSnapshot {
    #[serde(default)]
    pub coils: BTreeMap<u16, bool>,
    #[serde(default)]
    pub discrete_inputs: BTreeMap<u16, bool>,
    #[serde(default)]
    pub holding_registers: BTreeMap<u16, u16>,
    #[serde(default)]
    pub input_registers: BTreeMap<u16, u16>,
}

fn sparse<T: Copy + Default + PartialEq>(table: &[T]) -> BTreeMap<u16, T> {
    table
        .iter()
        .enumerate()
        .filter(|(_, v)| **v != T::default())
        .map(|(i, v)| (i as u16, *v))
        .collect()
}

fn dense<T: Copy>(table: &mut [T], entries: &BTreeMap<u16, T>) {
    for (&address, &value) in entries {
        if let Some(slot) = table.get_mut(usize::from(address)) {
            *slot = value;
        }
    }
}

#[derive(Debug)]
struct Tables {
    coils: Vec<bool>,
    discrete_inputs: Vec<bool>,
    holding_registers: Vec<u16>,
    input_registers: Vec<u16>,
}

fn range(address: u16, quantity: usize) -> Result<std::ops::Range<usize>, ExceptionCode> {
    let start = usize::from(address);
    let end = start + quantity;
    if end > BANK_SIZE {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok(start..end)
}

/// Coils, discrete inputs, holding and input registers held in memory.
#[derive(Debug)]
pub struct RegisterBank {
    tables: RwLock<Tables>,
}

impl Default for RegisterBank {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterBank {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                coils: vec![false; BANK_SIZE],
                discrete_inputs: vec![false; BANK_SIZE],
                holding_registers: vec![0; BANK_SIZE],
                input_registers: vec![0; BANK_SIZE],
            }),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn read_coils(&self, address: u16, quantity: u16) -> Result<Vec<bool>, ExceptionCode> {
        let r = range(address, usize::from(quantity))?;
        Ok(self.read().coils[r].to_vec())
    }

    pub fn read_discrete_inputs(&self, address: u16, quantity: u16) -> Result<Vec<bool>, ExceptionCode> {
        let r = range(address, usize::from(quantity))?;
        Ok(self.read().discrete_inputs[r].to_vec())
    }

    pub fn read_holding_registers(&self, address: u16, quantity: u16) -> Result<Vec<u16>, ExceptionCode> {
        let r = range(address, usize::from(quantity))?;
        Ok(self.read().holding_registers[r].to_vec())
    }

    pub fn read_input_registers(&self, address: u16, quantity: u16) -> Result<Vec<u16>, ExceptionCode> {
        let r = range(address, usize::from(quantity))?;
        Ok(self.read().input_registers[r].to_vec())
    }

    pub fn write_coils(&self, address: u16, values: &[bool]) -> Result<(), ExceptionCode> {
        let r = range(address, values.len())?;
        self.write().coils[r].copy_from_slice(values);
        Ok(())
    }

    pub fn write_holding_registers(&self, address: u16, values: &[u16]) -> Result<(), ExceptionCode> {
        let r = range(address, values.len())?;
        self.write().holding_registers[r].copy_from_slice(values);
        Ok(())
    }

    /// Set read-only discrete inputs from the local side.
    pub fn set_discrete_inputs(&self, address: u16, values: &[bool]) -> Result<(), ExceptionCode> {
        let r = range(address, values.len())?;
        self.write().discrete_inputs[r].copy_from_slice(values);
        Ok(())
    }

    /// Set read-only input registers from the local side.
    pub fn set_input_registers(&self, address: u16, values: &[u16]) -> Result<(), ExceptionCode> {
        let r = range(address, values.len())?;
        self.write().input_registers[r].copy_from_slice(values);
        Ok(())
    }

    /// Answer one Modbus request.
    pub fn handle(&self, request: Request<'_>) -> Result<Response, ExceptionCode> {
        match request {
            Request::ReadCoils(address, quantity) => {
                self.read_coils(address, quantity).map(Response::ReadCoils)
            }
            Request::ReadDiscreteInputs(address, quantity) => self
                .read_discrete_inputs(address, quantity)
                .map(Response::ReadDiscreteInputs),
            Request::ReadHoldingRegisters(address, quantity) => self
                .read_holding_registers(address, quantity)
                .map(Response::ReadHoldingRegisters),
            Request::ReadInputRegisters(address, quantity) => self
                .read_input_registers(address, quantity)
                .map(Response::ReadInputRegisters),
            Request::WriteSingleCoil(address, value) => self
                .write_coils(address, &[value])
                .map(|()| Response::WriteSingleCoil(address, value)),
            Request::WriteMultipleCoils(address, values) => self
                .write_coils(address, &values)
                .map(|()| Response::WriteMultipleCoils(address, values.len() as u16)),
            Request::WriteSingleRegister(address, value) => self
                .write_holding_registers(address, &[value])
                .map(|()| Response::WriteSingleRegister(address, value)),
            Request::WriteMultipleRegisters(address, values) => self
                .write_holding_registers(address, &values)
                .map(|()| Response::WriteMultipleRegisters(address, values.len() as u16)),
            _ => Err(ExceptionCode::IllegalFunction),
        }
    }

    pub fn snapshot(&self) -> BankSnapshot {
        let tables = self.read();
        BankSnapshot {
            coils: sparse(&tables.coils),
            discrete_inputs: sparse(&tables.discrete_inputs),
            holding_registers: sparse(&tables.holding_registers),
            input_registers: sparse(&tables.input_registers),
        }
    }

    pub fn restore(&self, snapshot: &BankSnapshot) {
        let mut tables = self.write();
        dense(&mut tables.coils, &snapshot.coils);
        dense(&mut tables.discrete_inputs, &snapshot.discrete_inputs);
        dense(&mut tables.holding_registers, &snapshot.holding_registers);
        dense(&mut tables.input_registers, &snapshot.input_registers);
    }

    /// Load `<dir>/registers.<ext>`. A missing file leaves the bank untouched.
    pub fn load(&self, dir: &Path, format: Format) -> Result<bool, ServerError> {
        let path = persist_path(dir, format);
        if !path.exists() {
            return Ok(false);
        }
        let data = std::fs::read(&path)?;
        let snapshot: BankSnapshot = decode(&data, format)?;
        self.restore(&snapshot);
        Ok(true)
    }

    /// Save to `<dir>/registers.<ext>`.
    pub fn save(&self, dir: &Path, format: Format) -> Result<PathBuf, ServerError> {
        let path = persist_path(dir, format);
        let data = encode(&self.snapshot(), format)?;
        std::fs::write(&path, data)?;
        Ok(path)
    }
}

fn persist_path(dir: &Path, format: Format) -> PathBuf {
    dir.join(format!("registers.{}", format.extension()))
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    exceptions: AtomicU64,
}

/// Request counters of one server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointStats {
    pub endpoint: String,
    pub requests: u64,
    pub exceptions: u64,
}

#[derive(Debug, Clone)]
struct BankService {
    bank: Arc<RegisterBank>,
    counters: Arc<Counters>,
}

impl Service for BankService {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = std::future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, request: Self::Request) -> Self::Future {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let result = self.bank.handle(request);
        if result.is_err() {
            self.counters.exceptions.fetch_add(1, Ordering::Relaxed);
        }
        std::future::ready(result)
    }
}

struct RunningServer {
    name: String,
    local_addr: Option<SocketAddr>,
    counters: Arc<Counters>,
    task: JoinHandle<()>,
}

/// Server endpoints sharing one register bank.
pub struct ServerBridge {
    bank: Arc<RegisterBank>,
    servers: Vec<RunningServer>,
    persist: Option<(PathBuf, Format)>,
}

fn resolve_data_dir(settings: &ServerSettings) -> Result<PathBuf, ServerError> {
    let dir = settings
        .data_dir
        .clone()
        .or_else(|| std::env::var_os(DATA_DIR_ENV).map(PathBuf::from));
    match dir {
        Some(dir) if dir.is_dir() => Ok(dir),
        other => Err(ServerError::NoDataDir(other)),
    }
}

impl ServerBridge {
    /// Start every endpoint on a fresh bank.
    pub async fn start(settings: &ServerSettings) -> Result<Self, ServerError> {
        Self::start_with_bank(settings, Arc::new(RegisterBank::new())).await
    }

    /// Start every endpoint on `bank`, or none of them.
    pub async fn start_with_bank(
        settings: &ServerSettings,
        bank: Arc<RegisterBank>,
    ) -> Result<Self, ServerError> {
        settings.validate()?;

        let persist = if settings.persist_data {
            let dir = resolve_data_dir(settings)?;
            if bank.load(&dir, settings.persist_format)? {
                info!(dir = %dir.display(), "Loaded persisted registers");
            }
            Some((dir, settings.persist_format))
        } else {
            None
        };

        let mut servers = Vec::new();
        let mut failures = Vec::new();
        for endpoint in &settings.endpoints {
            match start_endpoint(endpoint, bank.clone()).await {
                Ok(server) => servers.push(server),
                Err(e) => {
                    warn!(endpoint = %endpoint.name, error = %e, "Failed to start server endpoint");
                    failures.push(EndpointFailure {
                        endpoint: endpoint.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if !failures.is_empty() {
            for server in servers {
                server.task.abort();
                let _ = server.task.await;
            }
            return Err(ServerError::Start(failures));
        }

        info!(endpoints = servers.len(), "Modbus servers started");
        Ok(Self {
            bank,
            servers,
            persist,
        })
    }

    pub fn bank(&self) -> &Arc<RegisterBank> {
        &self.bank
    }

    /// Bound address of a TCP endpoint.
    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.servers
            .iter()
            .find(|s| s.name == name)
            .and_then(|s| s.local_addr)
    }

    pub fn stats(&self) -> Vec<EndpointStats> {
        self.servers
            .iter()
            .map(|s| EndpointStats {
                endpoint: s.name.clone(),
                requests: s.counters.requests.load(Ordering::Relaxed),
                exceptions: s.counters.exceptions.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Stop every endpoint, then persist the bank if configured.
    pub async fn stop(self) -> Result<(), ServerError> {
        for server in &self.servers {
            server.task.abort();
        }
        for server in self.servers {
            let _ = server.task.await;
            debug!(endpoint = %server.name, "Server endpoint stopped");
        }

        if let Some((dir, format)) = &self.persist {
            if !dir.is_dir() {
                return Err(ServerError::NoDataDir(Some(dir.clone())));
            }
            let path = self.bank.save(dir, *format)?;
            info!(path = %path.display(), "Persisted registers");
        }
        info!("Modbus servers stopped");
        Ok(())
    }
}

async fn start_endpoint(
    endpoint: &EndpointConfig,
    bank: Arc<RegisterBank>,
) -> Result<RunningServer, ServerError> {
    let counters = Arc::new(Counters::default());
    let service = BankService {
        bank,
        counters: counters.clone(),
    };
    let name = endpoint.name.clone();

    match endpoint.uri()? {
        EndpointUri::Tcp { host, port } => {
            let listener = TcpListener::bind((host.as_str(), port)).await?;
            let local_addr = listener.local_addr()?;
            let server = TcpServer::new(listener);
            let log_name = name.clone();

            let task = tokio::spawn(async move {
                let on_connected = move |stream: TcpStream, socket_addr: SocketAddr| {
                    let service = service.clone();
                    async move {
                        accept_tcp_connection(stream, socket_addr, move |_| {
                            Ok(Some(service.clone()))
                        })
                    }
                };
                let error_name = log_name.clone();
                let on_process_error = move |e: io::Error| {
                    warn!(endpoint = %error_name, error = %e, "Server connection error");
                };
                if let Err(e) = server.serve(&on_connected, on_process_error).await {
                    error!(endpoint = %log_name, error = %e, "TCP server failed");
                }
            });

            info!(endpoint = %name, addr = %local_addr, "Modbus TCP server listening");
            Ok(RunningServer {
                name,
                local_addr: Some(local_addr),
                counters,
                task,
            })
        }
        EndpointUri::Rtu { path } => {
            let builder = tokio_serial::new(&path, endpoint.speed)
                .parity(match endpoint.parity {
                    Parity::None => tokio_serial::Parity::None,
                    Parity::Even => tokio_serial::Parity::Even,
                    Parity::Odd => tokio_serial::Parity::Odd,
                })
                .stop_bits(if endpoint.stop_bits == 2 {
                    tokio_serial::StopBits::Two
                } else {
                    tokio_serial::StopBits::One
                });
            let serial = tokio_serial::SerialStream::open(&builder)
                .map_err(|e| io::Error::other(format!("Serial open {} failed: {}", path, e)))?;
            let server = tokio_modbus::server::rtu::Server::new(serial);
            let log_name = name.clone();

            let task = tokio::spawn(async move {
                if let Err(e) = server.serve_forever(service).await {
                    error!(endpoint = %log_name, error = %e, "RTU server failed");
                }
            });

            info!(endpoint = %name, path = %path, "Modbus RTU server listening");
            Ok(RunningServer {
                name,
                local_addr: None,
                counters,
                task,
            })
        }
        EndpointUri::Ascii { path } => Err(ServerError::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("ascii framing is not available for {}", path),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "modbus-bridge-{}-{}",
            tag,
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn settings(endpoints: Vec<EndpointConfig>) -> ServerSettings {
        ServerSettings {
            endpoints,
            persist_data: false,
            data_dir: None,
            persist_format: Format::Json,
        }
    }

    #[test]
    fn test_bank_requests() {
        let bank = RegisterBank::new();

        let response = bank
            .handle(Request::WriteMultipleRegisters(10, Cow::Owned(vec![1, 2, 3])))
            .unwrap();
        assert_eq!(response, Response::WriteMultipleRegisters(10, 3));
        assert_eq!(
            bank.handle(Request::ReadHoldingRegisters(10, 3)).unwrap(),
            Response::ReadHoldingRegisters(vec![1, 2, 3])
        );

        bank.handle(Request::WriteSingleCoil(5, true)).unwrap();
        assert_eq!(bank.read_coils(5, 1).unwrap(), vec![true]);

        bank.set_input_registers(0, &[9]).unwrap();
        assert_eq!(
            bank.handle(Request::ReadInputRegisters(0, 1)).unwrap(),
            Response::ReadInputRegisters(vec![9])
        );
    }

    #[test]
    fn test_bank_rejects_out_of_range() {
        let bank = RegisterBank::new();
        assert_eq!(
            bank.handle(Request::ReadCoils(65530, 10)),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            bank.write_holding_registers(65534, &[1, 2]),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert!(bank.read_holding_registers(65534, 1).is_ok());
    }

    #[test]
    fn test_snapshot_is_sparse() {
        let bank = RegisterBank::new();
        bank.write_holding_registers(100, &[0, 7]).unwrap();
        bank.write_coils(3, &[true]).unwrap();

        let snapshot = bank.snapshot();
        assert_eq!(snapshot.holding_registers.len(), 1);
        assert_eq!(snapshot.holding_registers[&101], 7);
        assert!(snapshot.coils[&3]);

        let restored = RegisterBank::new();
        restored.restore(&snapshot);
        assert_eq!(restored.read_holding_registers(100, 2).unwrap(), vec![0, 7]);
    }

    #[test]
    fn test_save_and_load_formats() {
        let dir = temp_dir("bank");
        for format in [Format::Json, Format::Cbor] {
            let bank = RegisterBank::new();
            bank.write_holding_registers(0, &[0xBEEF]).unwrap();
            let path = bank.save(&dir, format).unwrap();
            assert!(path.ends_with(format!("registers.{}", format.extension())));

            let loaded = RegisterBank::new();
            assert!(loaded.load(&dir, format).unwrap());
            assert_eq!(loaded.read_holding_registers(0, 1).unwrap(), vec![0xBEEF]);
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_missing_data_dir() {
        let mut settings = settings(vec![EndpointConfig::new("local", "tcp://127.0.0.1:0")]);
        settings.persist_data = true;
        settings.data_dir = Some(PathBuf::from("/nonexistent/modbus-bridge-data"));

        let result = ServerBridge::start(&settings).await;
        assert!(matches!(result, Err(ServerError::NoDataDir(Some(_)))));
    }

    #[tokio::test]
    async fn test_persisted_across_restarts() {
        let dir = temp_dir("restart");
        let mut settings = settings(vec![EndpointConfig::new("local", "tcp://127.0.0.1:0")]);
        settings.persist_data = true;
        settings.data_dir = Some(dir.clone());
        settings.persist_format = Format::Cbor;

        let bridge = ServerBridge::start(&settings).await.unwrap();
        bridge.bank().write_holding_registers(42, &[4242]).unwrap();
        bridge.stop().await.unwrap();

        let bridge = ServerBridge::start(&settings).await.unwrap();
        assert_eq!(
            bridge.bank().read_holding_registers(42, 1).unwrap(),
            vec![4242]
        );
        bridge.stop().await.unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_failed_endpoint_stops_started_ones() {
        let settings = settings(vec![
            EndpointConfig::new("tcp", "tcp://127.0.0.1:0"),
            EndpointConfig::new("ascii", "ascii:///dev/ttyS0"),
        ]);

        let result = ServerBridge::start(&settings).await;
        let Err(ServerError::Start(failures)) = result else {
            panic!("expected start failure");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].endpoint, "ascii");
    }
}
