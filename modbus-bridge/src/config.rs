//! Configuration for the Modbus bridge.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use modbus_bridge_common::{Format, LoggingConfig};
use modbus_bridge_framework::{BridgeConfig, BridgeError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{ByteOrder, Encoding, ScalarType, WordOrder};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn read_section(path: &Path) -> Result<String, ConfigError> {
    Ok(std::fs::read_to_string(path)?)
}

/// Complete configuration of the `modbus-bridge` binary.
#[derive(Debug, Clone, Deserialize)]
pub struct ModbusBridgeConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Client-side bridge between endpoints
    #[serde(default)]
    pub bridge: Option<BridgeSettings>,

    /// Local Modbus server endpoints
    #[serde(default)]
    pub servers: Option<ServerSettings>,
}

impl ModbusBridgeConfig {
    /// Validate every configured section.
    pub fn validate_sections(&self) -> Result<(), ConfigError> {
        if self.bridge.is_none() && self.servers.is_none() {
            return Err(invalid(
                "At least one of 'bridge' or 'servers' must be configured",
            ));
        }
        if let Some(bridge) = &self.bridge {
            bridge.validate()?;
        }
        if let Some(servers) = &self.servers {
            servers.validate()?;
        }
        Ok(())
    }
}

impl BridgeConfig for ModbusBridgeConfig {
    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn validate(&self) -> modbus_bridge_framework::Result<()> {
        self.validate_sections()
            .map_err(|e| BridgeError::validation(e.to_string()))
    }
}

/// Serial parity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    /// No parity
    #[default]
    #[serde(rename = "N", alias = "n", alias = "none")]
    None,
    /// Even parity
    #[serde(rename = "E", alias = "e", alias = "even")]
    Even,
    /// Odd parity
    #[serde(rename = "O", alias = "o", alias = "odd")]
    Odd,
}

/// Transport selected by an endpoint URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointUri {
    /// `tcp://host:port`
    Tcp { host: String, port: u16 },
    /// `rtu:///dev/path`
    Rtu { path: String },
    /// `ascii:///dev/path`
    Ascii { path: String },
}

impl EndpointUri {
    /// Parse an endpoint URI.
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        if uri.is_empty() {
            return Err(invalid("endpoint is required"));
        }
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| invalid(format!("endpoint '{}' has no scheme", uri)))?;

        match scheme.to_ascii_lowercase().as_str() {
            "tcp" => {
                let (host, port) = split_host_port(rest.trim_end_matches('/'))
                    .ok_or_else(|| invalid(format!("endpoint '{}' has an invalid address", uri)))?;
                Ok(EndpointUri::Tcp { host, port })
            }
            "rtu" | "ascii" => {
                if rest.is_empty() {
                    return Err(invalid(format!("endpoint '{}' has no device path", uri)));
                }
                let path = rest.to_string();
                if scheme.eq_ignore_ascii_case("rtu") {
                    Ok(EndpointUri::Rtu { path })
                } else {
                    Ok(EndpointUri::Ascii { path })
                }
            }
            other => Err(invalid(format!(
                "endpoint '{}' has unsupported scheme '{}' (use tcp, rtu or ascii)",
                uri, other
            ))),
        }
    }

    /// Whether this endpoint talks over a serial line.
    pub fn is_serial(&self) -> bool {
        !matches!(self, EndpointUri::Tcp { .. })
    }
}

fn split_host_port(addr: &str) -> Option<(String, u16)> {
    // Bracketed IPv6: [::1]:502
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None if tail.is_empty() => default_modbus_port(),
            None => return None,
        };
        return (!host.is_empty()).then(|| (host.to_string(), port));
    }

    let (host, port) = match addr.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().ok()?),
        None => (addr, default_modbus_port()),
    };
    if host.is_empty() || host.contains(':') {
        return None;
    }
    Some((host.to_string(), port))
}

impl fmt::Display for EndpointUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointUri::Tcp { host, port } if host.contains(':') => {
                write!(f, "tcp://[{}]:{}", host, port)
            }
            EndpointUri::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            EndpointUri::Rtu { path } => write!(f, "rtu://{}", path),
            EndpointUri::Ascii { path } => write!(f, "ascii://{}", path),
        }
    }
}

/// A named Modbus endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Endpoint name (referenced by bridge blocks)
    pub name: String,

    /// Endpoint URI: `tcp://host:port`, `rtu:///dev/ttyUSB0`, `ascii:///dev/ttyS0`
    pub endpoint: String,

    /// Modbus unit/server ID applied before each request
    #[serde(default, alias = "unit_id")]
    pub server_id: Option<u8>,

    /// Serial speed in baud
    #[serde(default = "default_speed", alias = "baud_rate")]
    pub speed: u32,

    /// Data bits (default 8 for rtu, 7 for ascii)
    #[serde(default)]
    pub data_bits: Option<u8>,

    /// Parity: "N", "E" or "O"
    #[serde(default)]
    pub parity: Parity,

    /// Stop bits: 1 or 2
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,

    /// I/O timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Byte order within a register
    #[serde(default)]
    pub byte_order: ByteOrder,

    /// Word order across multi-register values
    #[serde(default)]
    pub word_order: WordOrder,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_speed() -> u32 {
    9600
}

fn default_stop_bits() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    1000
}

impl EndpointConfig {
    /// Endpoint with default transport parameters.
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            server_id: None,
            speed: default_speed(),
            data_bits: None,
            parity: Parity::default(),
            stop_bits: default_stop_bits(),
            timeout_ms: default_timeout_ms(),
            byte_order: ByteOrder::default(),
            word_order: WordOrder::default(),
        }
    }

    /// Set the unit/server ID.
    pub fn with_server_id(mut self, id: u8) -> Self {
        self.server_id = Some(id);
        self
    }

    /// Parse the endpoint URI.
    pub fn uri(&self) -> Result<EndpointUri, ConfigError> {
        EndpointUri::parse(&self.endpoint)
    }

    /// Effective data bits for the endpoint's transport.
    pub fn effective_data_bits(&self) -> u8 {
        match (self.data_bits, self.uri()) {
            (Some(bits), _) => bits,
            (None, Ok(EndpointUri::Ascii { .. })) => 7,
            (None, _) => 8,
        }
    }

    /// I/O timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Register encoding of this endpoint.
    pub fn encoding(&self) -> Encoding {
        Encoding::new(self.byte_order, self.word_order)
    }

    /// Validate the endpoint and its transport parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(invalid("Endpoint name cannot be empty"));
        }
        let uri = self
            .uri()
            .map_err(|e| invalid(format!("Endpoint '{}': {}", self.name, strip(e))))?;

        if self.timeout_ms == 0 {
            return Err(invalid(format!(
                "Endpoint '{}': timeout_ms must be greater than 0",
                self.name
            )));
        }
        if let Some(0) = self.server_id {
            // Unit 0 is broadcast; requests to it never get a response.
            return Err(invalid(format!(
                "Endpoint '{}': server_id must be 1-247",
                self.name
            )));
        }

        if !uri.is_serial() {
            return Ok(());
        }
        if self.speed == 0 {
            return Err(invalid(format!(
                "Endpoint '{}': speed must be greater than 0",
                self.name
            )));
        }

        let data_bits = self.effective_data_bits();
        match uri {
            EndpointUri::Rtu { .. } => {
                if data_bits != 8 {
                    return Err(invalid(format!(
                        "Endpoint '{}': rtu requires 8 data bits, got {}",
                        self.name, data_bits
                    )));
                }
                if !matches!(self.stop_bits, 1 | 2) {
                    return Err(invalid(format!(
                        "Endpoint '{}': rtu requires 1 or 2 stop bits, got {}",
                        self.name, self.stop_bits
                    )));
                }
            }
            EndpointUri::Ascii { .. } => {
                if data_bits != 7 {
                    return Err(invalid(format!(
                        "Endpoint '{}': ascii requires 7 data bits, got {}",
                        self.name, data_bits
                    )));
                }
                if self.stop_bits != 1 {
                    return Err(invalid(format!(
                        "Endpoint '{}': ascii requires 1 stop bit, got {}",
                        self.name, self.stop_bits
                    )));
                }
            }
            EndpointUri::Tcp { .. } => {}
        }
        Ok(())
    }
}

fn strip(err: ConfigError) -> String {
    match err {
        ConfigError::Validation(msg) => msg,
        other => other.to_string(),
    }
}

/// Validate a list of endpoints and reject duplicate names.
pub fn validate_endpoints(endpoints: &[EndpointConfig]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for endpoint in endpoints {
        endpoint.validate()?;
        if !names.insert(endpoint.name.as_str()) {
            return Err(invalid(format!(
                "Duplicate endpoint name '{}'",
                endpoint.name
            )));
        }
    }
    Ok(())
}

/// Modbus register kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    /// Read/write, 1-bit
    Coils,
    /// Read-only, 1-bit
    DiscreteInputs,
    /// Read/write, 16-bit
    HoldingRegisters,
    /// Read-only, 16-bit
    InputRegisters,
}

impl RegisterKind {
    /// Return the configuration name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterKind::Coils => "coils",
            RegisterKind::DiscreteInputs => "discrete_inputs",
            RegisterKind::HoldingRegisters => "holding_registers",
            RegisterKind::InputRegisters => "input_registers",
        }
    }

    /// Whether values of this kind are single bits.
    pub fn is_bit(&self) -> bool {
        matches!(self, RegisterKind::Coils | RegisterKind::DiscreteInputs)
    }

    /// Whether a client may write this kind.
    pub fn is_writable(&self) -> bool {
        matches!(self, RegisterKind::Coils | RegisterKind::HoldingRegisters)
    }

    /// The writable kind a bridge copies this kind into.
    pub fn bridge_destination(&self) -> RegisterKind {
        if self.is_bit() {
            RegisterKind::Coils
        } else {
            RegisterKind::HoldingRegisters
        }
    }

    /// Maximum quantity one request may carry for this kind.
    pub fn max_quantity(&self) -> u16 {
        if self.is_bit() { 1968 } else { 123 }
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-side bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Endpoints the blocks read from and write to
    pub endpoints: Vec<EndpointConfig>,

    /// Interval between iterations of every block, in milliseconds
    pub update_time_ms: u64,

    /// Blocks to copy
    #[serde(default)]
    pub blocks: Vec<BridgeBlock>,
}

impl BridgeSettings {
    /// Interval between iterations.
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_time_ms)
    }

    /// Validate endpoints, interval and block references.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(invalid("At least one endpoint must be configured"));
        }
        if self.update_time_ms == 0 {
            return Err(invalid("update_time_ms must be greater than 0"));
        }
        validate_endpoints(&self.endpoints)?;

        for block in &self.blocks {
            block.validate()?;
            for name in [&block.src, &block.dst] {
                if !self.endpoints.iter().any(|e| &e.name == name) {
                    return Err(invalid(format!(
                        "Block '{}': unknown endpoint '{}'",
                        block.label(),
                        name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A contiguous range copied from one endpoint to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeBlock {
    /// Optional block name (used in logs and readings)
    #[serde(default)]
    pub name: Option<String>,

    /// Source endpoint name
    pub src: String,

    /// Source start address
    #[serde(default)]
    pub src_offset: u16,

    /// Source register kind
    pub src_register: RegisterKind,

    /// Destination endpoint name
    pub dst: String,

    /// Destination start address
    #[serde(default)]
    pub dst_offset: u16,

    /// Destination register kind
    pub dst_register: RegisterKind,

    /// Number of coils or registers to copy
    pub length: u16,
}

impl BridgeBlock {
    /// Name used in logs: the configured name or `src:offset->dst:offset`.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!(
                "{}:{}->{}:{}",
                self.src, self.src_offset, self.dst, self.dst_offset
            ),
        }
    }

    /// Validate length and the register mapping.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let label = self.label();
        if self.src.is_empty() || self.dst.is_empty() {
            return Err(invalid(format!("Block '{}': src and dst are required", label)));
        }
        if self.length == 0 {
            return Err(invalid(format!(
                "Block '{}': length must be greater than 0",
                label
            )));
        }
        if self.length > self.src_register.max_quantity() {
            return Err(invalid(format!(
                "Block '{}': length {} exceeds {} for {}",
                label,
                self.length,
                self.src_register.max_quantity(),
                self.src_register
            )));
        }
        let expected = self.src_register.bridge_destination();
        if self.dst_register != expected {
            return Err(invalid(format!(
                "Block '{}': {} must be bridged to {}, not {}",
                label, self.src_register, expected, self.dst_register
            )));
        }
        for (offset, side) in [(self.src_offset, "src"), (self.dst_offset, "dst")] {
            if u32::from(offset) + u32::from(self.length) > 0x1_0000 {
                return Err(invalid(format!(
                    "Block '{}': {} range exceeds the address space",
                    label, side
                )));
            }
        }
        Ok(())
    }
}

/// Value kinds a sensor block can read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorValueType {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
    Bytes,
    #[serde(alias = "rawBytes")]
    RawBytes,
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Uint64,
    Int64,
    Float32,
    Float64,
}

impl SensorValueType {
    /// Scalar type for single-value kinds.
    pub fn scalar(&self) -> Option<ScalarType> {
        Some(match self {
            SensorValueType::Uint8 => ScalarType::Uint8,
            SensorValueType::Int8 => ScalarType::Int8,
            SensorValueType::Uint16 => ScalarType::Uint16,
            SensorValueType::Int16 => ScalarType::Int16,
            SensorValueType::Uint32 => ScalarType::Uint32,
            SensorValueType::Int32 => ScalarType::Int32,
            SensorValueType::Uint64 => ScalarType::Uint64,
            SensorValueType::Int64 => ScalarType::Int64,
            SensorValueType::Float32 => ScalarType::Float32,
            SensorValueType::Float64 => ScalarType::Float64,
            _ => return None,
        })
    }
}

/// Register table typed values and byte blocks are read from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueRegister {
    #[default]
    #[serde(alias = "holding")]
    HoldingRegisters,
    #[serde(alias = "input")]
    InputRegisters,
}

impl From<ValueRegister> for RegisterKind {
    fn from(register: ValueRegister) -> Self {
        match register {
            ValueRegister::HoldingRegisters => RegisterKind::HoldingRegisters,
            ValueRegister::InputRegisters => RegisterKind::InputRegisters,
        }
    }
}

/// A named range read by a sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorBlock {
    /// Reading name (array kinds append `_<index>`)
    pub name: String,

    /// Start address
    #[serde(default)]
    pub offset: u16,

    /// Number of coils/registers for array and byte kinds
    #[serde(default)]
    pub length: u16,

    /// Value kind
    #[serde(rename = "type")]
    pub value_type: SensorValueType,

    /// Register table for typed values and bytes
    #[serde(default)]
    pub register: ValueRegister,
}

impl SensorBlock {
    /// Table an array or byte block reads from, `None` for scalars.
    pub fn register_kind(&self) -> Option<RegisterKind> {
        match self.value_type {
            SensorValueType::Coils => Some(RegisterKind::Coils),
            SensorValueType::DiscreteInputs => Some(RegisterKind::DiscreteInputs),
            SensorValueType::HoldingRegisters => Some(RegisterKind::HoldingRegisters),
            SensorValueType::InputRegisters => Some(RegisterKind::InputRegisters),
            SensorValueType::Bytes | SensorValueType::RawBytes => Some(self.register.into()),
            _ => None,
        }
    }

    /// Validate name and length.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(invalid("Sensor block name cannot be empty"));
        }
        let Some(kind) = self.register_kind() else {
            return Ok(());
        };
        if self.length == 0 {
            return Err(invalid(format!(
                "Sensor block '{}': length must be greater than 0",
                self.name
            )));
        }
        if self.length > kind.max_quantity() {
            return Err(invalid(format!(
                "Sensor block '{}': length {} exceeds {} for {}",
                self.name,
                self.length,
                kind.max_quantity(),
                kind
            )));
        }
        if u32::from(self.offset) + u32::from(self.length) > 0x1_0000 {
            return Err(invalid(format!(
                "Sensor block '{}': range exceeds the address space",
                self.name
            )));
        }
        Ok(())
    }
}

/// A sensor reading blocks from one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Endpoint to read from
    pub modbus: EndpointConfig,

    /// Unit addressed by every read (the endpoint's `server_id` when unset)
    #[serde(default, alias = "unit_id")]
    pub unit: Option<u8>,

    /// Blocks included in each reading
    pub blocks: Vec<SensorBlock>,
}

impl SensorConfig {
    /// Parse and validate a JSON5 sensor description.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::parse(&read_section(path.as_ref())?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.modbus.validate()?;
        if let Some(unit) = self.unit {
            if !(1..=247).contains(&unit) {
                return Err(invalid(format!(
                    "Sensor on '{}': unit {} must be 1-247",
                    self.modbus.name, unit
                )));
            }
        }
        let mut names = HashSet::new();
        for block in &self.blocks {
            block.validate()?;
            if !names.insert(block.name.as_str()) {
                return Err(invalid(format!(
                    "Duplicate sensor block name '{}'",
                    block.name
                )));
            }
        }
        Ok(())
    }
}

/// Pin direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinType {
    Input,
    Output,
}

/// A digital pin backed by a discrete input or a coil.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpioPinConfig {
    pub name: String,
    pub offset: u16,
    pub pin_type: PinType,
}

/// An analog pin backed by an input or holding register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalogPinConfig {
    pub name: String,
    pub offset: u16,
    pub pin_type: PinType,
    #[serde(default = "default_analog_type")]
    pub data_type: ScalarType,
}

fn default_analog_type() -> ScalarType {
    ScalarType::Uint16
}

/// A board exposing register-backed pins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardConfig {
    /// Endpoint the pins live on
    pub modbus: EndpointConfig,

    #[serde(default)]
    pub gpio_pins: Vec<GpioPinConfig>,

    #[serde(default)]
    pub analog_pins: Vec<AnalogPinConfig>,
}

impl BoardConfig {
    /// Parse and validate a JSON5 board description.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::parse(&read_section(path.as_ref())?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.modbus.validate()?;
        let mut names = HashSet::new();
        let pins = self
            .gpio_pins
            .iter()
            .map(|p| p.name.as_str())
            .chain(self.analog_pins.iter().map(|p| p.name.as_str()));
        for name in pins {
            if name.is_empty() {
                return Err(invalid("Pin name cannot be empty"));
            }
            if !names.insert(name) {
                return Err(invalid(format!("Duplicate pin name '{}'", name)));
            }
        }
        Ok(())
    }
}

/// Local Modbus server endpoints sharing one register bank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Endpoints to listen on (`server_id` is ignored: the bank answers every unit)
    pub endpoints: Vec<EndpointConfig>,

    /// Load the bank at start and save it at stop
    #[serde(default)]
    pub persist_data: bool,

    /// Directory holding the persisted bank
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Persisted file format
    #[serde(default)]
    pub persist_format: Format,
}

impl ServerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(invalid("At least one server endpoint must be configured"));
        }
        validate_endpoints(&self.endpoints)
    }
}
