//! Named readings from configured blocks of one endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::client::{ClientError, ResilientClient};
use crate::config::{ConfigError, SensorBlock, SensorConfig, SensorValueType, ValueRegister};
use crate::transport::Connector;

/// Sensor errors.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("Invalid sensor configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Block '{block}': {source}")]
    Read {
        block: String,
        #[source]
        source: ClientError,
    },

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Map of reading name to value.
pub type Readings = BTreeMap<String, Value>;

/// A sensor reading every configured block on each call.
#[derive(Debug)]
pub struct ModbusSensor {
    client: Arc<ResilientClient>,
    unit: Option<u8>,
    blocks: Vec<SensorBlock>,
}

impl ModbusSensor {
    /// Validate the configuration and connect.
    pub async fn connect(
        config: SensorConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, SensorError> {
        config.validate()?;
        let client = ResilientClient::connect(config.modbus, connector).await?;
        let sensor = Self::new(Arc::new(client), config.blocks);
        Ok(match config.unit {
            Some(unit) => sensor.with_unit(unit),
            None => sensor,
        })
    }

    /// Build a sensor over an existing client.
    pub fn new(client: Arc<ResilientClient>, blocks: Vec<SensorBlock>) -> Self {
        Self {
            client,
            unit: None,
            blocks,
        }
    }

    /// Address every read to `unit` instead of the endpoint's server id.
    pub fn with_unit(mut self, unit: u8) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn client(&self) -> &Arc<ResilientClient> {
        &self.client
    }

    /// Read every block. A failing block fails the whole reading.
    pub async fn readings(&self) -> Result<Readings, SensorError> {
        let mut readings = Readings::new();
        for block in &self.blocks {
            self.read_block(block, &mut readings)
                .await
                .map_err(|source| SensorError::Read {
                    block: block.name.clone(),
                    source,
                })?;
        }
        Ok(readings)
    }

    async fn read_block(&self, block: &SensorBlock, out: &mut Readings) -> Result<(), ClientError> {
        let client = &self.client;
        let (offset, length, unit) = (block.offset, block.length, self.unit);

        if let Some(scalar) = block.value_type.scalar() {
            let value = client
                .read_scalar(block.register, scalar, offset, unit)
                .await?;
            out.insert(block.name.clone(), serde_json::json!(value));
            return Ok(());
        }

        match block.value_type {
            SensorValueType::Coils => {
                let bits = client.read_coils(offset, length, unit).await?;
                insert_indexed(out, &block.name, bits.into_iter().map(Value::Bool));
            }
            SensorValueType::DiscreteInputs => {
                let bits = client.read_discrete_inputs(offset, length, unit).await?;
                insert_indexed(out, &block.name, bits.into_iter().map(Value::Bool));
            }
            SensorValueType::HoldingRegisters | SensorValueType::InputRegisters => {
                let register = if block.value_type == SensorValueType::InputRegisters {
                    ValueRegister::InputRegisters
                } else {
                    ValueRegister::HoldingRegisters
                };
                let words = client.read_words(register, offset, length, unit).await?;
                insert_indexed(
                    out,
                    &block.name,
                    words.into_iter().map(|w| Value::String(w.to_string())),
                );
            }
            SensorValueType::Bytes => {
                let bytes = client
                    .read_bytes(block.register, offset, length, unit)
                    .await?;
                out.insert(block.name.clone(), Value::String(hex::encode(bytes)));
            }
            SensorValueType::RawBytes => {
                let bytes = client
                    .read_raw_bytes(block.register, offset, length, unit)
                    .await?;
                out.insert(block.name.clone(), Value::String(hex::encode(bytes)));
            }
            _ => {}
        }
        Ok(())
    }

    /// Close the underlying client.
    pub async fn close(&self) -> Result<(), SensorError> {
        Ok(self.client.close().await?)
    }
}

fn insert_indexed(out: &mut Readings, name: &str, values: impl Iterator<Item = Value>) {
    for (i, value) in values.enumerate() {
        out.insert(format!("{}_{}", name, i), value);
    }
}
