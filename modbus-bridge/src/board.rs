//! Register-backed GPIO and analog pins.
//!
//! Digital inputs map to discrete inputs and digital outputs to coils.
//! Analog inputs map to input registers and analog outputs to holding
//! registers, decoded with the pin's data type. PWM is not available on
//! register-backed pins.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::client::{ClientError, ResilientClient};
use crate::codec::{ScalarType, ScalarValue};
use crate::config::{AnalogPinConfig, BoardConfig, ConfigError, GpioPinConfig, PinType, ValueRegister};
use crate::transport::Connector;

/// Board errors.
#[derive(Debug, Error)]
pub enum BoardError {
    #[error("Invalid board configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Unknown pin '{0}'")]
    UnknownPin(String),

    #[error("Pin '{0}' is an input and cannot be written")]
    InputPin(String),

    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// A digital pin.
#[derive(Debug, Clone)]
pub struct GpioPin {
    client: Arc<ResilientClient>,
    config: GpioPinConfig,
}

impl GpioPin {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Read the pin level.
    pub async fn get(&self) -> Result<bool, BoardError> {
        let offset = self.config.offset;
        let level = match self.config.pin_type {
            PinType::Input => self.client.read_discrete_input(offset, None).await?,
            PinType::Output => self.client.read_coil(offset, None).await?,
        };
        Ok(level)
    }

    /// Drive an output pin.
    pub async fn set(&self, high: bool) -> Result<(), BoardError> {
        if self.config.pin_type == PinType::Input {
            return Err(BoardError::InputPin(self.config.name.clone()));
        }
        Ok(self
            .client
            .write_coil(self.config.offset, high, None)
            .await?)
    }

    pub fn pwm(&self) -> Result<f64, BoardError> {
        Err(BoardError::Unsupported("pwm"))
    }

    pub fn set_pwm(&self, _duty_cycle: f64) -> Result<(), BoardError> {
        Err(BoardError::Unsupported("pwm"))
    }

    pub fn pwm_frequency(&self) -> Result<u32, BoardError> {
        Err(BoardError::Unsupported("pwm frequency"))
    }

    pub fn set_pwm_frequency(&self, _hz: u32) -> Result<(), BoardError> {
        Err(BoardError::Unsupported("pwm frequency"))
    }
}

/// An analog pin.
#[derive(Debug, Clone)]
pub struct AnalogPin {
    client: Arc<ResilientClient>,
    config: AnalogPinConfig,
}

impl AnalogPin {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn data_type(&self) -> ScalarType {
        self.config.data_type
    }

    fn register(&self) -> ValueRegister {
        match self.config.pin_type {
            PinType::Input => ValueRegister::InputRegisters,
            PinType::Output => ValueRegister::HoldingRegisters,
        }
    }

    pub async fn read(&self) -> Result<ScalarValue, BoardError> {
        Ok(self
            .client
            .read_scalar(self.register(), self.config.data_type, self.config.offset, None)
            .await?)
    }

    /// Write an output pin, converting `value` to the pin's data type.
    pub async fn write(&self, value: i64) -> Result<(), BoardError> {
        if self.config.pin_type == PinType::Input {
            return Err(BoardError::InputPin(self.config.name.clone()));
        }
        let value = self.config.data_type.from_i64(value);
        Ok(self
            .client
            .write_scalar(self.config.offset, value, None)
            .await?)
    }
}

/// A board whose pins live on one Modbus endpoint.
#[derive(Debug)]
pub struct ModbusBoard {
    client: Arc<ResilientClient>,
    gpio: HashMap<String, GpioPin>,
    analog: HashMap<String, AnalogPin>,
}

impl ModbusBoard {
    /// Validate the configuration and connect.
    pub async fn connect(
        config: BoardConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, BoardError> {
        config.validate()?;
        let client = Arc::new(ResilientClient::connect(config.modbus, connector).await?);

        let gpio = config
            .gpio_pins
            .into_iter()
            .map(|config| {
                let pin = GpioPin {
                    client: client.clone(),
                    config,
                };
                (pin.config.name.clone(), pin)
            })
            .collect();
        let analog = config
            .analog_pins
            .into_iter()
            .map(|config| {
                let pin = AnalogPin {
                    client: client.clone(),
                    config,
                };
                (pin.config.name.clone(), pin)
            })
            .collect();

        Ok(Self {
            client,
            gpio,
            analog,
        })
    }

    pub fn gpio_pin(&self, name: &str) -> Result<&GpioPin, BoardError> {
        self.gpio
            .get(name)
            .ok_or_else(|| BoardError::UnknownPin(name.to_string()))
    }

    pub fn analog_pin(&self, name: &str) -> Result<&AnalogPin, BoardError> {
        self.analog
            .get(name)
            .ok_or_else(|| BoardError::UnknownPin(name.to_string()))
    }

    pub fn gpio_names(&self) -> impl Iterator<Item = &str> {
        self.gpio.keys().map(String::as_str)
    }

    pub fn analog_names(&self) -> impl Iterator<Item = &str> {
        self.analog.keys().map(String::as_str)
    }

    pub async fn close(&self) -> Result<(), BoardError> {
        Ok(self.client.close().await?)
    }
}
