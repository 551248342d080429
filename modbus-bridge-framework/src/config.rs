//! Configuration traits and utilities.

use std::path::Path;

use serde::de::DeserializeOwned;

use crate::LoggingConfig;
use crate::error::{BridgeError, Result};

/// Trait for bridge configuration types.
///
/// Implement this trait for your bridge's configuration struct to get
/// automatic loading, validation, and access to common config fields.
///
/// # Example
///
/// ```ignore
/// use serde::Deserialize;
/// use modbus_bridge_framework::{BridgeConfig, BridgeError, LoggingConfig};
///
/// #[derive(Debug, Deserialize)]
/// pub struct MyBridgeConfig {
///     pub logging: LoggingConfig,
///     pub endpoints: Vec<EndpointConfig>,
/// }
///
/// impl BridgeConfig for MyBridgeConfig {
///     fn logging(&self) -> &LoggingConfig {
///         &self.logging
///     }
///
///     fn validate(&self) -> Result<()> {
///         if self.endpoints.is_empty() {
///             return Err(BridgeError::validation("At least one endpoint required"));
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait BridgeConfig: Sized + DeserializeOwned {
    /// Get the logging configuration.
    fn logging(&self) -> &LoggingConfig;

    /// Validate the configuration.
    ///
    /// Called automatically after loading. Override to add custom validation.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Load configuration from a file path.
    ///
    /// Supports JSON5 format. Calls [`validate`](Self::validate) after loading.
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(BridgeError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from a JSON5 string.
    fn parse(content: &str) -> Result<Self> {
        let config: Self = json5::from_str(content)?;

        config
            .logging()
            .validate()
            .map_err(|e| BridgeError::validation(e.to_string()))?;
        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct TestConfig {
        #[serde(default)]
        logging: LoggingConfig,
        endpoints: Vec<String>,
    }

    impl BridgeConfig for TestConfig {
        fn logging(&self) -> &LoggingConfig {
            &self.logging
        }

        fn validate(&self) -> Result<()> {
            if self.endpoints.is_empty() {
                return Err(BridgeError::validation("endpoints is required"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_config_not_found() {
        let result = TestConfig::load("/nonexistent/path.json5");
        assert!(matches!(result, Err(BridgeError::ConfigNotFound { .. })));
    }

    #[test]
    fn test_parse_runs_validation() {
        let result = TestConfig::parse("{ endpoints: [] }");
        assert!(matches!(result, Err(BridgeError::ConfigValidation(_))));

        let config = TestConfig::parse("{ endpoints: ['tcp://127.0.0.1:502'] }").unwrap();
        assert_eq!(config.endpoints.len(), 1);
    }

    #[test]
    fn test_parse_rejects_bad_log_level() {
        let result = TestConfig::parse("{ logging: { level: 'loud' }, endpoints: ['a'] }");
        assert!(matches!(result, Err(BridgeError::ConfigValidation(_))));
    }

    #[test]
    fn test_parse_error() {
        let result = TestConfig::parse("{ endpoints: ");
        assert!(matches!(result, Err(BridgeError::ConfigParse(_))));
    }
}
