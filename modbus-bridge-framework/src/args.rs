//! CLI argument parsing for bridges.

use std::path::PathBuf;

use clap::Parser;

/// Common CLI arguments for the bridge binaries.
#[derive(Parser, Debug, Clone)]
#[command(about = "Modbus register bridge")]
pub struct BridgeArgs {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,
}

impl BridgeArgs {
    /// Parse CLI arguments with a default config path.
    ///
    /// If no `--config` argument is provided, uses the default.
    pub fn parse_with_default(default_config: &'static str) -> Self {
        let matches = <Self as clap::CommandFactory>::command()
            .mut_arg("config", |arg| arg.default_value(default_config))
            .get_matches();

        match <Self as clap::FromArgMatches>::from_arg_matches(&matches) {
            Ok(args) => args,
            Err(e) => e.exit(),
        }
    }

    /// Parse CLI arguments (requires --config to be specified).
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_from_iter() {
        let args =
            BridgeArgs::try_parse_from(["modbus-bridge", "-c", "plant.json5", "--log-level", "debug"])
                .unwrap();
        assert_eq!(args.config, PathBuf::from("plant.json5"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_config_is_required() {
        assert!(BridgeArgs::try_parse_from(["modbus-bridge"]).is_err());
    }
}
