//! CLI argument parsing for services.

use std::path::PathBuf;

use clap::Parser;

/// Common CLI arguments for modbus-agg services.
#[derive(Parser, Debug, Clone)]
#[command(about = "Modbus aggregator service")]
pub struct ServiceArgs {
    /// Path to configuration file.
    #[arg(short, long)]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override the listen address of the Modbus server.
    #[arg(short = 'a', long)]
    pub address: Option<String>,

    /// Override the listen port of the Modbus server.
    #[arg(short, long)]
    pub port: Option<u16>,
}

impl ServiceArgs {
    /// Parse CLI arguments with a default config path.
    ///
    /// If no `--config` argument is provided, uses the default.
    pub fn parse_with_default(default_config: &'static str) -> Self {
        let matches = <Self as clap::CommandFactory>::command()
            .mut_arg("config", |arg| arg.default_value(default_config))
            .get_matches();

        <Self as clap::FromArgMatches>::from_arg_matches(&matches).unwrap_or_else(|e| e.exit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_overrides() {
        let args = ServiceArgs::try_parse_from([
            "modbus-agg",
            "--config",
            "agg.json5",
            "-a",
            "127.0.0.1",
            "-p",
            "1502",
        ])
        .unwrap();

        assert_eq!(args.config, PathBuf::from("agg.json5"));
        assert_eq!(args.address.as_deref(), Some("127.0.0.1"));
        assert_eq!(args.port, Some(1502));
        assert_eq!(args.log_level, None);
    }

    #[test]
    fn test_rejects_invalid_port() {
        let result = ServiceArgs::try_parse_from(["modbus-agg", "-c", "agg.json5", "-p", "99999"]);
        assert!(result.is_err());
    }
}
