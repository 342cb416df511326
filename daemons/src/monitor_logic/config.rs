use clap::Parser;
use lib_common::{ConfigError, RelayConfig};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[clap(about = "Relays the latest magnetometer record from the logger's FTP server to MQTT", version)]
pub struct Cli {
    #[clap(long, short = '1', help = "Run a single cycle and exit (status 0 only when the record was published).")]
    pub once: bool,

    #[clap(
        long = "config",
        env = "MAGNET_CONFIG_PATH",
        default_value = "config.json",
        help = "Path to the JSON configuration file."
    )]
    pub config_path: PathBuf,

    #[clap(long, env = "MAGNET_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error, off).")]
    pub log_level: Option<String>,
}

impl Cli {
    // Values given on the command line or through the environment win over the file.
    fn apply_overrides(&self, mut config: RelayConfig) -> RelayConfig {
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        config
    }
}

/// Loads and validates the configuration file named by `cli`, then applies
/// the CLI/env overrides.
pub fn load_config(cli: &Cli) -> Result<RelayConfig, ConfigError> {
    let config = RelayConfig::load_from_file(&cli.config_path)?;
    Ok(cli.apply_overrides(config))
}
