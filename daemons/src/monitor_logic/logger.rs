use anyhow::{Context, Result};
use colored::Colorize;
use lib_common::RelayConfig;
use lib_common::loggers::rotating_file::RotatingFile;

pub fn parse_level(log_level: &str) -> log::LevelFilter {
    match log_level.trim().to_lowercase().as_str() {
        "off" => log::LevelFilter::Off,
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" | "warning" => log::LevelFilter::Warn,
        "error" | "fatal" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    }
}

fn colored_level(level: log::Level) -> colored::ColoredString {
    let text = level.as_str();
    match level {
        log::Level::Error => text.bright_red(),
        log::Level::Warn => text.bright_yellow(),
        log::Level::Info => text.bright_green(),
        log::Level::Debug => text.bright_white(),
        log::Level::Trace => text.bright_cyan(),
    }
}

/// Installs the global logger: colored lines on stdout and, when `LOG_FILE`
/// is configured, plain lines in a size-rotated file.
pub fn setup_logging(config: &RelayConfig) -> Result<()> {
    let console = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                colored_level(record.level()),
                message
            ))
        })
        .chain(std::io::stdout());

    let mut dispatch = fern::Dispatch::new()
        .level(parse_level(&config.log_level))
        // The MQTT client is chatty at debug level.
        .level_for("rumqttc", log::LevelFilter::Info)
        .chain(console);

    if let Some(log_file) = &config.log_file {
        let sink = RotatingFile::open(log_file, config.log_max_bytes, config.log_backups)
            .with_context(|| format!("opening log file {}", log_file.display()))?;
        let file = fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "{}[{}][{}] {}",
                    chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                    record.target(),
                    record.level(),
                    message
                ))
            })
            .chain(fern::Output::writer(Box::new(sink), "\n"));
        dispatch = dispatch.chain(file);
    }

    dispatch.apply()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_are_forgiving() {
        assert_eq!(parse_level("DEBUG"), log::LevelFilter::Debug);
        assert_eq!(parse_level(" warning "), log::LevelFilter::Warn);
        assert_eq!(parse_level("fatal"), log::LevelFilter::Error);
        assert_eq!(parse_level("off"), log::LevelFilter::Off);
        assert_eq!(parse_level("verbose"), log::LevelFilter::Info);
    }
}
