use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;

use lib_common::connections::MqttPublisher;
use lib_common::ingestors::{FtpSource, LastLineExtractor};
use lib_common::utils::misc::sys_info::SysinfoProbe;
use lib_common::{LeakDetector, Scheduler, SchedulerSettings};

mod monitor_logic;
use monitor_logic::{config, logger};

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine; real environment variables still apply.
    let _ = dotenvy::dotenv();
    let cli = config::Cli::parse();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("magnet_monitor: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: config::Cli) -> Result<bool> {
    let config = config::load_config(&cli).context("Fatal configuration error")?;
    logger::setup_logging(&config)?;
    log::info!("Starting magnet monitor with {}", config);

    let ftp = Arc::new(FtpSource::from_config(&config));
    let mut scheduler = Scheduler::new(
        SchedulerSettings::from_config(&config),
        ftp.clone(),
        ftp,
        Arc::new(LastLineExtractor),
        Box::new(MqttPublisher::from_config(&config)),
        LeakDetector::new(Box::new(SysinfoProbe::new())),
    );

    if cli.once {
        return Ok(scheduler.run_once().await);
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let signals = tokio::spawn(async move {
        wait_for_signal().await;
        // Send shutdown signal to the scheduler
        let _ = shutdown_tx.send(());
    });

    scheduler.run(shutdown_rx).await;
    signals.abort();

    log::info!("Shutdown complete.");
    Ok(true)
}

async fn wait_for_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }
}
