//! # Relay Scheduler
//!
//! The self-scheduling loop of the agent. Each cycle walks the same phase
//! sequence, strictly one phase after another:
//!
//! `Discovering → Downloading → Extracting → Publishing → SleepingPoll`
//!
//! ## Scheduling Rules:
//! - Discovery, download and extraction failures end the cycle early and are
//!   followed by the (shorter) retry interval.
//! - Once a file was downloaded the poll interval applies, whatever the
//!   publish outcome. A failed publish is a warning; the next cycle reconnects.
//! - An empty record is "nothing to publish": the publisher is not called.
//! - Every `leak_check_every`-th cycle runs exactly one memory check first.
//! - A panic escaping any collaborator is caught at the cycle boundary and
//!   followed by a fixed cooldown in `Recovering`; the loop itself never dies.
//!
//! Shutdown is observed between cycles and during every sleep. On the way out
//! the publisher is disconnected and the scheduler parks in `Stopped`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

use super::leak_detector::LeakDetector;
use crate::configs::config_relay::RelayConfig;
use crate::connections::mqtt_publisher::{Delivery, PublishError, RecordPublisher};
use crate::ingestors::file_discovery::{DiscoveryError, FileDiscovery, ListingProvider};
use crate::ingestors::ftp_source::{Downloader, TransferError};
use crate::ingestors::row_extractor::RowExtractor;

/// Cooldown after a cycle that panicked.
pub const RECOVERY_COOLDOWN: Duration = Duration::from_secs(10);
/// Leak checks run on every cycle number divisible by this.
pub const LEAK_CHECK_EVERY: u64 = 10;

/// # Cycle State
///
/// Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    /// Constructed, no cycle started yet.
    Idle,
    /// Listing the remote directory.
    Discovering,
    /// Transferring the selected file.
    Downloading,
    /// Reading the latest record from the local copy.
    Extracting,
    /// Handing the record to the broker.
    Publishing,
    /// Waiting the poll interval after a completed transfer.
    SleepingPoll,
    /// Waiting the retry interval after a failure.
    SleepingRetry,
    /// Cooling down after a panicked cycle.
    Recovering,
    /// Terminal; reached after single-shot mode or shutdown.
    Stopped,
}

/// # Scheduler Settings
///
/// Timing and location knobs of the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Remote directory searched for data files.
    pub remote_dir: String,
    /// Pause after a cycle that downloaded a file.
    pub poll_interval: Duration,
    /// Pause after a discovery, download or extraction failure.
    pub retry_interval: Duration,
    /// Pause after a panicked cycle.
    pub recovery_cooldown: Duration,
    /// Cycle cadence of the leak check; `0` disables it.
    pub leak_check_every: u64,
}

impl SchedulerSettings {
    /// Builds the settings from the relay configuration.
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            remote_dir: config.remote_dir.clone(),
            poll_interval: Duration::from_secs(config.poll_interval),
            retry_interval: Duration::from_secs(config.retry_interval),
            recovery_cooldown: RECOVERY_COOLDOWN,
            leak_check_every: LEAK_CHECK_EVERY,
        }
    }
}

/// The definite result of a cycle that ran to completion.
#[derive(Debug)]
pub enum CycleOutcome {
    /// The record was handed to the broker.
    Published(Delivery),
    /// The file had no record yet; the publisher was not called.
    NothingToPublish,
    /// No file could be selected.
    DiscoveryFailed(DiscoveryError),
    /// Download or extraction failed.
    TransferFailed(TransferError),
    /// The file was read but the publish failed.
    DeliveryFailed(PublishError),
}

impl CycleOutcome {
    /// Whether the outcome is followed by the retry interval.
    pub fn needs_retry(&self) -> bool {
        matches!(
            self,
            CycleOutcome::DiscoveryFailed(_) | CycleOutcome::TransferFailed(_)
        )
    }
}

/// A fault that escaped a cycle.
#[derive(Debug, Error)]
pub enum CycleFault {
    /// A collaborator panicked.
    #[error("cycle panicked: {0}")]
    Panicked(String),
}

/// # Cycle Report
///
/// One per loop iteration.
#[derive(Debug)]
pub struct CycleReport {
    /// The cycle number, starting at 1.
    pub cycle: u64,
    /// `Some(suspected)` on cycles that ran a leak check.
    pub leak_suspected: Option<bool>,
    /// What the cycle produced.
    pub result: Result<CycleOutcome, CycleFault>,
}

impl CycleReport {
    /// Whether a record reached the broker, confirmed or still queued.
    pub fn published(&self) -> bool {
        matches!(
            self.result,
            Ok(CycleOutcome::Published(
                Delivery::Confirmed { .. } | Delivery::Unconfirmed { .. }
            ))
        )
    }
}

/// # Scheduler
///
/// Owns every collaborator of a cycle plus the leak detector.
pub struct Scheduler {
    settings: SchedulerSettings,
    discovery: FileDiscovery,
    downloader: Arc<dyn Downloader>,
    extractor: Arc<dyn RowExtractor>,
    publisher: Box<dyn RecordPublisher>,
    leak_detector: LeakDetector,
    state: CycleState,
    cycle: u64,
}

impl Scheduler {
    /// Wires a scheduler in the `Idle` state.
    pub fn new(
        settings: SchedulerSettings,
        listing: Arc<dyn ListingProvider>,
        downloader: Arc<dyn Downloader>,
        extractor: Arc<dyn RowExtractor>,
        publisher: Box<dyn RecordPublisher>,
        leak_detector: LeakDetector,
    ) -> Self {
        Self {
            settings,
            discovery: FileDiscovery::new(listing),
            downloader,
            extractor,
            publisher,
            leak_detector,
            state: CycleState::Idle,
            cycle: 0,
        }
    }

    /// The active state.
    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Cycles started so far.
    pub fn cycle_count(&self) -> u64 {
        self.cycle
    }

    /// The owned leak detector, e.g. to re-anchor its baseline.
    pub fn leak_detector_mut(&mut self) -> &mut LeakDetector {
        &mut self.leak_detector
    }

    /// # Tick
    ///
    /// Runs one full cycle (leak cadence included) without sleeping. A panic
    /// inside the cycle is caught and reported as [`CycleFault::Panicked`].
    pub async fn tick(&mut self) -> CycleReport {
        self.cycle += 1;
        let cycle = self.cycle;
        log::info!("[cycle {}] Starting", cycle);

        // A panicking memory reading is a cycle fault too.
        let mut leak_suspected = None;
        let guarded = async {
            leak_suspected = self.check_memory(cycle);
            self.run_cycle(cycle).await
        };

        let result = match AssertUnwindSafe(guarded).catch_unwind().await {
            Ok(outcome) => Ok(outcome),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("[cycle {}] Unexpected fault: {}", cycle, message);
                self.state = CycleState::Recovering;
                Err(CycleFault::Panicked(message))
            }
        };

        CycleReport {
            cycle,
            leak_suspected,
            result,
        }
    }

    fn check_memory(&mut self, cycle: u64) -> Option<bool> {
        let every = self.settings.leak_check_every;
        if every == 0 || cycle % every != 0 {
            return None;
        }
        let suspected = self.leak_detector.check_and_log(&format!("cycle {}", cycle));
        if suspected {
            log::warn!("[cycle {}] Memory growth looks like a leak, continuing", cycle);
        }
        Some(suspected)
    }

    async fn run_cycle(&mut self, cycle: u64) -> CycleOutcome {
        self.state = CycleState::Discovering;
        let remote = match self.discovery.discover(&self.settings.remote_dir).await {
            Ok(remote) => remote,
            Err(e) => {
                log::error!("[cycle {}] Discovery failed: {}", cycle, e);
                return CycleOutcome::DiscoveryFailed(e);
            }
        };

        self.state = CycleState::Downloading;
        let local = match self.downloader.fetch(&remote).await {
            Ok(local) => local,
            Err(e) => {
                log::error!("[cycle {}] Download of {} failed: {}", cycle, remote, e);
                return CycleOutcome::TransferFailed(e);
            }
        };

        self.state = CycleState::Extracting;
        let record = match self.extractor.latest_record(&local).await {
            Ok(record) => record,
            Err(e) => {
                log::error!(
                    "[cycle {}] Reading {} (from {}) failed: {}",
                    cycle,
                    local.display(),
                    remote,
                    e
                );
                return CycleOutcome::TransferFailed(e);
            }
        };
        if record.is_empty() {
            log::info!("[cycle {}] {} holds no record yet, nothing to publish", cycle, remote);
            return CycleOutcome::NothingToPublish;
        }
        log::info!("[cycle {}] Latest record from {}: {}", cycle, remote, record);

        self.state = CycleState::Publishing;
        match self.publisher.publish(&record).await {
            Ok(delivery) => {
                match delivery {
                    Delivery::Confirmed { message_id } => {
                        log::info!("[cycle {}] Record delivered (message {})", cycle, message_id)
                    }
                    Delivery::Unconfirmed { .. } => {
                        log::warn!("[cycle {}] Record queued without confirmation", cycle)
                    }
                    Delivery::Skipped => log::info!("[cycle {}] Publish skipped", cycle),
                }
                CycleOutcome::Published(delivery)
            }
            Err(e) => {
                log::warn!("[cycle {}] Publishing record from {} failed: {}", cycle, remote, e);
                CycleOutcome::DeliveryFailed(e)
            }
        }
    }

    /// How long to wait after the cycle described by `report`.
    pub fn pause_for(&self, report: &CycleReport) -> Duration {
        match &report.result {
            Err(_) => self.settings.recovery_cooldown,
            Ok(outcome) if outcome.needs_retry() => self.settings.retry_interval,
            Ok(_) => self.settings.poll_interval,
        }
    }

    fn resting_state(report: &CycleReport) -> CycleState {
        match &report.result {
            Err(_) => CycleState::Recovering,
            Ok(outcome) if outcome.needs_retry() => CycleState::SleepingRetry,
            Ok(_) => CycleState::SleepingPoll,
        }
    }

    /// # Run
    ///
    /// The daemon loop. Returns once `shutdown` fires (or every sender is
    /// dropped), after disconnecting the publisher.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) {
        log::info!(
            "Scheduler started: remote dir {}, poll {}s, retry {}s",
            self.settings.remote_dir,
            self.settings.poll_interval.as_secs(),
            self.settings.retry_interval.as_secs()
        );

        loop {
            if !matches!(shutdown.try_recv(), Err(TryRecvError::Empty)) {
                log::info!("Shutdown requested before cycle {}", self.cycle + 1);
                break;
            }

            let report = self.tick().await;
            let pause = self.pause_for(&report);
            self.state = Self::resting_state(&report);
            log::info!(
                "[cycle {}] Next cycle in {}s ({:?})",
                report.cycle,
                pause.as_secs(),
                self.state
            );

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.recv() => {
                    log::info!("Shutdown requested while {:?}", self.state);
                    break;
                }
            }
        }

        self.stop().await;
    }

    /// # Run Once
    ///
    /// Runs a single cycle and disconnects. Returns `true` when the record was
    /// published (confirmed or queued).
    pub async fn run_once(&mut self) -> bool {
        let report = self.tick().await;
        let published = report.published();
        if published {
            log::info!("Single run finished: record published");
        } else {
            log::warn!("Single run finished without publishing: {:?}", report.result);
        }
        self.stop().await;
        published
    }

    async fn stop(&mut self) {
        self.publisher.disconnect().await;
        self.state = CycleState::Stopped;
        log::info!("Scheduler stopped after {} cycle(s)", self.cycle);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::misc::sys_info::MemoryProbe;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};

    struct Listing(&'static str);

    #[async_trait]
    impl ListingProvider for Listing {
        async fn list(&self, _dir: &str) -> Result<String, TransferError> {
            Ok(self.0.to_string())
        }
    }

    struct Fetch;

    #[async_trait]
    impl Downloader for Fetch {
        async fn fetch(&self, remote_path: &str) -> Result<PathBuf, TransferError> {
            Ok(PathBuf::from(remote_path))
        }
    }

    struct Record(&'static str);

    #[async_trait]
    impl RowExtractor for Record {
        async fn latest_record(&self, _path: &Path) -> Result<String, TransferError> {
            Ok(self.0.to_string())
        }
    }

    struct Acking;

    #[async_trait]
    impl RecordPublisher for Acking {
        async fn publish(&mut self, _payload: &str) -> Result<Delivery, PublishError> {
            Ok(Delivery::Confirmed { message_id: 1 })
        }
        async fn disconnect(&mut self) {}
    }

    struct Flat;

    impl MemoryProbe for Flat {
        fn resident_bytes(&mut self) -> Option<u64> {
            Some(1024)
        }
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            remote_dir: "/CFDisk/mindata/".to_string(),
            poll_interval: Duration::from_secs(300),
            retry_interval: Duration::from_secs(120),
            recovery_cooldown: RECOVERY_COOLDOWN,
            leak_check_every: LEAK_CHECK_EVERY,
        }
    }

    fn build(listing: &'static str, record: &'static str) -> Scheduler {
        Scheduler::new(
            settings(),
            Arc::new(Listing(listing)),
            Arc::new(Fetch),
            Arc::new(Record(record)),
            Box::new(Acking),
            LeakDetector::new(Box::new(Flat)),
        )
    }

    #[test]
    fn settings_follow_config() {
        let config: RelayConfig = serde_json::from_str(r#"{"POLL_INTERVAL": 60, "RETRY_INTERVAL": 15}"#).unwrap();
        let settings = SchedulerSettings::from_config(&config);
        assert_eq!(settings.poll_interval, Duration::from_secs(60));
        assert_eq!(settings.retry_interval, Duration::from_secs(15));
        assert_eq!(settings.remote_dir, "/CFDisk/mindata/");
    }

    #[tokio::test]
    async fn published_cycle_sleeps_poll_interval() {
        let mut scheduler = build("day010126.dat\nday150226.dat", "12:00;1;2;3");
        assert_eq!(scheduler.state(), CycleState::Idle);

        let report = scheduler.tick().await;

        assert!(report.published());
        assert_eq!(report.leak_suspected, None);
        assert_eq!(scheduler.state(), CycleState::Publishing);
        assert_eq!(scheduler.pause_for(&report), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn missing_files_sleep_retry_interval() {
        let mut scheduler = build("readme.txt", "unused");
        let report = scheduler.tick().await;
        assert!(matches!(report.result, Ok(CycleOutcome::DiscoveryFailed(_))));
        assert_eq!(scheduler.pause_for(&report), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn empty_record_is_not_an_error() {
        let mut scheduler = build("day1.dat", "");
        let report = scheduler.tick().await;
        assert!(matches!(report.result, Ok(CycleOutcome::NothingToPublish)));
        assert_eq!(scheduler.state(), CycleState::Extracting);
        assert_eq!(scheduler.pause_for(&report), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn tenth_cycle_checks_memory() {
        let mut scheduler = build("day1.dat", "x");
        for _ in 0..9 {
            assert_eq!(scheduler.tick().await.leak_suspected, None);
        }
        assert_eq!(scheduler.tick().await.leak_suspected, Some(false));
        assert_eq!(scheduler.cycle_count(), 10);
        assert_eq!(scheduler.leak_detector_mut().baseline().check_count, 1);
    }

    /// Answers the baseline reading, then panics on every later one.
    struct BaselineOnly(bool);

    impl MemoryProbe for BaselineOnly {
        fn resident_bytes(&mut self) -> Option<u64> {
            if std::mem::replace(&mut self.0, true) {
                panic!("memory reading failed");
            }
            Some(1024)
        }
    }

    #[tokio::test]
    async fn panicking_memory_check_is_a_cycle_fault() {
        let mut scheduler = Scheduler::new(
            settings(),
            Arc::new(Listing("day1.dat")),
            Arc::new(Fetch),
            Arc::new(Record("x")),
            Box::new(Acking),
            LeakDetector::new(Box::new(BaselineOnly(false))),
        );
        for _ in 0..9 {
            assert!(scheduler.tick().await.published());
        }

        let report = scheduler.tick().await;

        assert_eq!(report.cycle, 10);
        assert_eq!(report.leak_suspected, None);
        match &report.result {
            Err(CycleFault::Panicked(message)) => assert!(message.contains("memory reading failed")),
            other => panic!("expected a caught panic, got {:?}", other),
        }
        assert_eq!(scheduler.state(), CycleState::Recovering);
        assert_eq!(scheduler.pause_for(&report), RECOVERY_COOLDOWN);
        assert!(scheduler.tick().await.published());
    }

    #[tokio::test]
    async fn run_once_stops() {
        let mut scheduler = build("day1.dat", "x");
        assert!(scheduler.run_once().await);
        assert_eq!(scheduler.state(), CycleState::Stopped);

        let mut scheduler = build("day1.dat", "");
        assert!(!scheduler.run_once().await);
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
