//! # Scheduler Test Harness
//!
//! In-memory stand-ins for every collaborator of a relay cycle. Each stub
//! writes `begin:<phase>` and `end:<phase>` into a shared [`Journal`] and
//! yields to the runtime in between, so overlapping phases would show up as
//! interleaved entries.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lib_common::connections::{Delivery, PublishError, RecordPublisher};
use lib_common::ingestors::{Downloader, ListingProvider, RowExtractor, TransferError};
use lib_common::utils::misc::sys_info::MemoryProbe;
use lib_common::{LeakDetector, Scheduler, SchedulerSettings};

/// Ordered record of what the stubs were asked to do.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| e.as_str() == entry).count()
    }

    async fn phase(&self, name: &str) {
        self.record(format!("begin:{}", name));
        tokio::task::yield_now().await;
        self.record(format!("end:{}", name));
    }
}

pub struct StubListing {
    pub journal: Journal,
    pub listing: Result<String, String>,
}

#[async_trait]
impl ListingProvider for StubListing {
    async fn list(&self, _dir: &str) -> Result<String, TransferError> {
        self.journal.phase("list").await;
        self.listing.clone().map_err(TransferError::Protocol)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum FetchScript {
    Succeed,
    Fail,
    Panic,
}

pub struct StubDownloader {
    pub journal: Journal,
    pub script: FetchScript,
    /// When set, fetched files land here instead of being echoed back.
    pub local_file: Option<PathBuf>,
}

#[async_trait]
impl Downloader for StubDownloader {
    async fn fetch(&self, remote_path: &str) -> Result<PathBuf, TransferError> {
        self.journal.record(format!("fetch:{}", remote_path));
        self.journal.phase("fetch").await;
        match self.script {
            FetchScript::Succeed => Ok(self
                .local_file
                .clone()
                .unwrap_or_else(|| PathBuf::from(remote_path))),
            FetchScript::Fail => Err(TransferError::Protocol("550 file unavailable".to_string())),
            FetchScript::Panic => panic!("downloader exploded"),
        }
    }
}

pub struct StubExtractor {
    pub journal: Journal,
    pub record: String,
}

#[async_trait]
impl RowExtractor for StubExtractor {
    async fn latest_record(&self, _path: &Path) -> Result<String, TransferError> {
        self.journal.phase("extract").await;
        Ok(self.record.clone())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum PublishScript {
    Confirm,
    LeaveUnconfirmed,
    Fail,
}

pub struct StubPublisher {
    pub journal: Journal,
    pub script: PublishScript,
}

#[async_trait]
impl RecordPublisher for StubPublisher {
    async fn publish(&mut self, payload: &str) -> Result<Delivery, PublishError> {
        self.journal.record(format!("payload:{}", payload));
        self.journal.phase("publish").await;
        match self.script {
            PublishScript::Confirm => Ok(Delivery::Confirmed { message_id: 1 }),
            PublishScript::LeaveUnconfirmed => Ok(Delivery::Unconfirmed { message_id: Some(1) }),
            PublishScript::Fail => Err(PublishError::ConnectionLost("broker went away".to_string())),
        }
    }

    async fn disconnect(&mut self) {
        self.journal.record("disconnect");
    }
}

/// A flat memory reading that counts how often it was taken.
pub struct CountingProbe {
    pub calls: Arc<AtomicUsize>,
}

impl MemoryProbe for CountingProbe {
    fn resident_bytes(&mut self) -> Option<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Some(64 * 1024 * 1024)
    }
}

/// Everything a test may want to vary about a scheduler.
pub struct Rig {
    pub listing: Result<String, String>,
    pub fetch: FetchScript,
    pub local_file: Option<PathBuf>,
    pub record: String,
    pub publish: PublishScript,
}

impl Default for Rig {
    fn default() -> Self {
        Self {
            listing: Ok("day010126.dat\nday150226.dat\nday310126.dat".to_string()),
            fetch: FetchScript::Succeed,
            local_file: None,
            record: "15.02.26 12:00:00;48012.5;1203.7;-42.1".to_string(),
            publish: PublishScript::Confirm,
        }
    }
}

/// A built scheduler plus the handles needed to inspect it.
pub struct Harness {
    pub scheduler: Scheduler,
    pub journal: Journal,
    pub probe_calls: Arc<AtomicUsize>,
}

pub fn settings() -> SchedulerSettings {
    SchedulerSettings {
        remote_dir: "/CFDisk/mindata/".to_string(),
        poll_interval: Duration::from_secs(300),
        retry_interval: Duration::from_secs(120),
        recovery_cooldown: Duration::from_secs(10),
        leak_check_every: 10,
    }
}

impl Rig {
    pub fn build(self) -> Harness {
        self.build_with(settings())
    }

    pub fn build_with(self, settings: SchedulerSettings) -> Harness {
        let journal = Journal::default();
        let probe_calls = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(
            settings,
            Arc::new(StubListing {
                journal: journal.clone(),
                listing: self.listing,
            }),
            Arc::new(StubDownloader {
                journal: journal.clone(),
                script: self.fetch,
                local_file: self.local_file,
            }),
            Arc::new(StubExtractor {
                journal: journal.clone(),
                record: self.record,
            }),
            Box::new(StubPublisher {
                journal: journal.clone(),
                script: self.publish,
            }),
            LeakDetector::new(Box::new(CountingProbe {
                calls: probe_calls.clone(),
            })),
        );
        Harness {
            scheduler,
            journal,
            probe_calls,
        }
    }
}
