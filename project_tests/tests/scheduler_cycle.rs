use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use lib_common::LeakDetector;
use lib_common::connections::Delivery;
use lib_common::core::{CycleFault, CycleOutcome, CycleState, Scheduler};
use lib_common::ingestors::LastLineExtractor;
use project_tests::{
    CountingProbe, FetchScript, Journal, PublishScript, Rig, StubDownloader, StubListing, StubPublisher, settings,
};

#[tokio::test]
async fn phases_run_in_order_without_overlap() {
    let mut harness = Rig::default().build();

    let report = harness.scheduler.tick().await;

    assert!(matches!(
        report.result,
        Ok(CycleOutcome::Published(Delivery::Confirmed { .. }))
    ));
    let phases: Vec<String> = harness
        .journal
        .entries()
        .into_iter()
        .filter(|e| e.starts_with("begin:") || e.starts_with("end:"))
        .collect();
    assert_eq!(
        phases,
        [
            "begin:list",
            "end:list",
            "begin:fetch",
            "end:fetch",
            "begin:extract",
            "end:extract",
            "begin:publish",
            "end:publish",
        ]
    );
}

#[tokio::test]
async fn newest_dated_file_is_fetched_and_its_record_published() {
    let mut harness = Rig::default().build();
    harness.scheduler.tick().await;

    let entries = harness.journal.entries();
    assert!(entries.contains(&"fetch:/CFDisk/mindata/day150226.dat".to_string()));
    assert!(entries.contains(&"payload:15.02.26 12:00:00;48012.5;1203.7;-42.1".to_string()));
}

#[tokio::test]
async fn leak_check_runs_only_on_every_tenth_cycle() {
    let mut harness = Rig::default().build();
    // The baseline reading taken at construction.
    assert_eq!(harness.probe_calls.load(Ordering::SeqCst), 1);

    for cycle in 1..=25u64 {
        let report = harness.scheduler.tick().await;
        assert_eq!(report.cycle, cycle);
        if cycle % 10 == 0 {
            assert_eq!(report.leak_suspected, Some(false), "cycle {}", cycle);
        } else {
            assert_eq!(report.leak_suspected, None, "cycle {}", cycle);
        }
    }

    assert_eq!(harness.probe_calls.load(Ordering::SeqCst), 3);
    assert_eq!(harness.scheduler.leak_detector_mut().baseline().check_count, 2);
}

#[tokio::test]
async fn discovery_failure_waits_retry_interval() {
    let mut harness = Rig {
        listing: Err("421 service not available".to_string()),
        ..Rig::default()
    }
    .build();

    let report = harness.scheduler.tick().await;

    assert!(matches!(report.result, Ok(CycleOutcome::DiscoveryFailed(_))));
    assert_eq!(harness.scheduler.pause_for(&report), Duration::from_secs(120));
    assert_eq!(harness.journal.count("begin:fetch"), 0);
    assert_eq!(harness.journal.count("begin:publish"), 0);
}

#[tokio::test]
async fn listing_without_data_files_waits_retry_interval() {
    let mut harness = Rig {
        listing: Ok("readme.txt\nday.dat\nnight1.dat".to_string()),
        ..Rig::default()
    }
    .build();

    let report = harness.scheduler.tick().await;

    assert!(matches!(report.result, Ok(CycleOutcome::DiscoveryFailed(_))));
    assert_eq!(harness.scheduler.pause_for(&report), Duration::from_secs(120));
}

#[tokio::test]
async fn download_failure_waits_retry_interval() {
    let mut harness = Rig {
        fetch: FetchScript::Fail,
        ..Rig::default()
    }
    .build();

    let report = harness.scheduler.tick().await;

    assert!(matches!(report.result, Ok(CycleOutcome::TransferFailed(_))));
    assert_eq!(harness.scheduler.pause_for(&report), Duration::from_secs(120));
    assert_eq!(harness.journal.count("begin:extract"), 0);
}

#[tokio::test]
async fn empty_record_skips_the_publisher() {
    let mut harness = Rig {
        record: String::new(),
        ..Rig::default()
    }
    .build();

    let report = harness.scheduler.tick().await;

    assert!(matches!(report.result, Ok(CycleOutcome::NothingToPublish)));
    assert_eq!(harness.journal.count("begin:publish"), 0);
    assert_eq!(harness.scheduler.pause_for(&report), Duration::from_secs(300));
}

#[tokio::test]
async fn publish_failure_still_waits_poll_interval() {
    let mut harness = Rig {
        publish: PublishScript::Fail,
        ..Rig::default()
    }
    .build();

    let report = harness.scheduler.tick().await;

    assert!(matches!(report.result, Ok(CycleOutcome::DeliveryFailed(_))));
    assert_eq!(harness.scheduler.pause_for(&report), Duration::from_secs(300));
}

#[tokio::test]
async fn panicking_collaborator_is_isolated() {
    let mut harness = Rig {
        fetch: FetchScript::Panic,
        ..Rig::default()
    }
    .build();

    let report = harness.scheduler.tick().await;

    match &report.result {
        Err(CycleFault::Panicked(message)) => assert!(message.contains("downloader exploded")),
        other => panic!("expected a caught panic, got {:?}", other),
    }
    assert_eq!(harness.scheduler.state(), CycleState::Recovering);
    assert_eq!(harness.scheduler.pause_for(&report), Duration::from_secs(10));

    // The next cycle starts normally.
    let report = harness.scheduler.tick().await;
    assert_eq!(report.cycle, 2);
    assert!(report.result.is_err());
}

#[tokio::test(start_paused = true)]
async fn daemon_keeps_running_through_faults_until_shutdown() {
    let mut harness = Rig {
        fetch: FetchScript::Panic,
        ..Rig::default()
    }
    .build();
    let (tx, rx) = tokio::sync::broadcast::channel(1);

    tokio::join!(harness.scheduler.run(rx), async {
        // Cycles start at 0s, 10s and 20s; the signal lands in the third cooldown.
        tokio::time::sleep(Duration::from_secs(25)).await;
        let _ = tx.send(());
    });

    assert_eq!(harness.scheduler.cycle_count(), 3);
    assert_eq!(harness.scheduler.state(), CycleState::Stopped);
    assert_eq!(harness.journal.count("disconnect"), 1);
}

#[tokio::test(start_paused = true)]
async fn daemon_sleeps_poll_interval_between_published_cycles() {
    let mut harness = Rig::default().build();
    let (tx, rx) = tokio::sync::broadcast::channel(1);

    tokio::join!(harness.scheduler.run(rx), async {
        tokio::time::sleep(Duration::from_secs(1000)).await;
        let _ = tx.send(());
    });

    // Cycles at 0s, 300s, 600s and 900s.
    assert_eq!(harness.scheduler.cycle_count(), 4);
    assert_eq!(harness.journal.count("begin:publish"), 4);
    assert_eq!(harness.scheduler.state(), CycleState::Stopped);
}

#[tokio::test]
async fn shutdown_before_first_cycle_only_disconnects() {
    let mut harness = Rig::default().build();
    let (tx, rx) = tokio::sync::broadcast::channel(1);
    tx.send(()).unwrap();

    harness.scheduler.run(rx).await;

    assert_eq!(harness.scheduler.cycle_count(), 0);
    assert_eq!(harness.journal.entries(), ["disconnect"]);
    assert_eq!(harness.scheduler.state(), CycleState::Stopped);
}

#[tokio::test]
async fn single_run_reports_whether_the_record_went_out() {
    for (script, expected) in [
        (PublishScript::Confirm, true),
        (PublishScript::LeaveUnconfirmed, true),
        (PublishScript::Fail, false),
    ] {
        let mut harness = Rig {
            publish: script,
            ..Rig::default()
        }
        .build();

        assert_eq!(harness.scheduler.run_once().await, expected);
        assert_eq!(harness.scheduler.state(), CycleState::Stopped);
        assert_eq!(harness.journal.entries().last().map(String::as_str), Some("disconnect"));
    }

    let mut harness = Rig {
        fetch: FetchScript::Fail,
        ..Rig::default()
    }
    .build();
    assert!(!harness.scheduler.run_once().await);
}

#[tokio::test]
async fn downloaded_file_feeds_the_real_extractor() {
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("latest.dat");
    std::fs::write(&local, "12:00;1.0\r\n12:01;1.1\r\n\r\n").unwrap();

    let journal = Journal::default();
    let probe_calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let mut scheduler = Scheduler::new(
        settings(),
        Arc::new(StubListing {
            journal: journal.clone(),
            listing: Ok("day1.dat\nday2.dat\nday10.dat".to_string()),
        }),
        Arc::new(StubDownloader {
            journal: journal.clone(),
            script: FetchScript::Succeed,
            local_file: Some(local.clone()),
        }),
        Arc::new(LastLineExtractor),
        Box::new(StubPublisher {
            journal: journal.clone(),
            script: PublishScript::Confirm,
        }),
        LeakDetector::new(Box::new(CountingProbe { calls: probe_calls })),
    );

    assert!(scheduler.tick().await.published());

    let entries = journal.entries();
    assert!(entries.contains(&"fetch:/CFDisk/mindata/day10.dat".to_string()));
    assert!(entries.contains(&"payload:12:01;1.1".to_string()));
}
