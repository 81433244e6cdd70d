// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operation poller tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use broker_core::instance::{FailureKind, InstanceStatus};
use broker_core::persistence::SqlitePersistence;
use broker_core::poller::{OperationPoller, PollerConfig};
use broker_core::secrets::SecretCipher;
use common::*;
use tokio_util::sync::CancellationToken;

fn poller(h: &Harness) -> OperationPoller {
    OperationPoller::new(
        h.executor.clone(),
        PollerConfig {
            poll_interval: Duration::from_millis(20),
            batch_size: 10,
            max_concurrent: 4,
        },
    )
}

/// Provision a fresh instance that parks on deployARMTemplate.
async fn parked(h: &Harness, retry_after: Duration, max_wait: Option<Duration>) -> String {
    let id = new_id();
    h.step("deployARMTemplate")
        .push_in_progress("op-1", Some(retry_after), max_wait);
    let execution = h
        .executor
        .provision(request(&id), CancellationToken::new())
        .await
        .unwrap();
    assert!(!execution.done);
    id
}

#[tokio::test]
async fn test_scan_resumes_due_instance() {
    let h = Harness::new();
    let id = parked(&h, Duration::from_millis(10), None).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let poller = poller(&h);
    let report = poller.scan_once().await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.dispatched, 1);

    poller.wait_idle().await;
    assert_eq!(poller.in_flight_count(), 0);

    let record = h.load(&id).await.unwrap();
    assert_eq!(record.status, InstanceStatus::Provisioned);
    assert_eq!(h.call_log().last().unwrap().token.as_deref(), Some("op-1"));

    let report = poller.scan_once().await.unwrap();
    assert_eq!(report.scanned, 0);
}

#[tokio::test]
async fn test_scan_skips_instances_not_yet_due() {
    let h = Harness::new();
    let id = parked(&h, Duration::from_secs(3600), None).await;

    let poller = poller(&h);
    let report = poller.scan_once().await.unwrap();
    assert_eq!(report.not_due, 1);
    assert_eq!(report.dispatched, 0);

    assert_eq!(
        h.load(&id).await.unwrap().status,
        InstanceStatus::Provisioning
    );
}

#[tokio::test]
async fn test_scan_fails_expired_instances() {
    let h = Harness::new();
    let id = parked(&h, Duration::from_secs(3600), Some(Duration::ZERO)).await;

    let poller = poller(&h);
    let report = poller.scan_once().await.unwrap();
    assert_eq!(report.timed_out, 1);
    assert_eq!(report.dispatched, 0);
    poller.wait_idle().await;

    let record = h.load(&id).await.unwrap();
    assert_eq!(record.status, InstanceStatus::Failed);
    assert_eq!(record.failure_kind, Some(FailureKind::Timeout));
    assert_eq!(h.calls(), vec!["preProvision", "deployARMTemplate"]);
}

#[tokio::test]
async fn test_scan_does_not_dispatch_twice() {
    let h = Harness::new();
    let id = parked(&h, Duration::from_millis(1), None).await;
    h.step("deployARMTemplate")
        .set_delay(Duration::from_millis(200));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let poller = poller(&h);
    let first = poller.scan_once().await.unwrap();
    let second = poller.scan_once().await.unwrap();
    assert_eq!(first.dispatched, 1);
    assert_eq!(second.dispatched, 0);
    assert_eq!(second.in_flight, 1);

    poller.wait_idle().await;
    assert_eq!(
        h.load(&id).await.unwrap().status,
        InstanceStatus::Provisioned
    );
    let resumes = h
        .calls()
        .iter()
        .filter(|s| s.as_str() == "deployARMTemplate")
        .count();
    assert_eq!(resumes, 2);
}

#[tokio::test]
async fn test_run_loop_drives_to_completion_and_stops() {
    let h = Harness::new();
    let id = parked(&h, Duration::from_millis(10), None).await;

    let poller = Arc::new(poller(&h));
    let shutdown = poller.shutdown_handle();
    let handle = {
        let poller = poller.clone();
        tokio::spawn(async move { poller.run().await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if h.load(&id).await.unwrap().status == InstanceStatus::Provisioned {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "poller never completed the instance"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown.notify_one();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("poller should stop")
        .unwrap();
}

#[tokio::test]
async fn test_busy_expired_instance_does_not_stall_scan() {
    let h = Harness::new();
    let busy = parked(&h, Duration::from_secs(3600), Some(Duration::from_millis(80))).await;
    let due = parked(&h, Duration::from_millis(1), None).await;
    h.step("deployARMTemplate")
        .set_delay(Duration::from_millis(500));

    // A request-driven execute holds the busy instance's lock past its deadline.
    let external = {
        let executor = h.executor.clone();
        let id = busy.clone();
        tokio::spawn(async move { executor.execute(&id, CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(120)).await;

    let poller = poller(&h);
    let started = tokio::time::Instant::now();
    let report = poller.scan_once().await.unwrap();
    assert!(
        started.elapsed() < Duration::from_millis(250),
        "scan waited on a locked instance: {:?}",
        started.elapsed()
    );
    assert_eq!(report.scanned, 2);
    assert_eq!(report.timed_out, 1);
    assert_eq!(report.dispatched, 1);

    let execution = external.await.unwrap().unwrap();
    assert!(execution.done);
    poller.wait_idle().await;

    // The step that was already running commits; the late timeout is a no-op.
    assert_eq!(
        h.load(&busy).await.unwrap().status,
        InstanceStatus::Provisioned
    );
    assert_eq!(
        h.load(&due).await.unwrap().status,
        InstanceStatus::Provisioned
    );
}

#[tokio::test]
async fn test_unreadable_row_does_not_block_other_instances() {
    let sqlite = Arc::new(
        SqlitePersistence::in_memory(SecretCipher::generate())
            .await
            .unwrap(),
    );
    let h = Harness::with_persistence(sqlite.clone(), test_config());
    let healthy = parked(&h, Duration::from_millis(10), None).await;
    let tampered = parked(&h, Duration::from_millis(10), None).await;

    sqlx::query("UPDATE service_instances SET secure_details = ? WHERE instance_id = ?")
        .bind(vec![7u8; 16])
        .bind(&tampered)
        .execute(sqlite.pool())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let poller = poller(&h);
    let report = poller.scan_once().await.unwrap();
    assert_eq!(report.scanned, 2);
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.unreadable, 1);
    poller.wait_idle().await;

    assert_eq!(
        h.load(&healthy).await.unwrap().status,
        InstanceStatus::Provisioned
    );

    let (status, operation, failure_kind): (String, Option<String>, Option<String>) =
        sqlx::query_as(
            "SELECT status, operation, failure_kind FROM service_instances WHERE instance_id = ?",
        )
        .bind(&tampered)
        .fetch_one(sqlite.pool())
        .await
        .unwrap();
    assert_eq!(status, "failed");
    assert_eq!(operation, None);
    assert_eq!(failure_kind.as_deref(), Some("corrupt_state"));

    let report = poller.scan_once().await.unwrap();
    assert_eq!(report.scanned, 0);
}
