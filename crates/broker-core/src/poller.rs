// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that re-drives parked operations.
//!
//! Every `poll_interval` the poller lists instances with an operation in
//! flight and, for each one that is due, hands it to
//! [`WorkflowExecutor::execute`] on its own task. Instances past their
//! deadline are failed with a timeout instead, also on their own task, so a
//! scan never waits on an instance lock. Rows persistence cannot decode are
//! dispatched too and the executor fails them as corrupt state. An instance
//! is never dispatched twice at once.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashSet;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::executor::{WorkflowExecutor, deadline_passed};

/// Configuration for the operation poller.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// How often to scan for parked operations.
    pub poll_interval: Duration,
    /// Maximum records examined per scan.
    pub batch_size: i64,
    /// Maximum executions running at once.
    pub max_concurrent: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 50,
            max_concurrent: 16,
        }
    }
}

/// What one scan did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Records returned by persistence, readable or not.
    pub scanned: usize,
    /// Executions spawned.
    pub dispatched: usize,
    /// Instances past their deadline handed to the timeout path.
    pub timed_out: usize,
    /// Rows that could not be decoded, handed to the executor to be failed.
    pub unreadable: usize,
    /// Instances whose next poll time has not come yet.
    pub not_due: usize,
    /// Instances already being executed by an earlier dispatch.
    pub in_flight: usize,
}

/// Background worker that resumes in-progress instances.
pub struct OperationPoller {
    executor: Arc<WorkflowExecutor>,
    config: PollerConfig,
    in_flight: Arc<DashSet<String>>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    shutdown: Arc<Notify>,
}

impl OperationPoller {
    /// Create a new poller.
    pub fn new(executor: Arc<WorkflowExecutor>, config: PollerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            executor,
            config,
            in_flight: Arc::new(DashSet::new()),
            permits,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Token cancelled to abandon every running step.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Number of executions currently dispatched.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Run the poller loop until shutdown is signalled, then wait for
    /// dispatched executions to finish.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            max_concurrent = self.config.max_concurrent,
            "Operation poller started"
        );

        loop {
            if let Err(e) = self.scan_once().await {
                error!(error = %e, "Failed to scan in-progress instances");
            }

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Operation poller received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!("Operation poller stopped");
    }

    /// Examine one batch of in-progress instances.
    ///
    /// Never waits on an instance lock; each dispatched instance runs on its
    /// own task.
    pub async fn scan_once(&self) -> Result<ScanReport> {
        let batch = self
            .executor
            .persistence()
            .list_in_progress(self.config.batch_size)
            .await?;
        let now = Utc::now();
        let mut report = ScanReport {
            scanned: batch.len(),
            ..ScanReport::default()
        };

        for unreadable in batch.unreadable {
            if self.dispatch(unreadable.instance_id, Job::Resume) {
                report.unreadable += 1;
            } else {
                report.in_flight += 1;
            }
        }

        for record in batch.records {
            if self.in_flight.contains(&record.instance_id) {
                report.in_flight += 1;
                continue;
            }

            if deadline_passed(&record, now) {
                if self.dispatch(record.instance_id, Job::Timeout) {
                    report.timed_out += 1;
                } else {
                    report.in_flight += 1;
                }
                continue;
            }

            if record.next_poll_at.is_some_and(|at| at > now) {
                report.not_due += 1;
                continue;
            }

            if self.dispatch(record.instance_id, Job::Resume) {
                report.dispatched += 1;
            } else {
                report.in_flight += 1;
            }
        }

        self.executor.prune_locks();
        if report.dispatched > 0 || report.timed_out > 0 || report.unreadable > 0 {
            debug!(
                scanned = report.scanned,
                dispatched = report.dispatched,
                timed_out = report.timed_out,
                unreadable = report.unreadable,
                "Scan finished"
            );
        }
        Ok(report)
    }

    /// Wait until every dispatched execution has finished.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    fn dispatch(&self, instance_id: String, job: Job) -> bool {
        if !self.in_flight.insert(instance_id.clone()) {
            return false;
        }

        let executor = self.executor.clone();
        let permits = self.permits.clone();
        let cancel = self.cancel.child_token();
        let slot = InFlightSlot {
            set: self.in_flight.clone(),
            instance_id,
        };

        self.tracker.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let instance_id = slot.instance_id.as_str();
            match job {
                Job::Resume => match executor.execute(instance_id, cancel).await {
                    Ok(execution) => {
                        debug!(instance_id, done = execution.done, "Resumed instance");
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(instance_id, error = %e, "Resume will be retried");
                    }
                    Err(e) => {
                        error!(instance_id, error = %e, error_code = e.error_code(), "Resume failed");
                    }
                },
                Job::Timeout => match executor.fail_timeout(instance_id).await {
                    Ok(true) => info!(instance_id, "Instance timed out"),
                    Ok(false) => debug!(instance_id, "Instance settled before its timeout"),
                    Err(e) => {
                        error!(instance_id, error = %e, "Failed to time out instance");
                    }
                },
            }
        });
        true
    }
}

#[derive(Debug, Clone, Copy)]
enum Job {
    Resume,
    Timeout,
}

/// Releases an in-flight marker when the execution task ends, however it ends.
struct InFlightSlot {
    set: Arc<DashSet<String>>,
    instance_id: String,
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.set.remove(&self.instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PollerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_concurrent, 16);
    }
}
