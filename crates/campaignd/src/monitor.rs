//! Real-time corruption monitor.
//!
//! A background task that re-scans a fixed file set on an interval. On a
//! `CRITICAL` finding with automatic rollback enabled it stops scanning and
//! runs an emergency rollback. Stopping cancels the task and joins it.

use crate::safety::SafetyProtocol;
use campaign_core::CorruptionSeverity;
use std::path::PathBuf;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why the monitor loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    Stopped,
    /// Critical corruption triggered an emergency rollback.
    RolledBack,
    /// Critical corruption found but the rollback failed.
    RollbackFailed,
    /// The safety protocol was dropped.
    Orphaned,
}

/// Handle to a running monitor task.
#[derive(Debug)]
pub struct CorruptionMonitor {
    cancel: CancellationToken,
    handle: JoinHandle<MonitorExit>,
}

impl CorruptionMonitor {
    pub(crate) fn spawn(
        protocol: Weak<SafetyProtocol>,
        files: Vec<PathBuf>,
        interval: Duration,
        auto_rollback: bool,
    ) -> Self {
        let cancel = CancellationToken::new();
        let count = files.len();
        let handle = tokio::spawn(watch(
            protocol,
            files,
            interval,
            auto_rollback,
            cancel.clone(),
        ));
        info!(
            files = count,
            interval_ms = interval.as_millis() as u64,
            auto_rollback,
            "real-time corruption monitoring started"
        );
        Self { cancel, handle }
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Cancel and wait for the task to finish.
    pub async fn stop(self) -> MonitorExit {
        self.cancel.cancel();
        match self.handle.await {
            Ok(exit) => exit,
            Err(err) => {
                warn!(error = %err, "corruption monitor task failed");
                MonitorExit::Stopped
            }
        }
    }
}

async fn watch(
    protocol: Weak<SafetyProtocol>,
    files: Vec<PathBuf>,
    interval: Duration,
    auto_rollback: bool,
    cancel: CancellationToken,
) -> MonitorExit {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("corruption monitor stopped");
                return MonitorExit::Stopped;
            }
            _ = ticker.tick() => {}
        }

        let Some(protocol) = protocol.upgrade() else {
            return MonitorExit::Orphaned;
        };

        let report = protocol.detect_corruption(&files);
        if report.severity != CorruptionSeverity::Critical {
            continue;
        }

        if !auto_rollback {
            error!(
                files = report.detected_files.len(),
                "critical corruption detected; automatic rollback disabled"
            );
            continue;
        }

        error!(
            files = report.detected_files.len(),
            "critical corruption detected; triggering emergency rollback"
        );
        return match protocol.emergency_rollback().await {
            Ok(stash) => {
                info!(stash_id = %stash.id, "automatic rollback complete");
                MonitorExit::RolledBack
            }
            Err(err) => {
                error!(error = %err, "automatic rollback failed");
                MonitorExit::RollbackFailed
            }
        };
    }
}
