//! Execution event fan-out.
//!
//! Uses `tokio::sync::broadcast`, whose bounded ring buffer already gives
//! every subscriber the "drop oldest when a slow observer falls behind"
//! semantics this system needs — a slow UI subscriber loses old progress
//! ticks (surfaced to it as `RecvError::Lagged`) rather than backpressuring
//! the executor or growing unboundedly. Field names mirror the wire
//! contract this crate's caller (the API layer, out of scope here) emits
//! verbatim to WebSocket observers.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::ExecutionStatus;

/// Default per-subscriber buffer size before the oldest unread event is
/// dropped for that subscriber.
pub const DEFAULT_BUFFER: usize = 256;

/// The sync differ's current phase, as observed by progress subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    ScanningLocal,
    ListingRemote,
    Syncing,
    Deleting,
    Completed,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::ScanningLocal => "scanning_local",
            SyncPhase::ListingRemote => "listing_remote",
            SyncPhase::Syncing => "syncing",
            SyncPhase::Deleting => "deleting",
            SyncPhase::Completed => "completed",
        }
    }
}

/// Compute a 0-100 progress percentage, saturating at 100 and treating an
/// unknown (`0`) total as `0%` rather than dividing by zero.
pub fn progress_percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done.min(total) * 100) / total) as u8
}

#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    ExecutionStarted {
        execution_id: Uuid,
        task_id: Uuid,
        task_name: String,
        started_at: DateTime<Utc>,
    },
    ArchiveProgress {
        execution_id: Uuid,
        progress_percent: u8,
        current_file: String,
        bytes_processed: u64,
        bytes_total: u64,
    },
    UploadProgress {
        execution_id: Uuid,
        backend_id: Uuid,
        backend_name: String,
        progress_percent: u8,
        bytes_uploaded: u64,
        bytes_total: u64,
    },
    SyncProgress {
        execution_id: Uuid,
        backend_id: Uuid,
        backend_name: String,
        phase: SyncPhase,
        progress_percent: u8,
        current_file: String,
        files_processed: u64,
        files_total: u64,
    },
    ExecutionCompleted {
        execution_id: Uuid,
        task_id: Uuid,
        status: ExecutionStatus,
        completed_at: DateTime<Utc>,
        duration_ms: i64,
        archive_size: Option<u64>,
        backends_succeeded: u32,
        backends_failed: u32,
    },
    ExecutionFailed {
        execution_id: Uuid,
        task_id: Uuid,
        status: ExecutionStatus,
        completed_at: DateTime<Utc>,
        error_message: String,
    },
}

/// Thin wrapper over a `broadcast::Sender` so callers never need to hold a
/// receiver just to publish.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Returns the number of subscribers it reached;
    /// `0` just means nobody is currently listening, which is fine.
    pub fn publish(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_percent_saturates_and_avoids_division_by_zero() {
        assert_eq!(progress_percent(0, 0), 0);
        assert_eq!(progress_percent(50, 100), 50);
        assert_eq!(progress_percent(150, 100), 100);
    }
}
