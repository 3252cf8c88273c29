//! Worker load metrics
//!
//! The counters track present state, not history: `connected_clients` is the
//! number of live peers across all meetings and `active_meetings` the number
//! of meetings in the registry. Both move with the structures they mirror.
//! The error counter is process-internal and never leaves the worker; the
//! heartbeat publishes exactly the three contractual fields.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    connected_clients: i64,
    active_meetings: i64,
    last_heartbeat: i64,
    errors: u64,
}

/// Shared handle to the worker's metrics, cloned into every component that
/// reports load or errors.
#[derive(Debug, Clone, Default)]
pub struct WorkerMetrics {
    inner: Arc<Mutex<Counters>>,
}

impl WorkerMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_connected(&self) {
        self.inner.lock().connected_clients += 1;
    }

    pub fn client_disconnected(&self) {
        self.inner.lock().connected_clients -= 1;
    }

    pub fn meeting_opened(&self) {
        self.inner.lock().active_meetings += 1;
    }

    pub fn meeting_closed(&self) {
        self.inner.lock().active_meetings -= 1;
    }

    pub fn record_error(&self) {
        self.inner.lock().errors += 1;
    }

    #[must_use]
    pub fn errors(&self) -> u64 {
        self.inner.lock().errors
    }

    /// Stamp `last_heartbeat` with the current wall clock (unix ms) and
    /// return the snapshot to publish.
    pub fn stamp_heartbeat(&self) -> MetricsSnapshot {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        let mut counters = self.inner.lock();
        counters.last_heartbeat = now_ms;
        MetricsSnapshot::from(*counters)
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot::from(*self.inner.lock())
    }
}

/// The contractual view of worker load, as written to the metrics hash and
/// carried in heartbeat events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub connected_clients: i64,
    pub active_meetings: i64,
    pub last_heartbeat: i64,
}

impl From<Counters> for MetricsSnapshot {
    fn from(c: Counters) -> Self {
        Self {
            connected_clients: c.connected_clients,
            active_meetings: c.active_meetings,
            last_heartbeat: c.last_heartbeat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_move_with_events() {
        let metrics = WorkerMetrics::new();
        metrics.meeting_opened();
        metrics.client_connected();
        metrics.client_connected();
        metrics.client_disconnected();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connected_clients, 1);
        assert_eq!(snapshot.active_meetings, 1);
        assert_eq!(snapshot.last_heartbeat, 0);
    }

    #[test]
    fn heartbeat_stamps_wall_clock() {
        let metrics = WorkerMetrics::new();
        let snapshot = metrics.stamp_heartbeat();
        assert!(snapshot.last_heartbeat > 0);
        assert_eq!(metrics.snapshot().last_heartbeat, snapshot.last_heartbeat);
    }

    #[test]
    fn snapshot_serializes_contractual_fields_only() {
        let metrics = WorkerMetrics::new();
        metrics.record_error();
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("connected_clients"));
        assert!(json.contains("active_meetings"));
        assert!(json.contains("last_heartbeat"));
        assert!(!json.contains("errors"));
    }
}
