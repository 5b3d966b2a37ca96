//! Per-viewer round-trip tracking
//!
//! Viewers periodically echo back a timestamp; the gap between that
//! timestamp and the moment the echo arrives is the viewer's lag. The
//! tracker is owned by the scheduler thread. Heartbeats reach it through a
//! bounded channel that the scheduler drains at the top of every cycle, so
//! no map is ever shared between tasks.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Heartbeat channel capacity; heartbeats beyond it are dropped
pub const HEARTBEAT_CHANNEL_BUFFER: usize = 256;

/// Identity of a connected viewer
pub type ClientId = String;

/// One heartbeat/ack from a viewer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    /// Viewer identity
    pub client_id: ClientId,
    /// Timestamp the viewer echoed back (ms since the Unix epoch)
    pub request_ms: u64,
    /// When the heartbeat arrived (ms since the Unix epoch)
    pub receive_ms: u64,
}

/// Tracked responsiveness of one viewer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientCondition {
    /// Estimated round-trip lag in milliseconds
    pub estimated_lag_ms: f64,
    /// When the record was last updated
    pub last_update: Instant,
}

/// Tuning for the tracker
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerSettings {
    /// Weight of the newest sample (1.0 keeps only the latest sample)
    pub smoothing: f64,
    /// Records older than this are evicted
    pub stale_after: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            smoothing: 1.0,
            stale_after: Duration::from_secs(10),
        }
    }
}

/// Rolling lag estimate for every viewer that has sent a heartbeat
#[derive(Debug, Default)]
pub struct ClientConditionTracker {
    settings: TrackerSettings,
    clients: HashMap<ClientId, ClientCondition>,
}

impl ClientConditionTracker {
    /// Creates an empty tracker
    pub fn new(settings: TrackerSettings) -> Self {
        Self {
            settings,
            clients: HashMap::new(),
        }
    }

    /// Records one lag sample for a viewer.
    ///
    /// A receive time earlier than the request time (clock skew) counts as
    /// zero lag.
    pub fn update(&mut self, client_id: &str, request_ms: u64, receive_ms: u64) {
        self.update_at(client_id, request_ms, receive_ms, Instant::now());
    }

    fn update_at(&mut self, client_id: &str, request_ms: u64, receive_ms: u64, now: Instant) {
        let sample = receive_ms.saturating_sub(request_ms) as f64;
        let alpha = self.settings.smoothing.clamp(0.0, 1.0);

        let lag = match self.clients.get(client_id) {
            Some(prev) if alpha < 1.0 => alpha * sample + (1.0 - alpha) * prev.estimated_lag_ms,
            _ => sample,
        };

        debug!(client = client_id, sample, lag, "Updated client condition");

        self.clients.insert(
            client_id.to_string(),
            ClientCondition {
                estimated_lag_ms: lag,
                last_update: now,
            },
        );
    }

    /// Records a heartbeat
    pub fn record(&mut self, heartbeat: &Heartbeat) {
        self.update(&heartbeat.client_id, heartbeat.request_ms, heartbeat.receive_ms);
    }

    /// Returns the tracked condition of a viewer
    pub fn get(&self, client_id: &str) -> Option<ClientCondition> {
        self.clients.get(client_id).copied()
    }

    /// Returns the lag of a viewer, or zero when nothing is known about it
    pub fn lag_ms(&self, client_id: &str) -> f64 {
        self.get(client_id)
            .map(|c| c.estimated_lag_ms)
            .unwrap_or(0.0)
    }

    /// Returns the highest lag among tracked viewers, or zero when none are
    /// tracked
    pub fn worst_lag_ms(&self) -> f64 {
        self.clients
            .values()
            .map(|c| c.estimated_lag_ms)
            .fold(0.0, f64::max)
    }

    /// Drops records that have not been refreshed within the staleness window.
    ///
    /// Returns the number of evicted records.
    pub fn evict_stale(&mut self) -> usize {
        self.evict_stale_at(Instant::now())
    }

    fn evict_stale_at(&mut self, now: Instant) -> usize {
        let stale_after = self.settings.stale_after;
        let before = self.clients.len();
        self.clients.retain(|id, condition| {
            let fresh = now.saturating_duration_since(condition.last_update) <= stale_after;
            if !fresh {
                debug!(client = %id, "Evicting stale client condition");
            }
            fresh
        });
        before - self.clients.len()
    }

    /// Applies every heartbeat waiting in the channel
    ///
    /// Returns the number of heartbeats applied.
    pub fn drain(&mut self, rx: &mut mpsc::Receiver<Heartbeat>) -> usize {
        let mut applied = 0;
        while let Ok(heartbeat) = rx.try_recv() {
            self.record(&heartbeat);
            applied += 1;
        }
        applied
    }

    /// Returns the number of tracked viewers
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns true when no viewer is tracked
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// Sending half of the heartbeat channel, held by connection handlers
#[derive(Debug, Clone)]
pub struct HeartbeatSender {
    tx: mpsc::Sender<Heartbeat>,
}

impl HeartbeatSender {
    /// Queues a heartbeat without blocking.
    ///
    /// Returns false if the heartbeat was dropped because the channel is
    /// full or the scheduler has stopped.
    pub fn send(&self, heartbeat: Heartbeat) -> bool {
        match self.tx.try_send(heartbeat) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(hb)) => {
                warn!(client = %hb.client_id, "Heartbeat channel full, dropping heartbeat");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Creates the heartbeat channel
pub fn heartbeat_channel() -> (HeartbeatSender, mpsc::Receiver<Heartbeat>) {
    let (tx, rx) = mpsc::channel(HEARTBEAT_CHANNEL_BUFFER);
    (HeartbeatSender { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_client_has_no_lag() {
        let tracker = ClientConditionTracker::default();
        assert!(tracker.get("nobody").is_none());
        assert_eq!(tracker.lag_ms("nobody"), 0.0);
        assert_eq!(tracker.worst_lag_ms(), 0.0);
    }

    #[test]
    fn test_latest_sample_is_used_verbatim() {
        let mut tracker = ClientConditionTracker::default();
        tracker.update("a", 1_000, 1_150);
        assert_eq!(tracker.lag_ms("a"), 150.0);

        tracker.update("a", 2_000, 2_020);
        assert_eq!(tracker.lag_ms("a"), 20.0);
    }

    #[test]
    fn test_clock_skew_counts_as_zero() {
        let mut tracker = ClientConditionTracker::default();
        tracker.update("a", 5_000, 4_000);
        assert_eq!(tracker.lag_ms("a"), 0.0);
    }

    #[test]
    fn test_smoothing() {
        let mut tracker = ClientConditionTracker::new(TrackerSettings {
            smoothing: 0.5,
            ..Default::default()
        });
        tracker.update("a", 0, 100);
        assert_eq!(tracker.lag_ms("a"), 100.0);
        tracker.update("a", 0, 300);
        assert_eq!(tracker.lag_ms("a"), 200.0);
    }

    #[test]
    fn test_worst_lag_across_clients() {
        let mut tracker = ClientConditionTracker::default();
        tracker.update("fast", 0, 20);
        tracker.update("slow", 0, 250);
        tracker.update("medium", 0, 120);
        assert_eq!(tracker.worst_lag_ms(), 250.0);
        assert_eq!(tracker.len(), 3);
    }

    #[test]
    fn test_stale_records_are_evicted() {
        let mut tracker = ClientConditionTracker::new(TrackerSettings {
            smoothing: 1.0,
            stale_after: Duration::from_secs(10),
        });
        let start = Instant::now();
        tracker.update_at("old", 0, 300, start);
        tracker.update_at("new", 0, 50, start + Duration::from_secs(8));

        assert_eq!(tracker.evict_stale_at(start + Duration::from_secs(11)), 1);
        assert!(tracker.get("old").is_none());
        assert_eq!(tracker.worst_lag_ms(), 50.0);
    }

    #[tokio::test]
    async fn test_drain_applies_queued_heartbeats() {
        let (tx, mut rx) = heartbeat_channel();
        let mut tracker = ClientConditionTracker::default();

        assert!(tx.send(Heartbeat {
            client_id: "a".to_string(),
            request_ms: 1_000,
            receive_ms: 1_150,
        }));
        assert!(tx.send(Heartbeat {
            client_id: "b".to_string(),
            request_ms: 1_000,
            receive_ms: 1_010,
        }));

        assert_eq!(tracker.drain(&mut rx), 2);
        assert_eq!(tracker.lag_ms("a"), 150.0);
        assert_eq!(tracker.lag_ms("b"), 10.0);
        assert_eq!(tracker.drain(&mut rx), 0);
    }
}
