//! Broadcast transport boundary
//!
//! Frames leave the scheduler through a bounded queue and are fanned out to
//! every subscribed viewer by a [`FrameBroadcaster`]. Inbound viewer
//! messages (heartbeats and stream controls) come back in as JSON and are
//! routed to the scheduler's heartbeat channel and runtime parameters.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::desktop::{unix_millis, EncodedFrame, FrameType, RuntimeParams};
use crate::error::{EncodeError, EncodeResult, Result};
use crate::stream::clients::{Heartbeat, HeartbeatSender};

/// Per-viewer broadcast buffer; viewers further behind lose frames
pub const BROADCAST_BUFFER: usize = 8;

/// Frame rate applied when `set_frame_rate` omits the value
const FALLBACK_FRAME_RATE: i64 = 10;

/// Scale applied when `set_resolution` omits the value
const FALLBACK_SCALE: f64 = 1.0;

/// Delivers frames to every connected viewer.
///
/// Implementations must not block the caller beyond enqueueing.
pub trait FrameBroadcaster: Send + Sync {
    /// Sends a frame to all current viewers, best effort
    fn broadcast(&self, frame: EncodedFrame);
}

/// Fan-out of encoded frames over a tokio broadcast channel
#[derive(Clone)]
pub struct BroadcastHub {
    tx: broadcast::Sender<Arc<EncodedFrame>>,
}

impl BroadcastHub {
    /// Creates a hub with the given per-viewer buffer
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribes a new viewer
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<EncodedFrame>> {
        self.tx.subscribe()
    }

    /// Returns the number of subscribed viewers
    pub fn viewer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(BROADCAST_BUFFER)
    }
}

impl FrameBroadcaster for BroadcastHub {
    fn broadcast(&self, frame: EncodedFrame) {
        // Err only means nobody is watching right now
        match self.tx.send(Arc::new(frame)) {
            Ok(viewers) => trace!(viewers, "Broadcast frame"),
            Err(_) => trace!("No viewers, frame discarded"),
        }
    }
}

/// Drains the scheduler's work queue into a broadcaster, preserving order
pub fn spawn_forwarder(
    mut frames: mpsc::Receiver<EncodedFrame>,
    broadcaster: Arc<dyn FrameBroadcaster>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            broadcaster.broadcast(frame);
        }
        debug!("Frame queue closed, forwarder exiting");
    })
}

/// JSON envelope a viewer receives for every frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFrame {
    /// `"keyframe"` or `"delta"`
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    /// Base64 of the zstd-compressed JPEG
    pub data: String,
    /// Capture time in ms since the Unix epoch
    pub timestamp: u64,
}

impl WireFrame {
    /// Wraps an encoded frame for the wire
    pub fn from_frame(frame: &EncodedFrame) -> Self {
        Self {
            frame_type: frame.frame_type,
            data: STANDARD.encode(&frame.payload),
            timestamp: frame.timestamp_ms,
        }
    }

    /// Serializes the envelope to JSON
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Returns the compressed payload bytes
    ///
    /// # Errors
    ///
    /// Returns error if `data` is not valid base64
    pub fn payload(&self) -> EncodeResult<Vec<u8>> {
        STANDARD
            .decode(&self.data)
            .map_err(|e| EncodeError::Payload(e.to_string()))
    }
}

/// Messages a viewer may send to the host
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ViewerMessage {
    /// Heartbeat echoing a timestamp the viewer received
    RequestFrame {
        /// Echoed timestamp (ms since the Unix epoch); fractions are truncated
        timestamp: Option<f64>,
    },
    /// Change the capture frame rate
    SetFrameRate {
        /// Requested frame rate; fractions are truncated
        frame_rate: Option<f64>,
    },
    /// Change the capture scale
    SetResolution {
        /// Requested scale factor
        scale: Option<f64>,
    },
    /// Pointer input, relayed elsewhere
    MouseEvent,
    /// Keyboard input, relayed elsewhere
    KeyboardEvent,
    /// Special key combination, relayed elsewhere
    SpecialKeyCombo,
}

/// Routes inbound viewer messages to the running pipeline
#[derive(Clone)]
pub struct ControlRouter {
    heartbeats: HeartbeatSender,
    params: Arc<watch::Sender<RuntimeParams>>,
}

impl ControlRouter {
    /// Creates a router over the scheduler's channel ends
    pub fn new(heartbeats: HeartbeatSender, params: watch::Sender<RuntimeParams>) -> Self {
        Self {
            heartbeats,
            params: Arc::new(params),
        }
    }

    /// Returns the current runtime parameters
    pub fn params(&self) -> RuntimeParams {
        *self.params.borrow()
    }

    /// Handles one raw JSON message from `client_id`.
    ///
    /// Malformed messages are logged and ignored.
    pub fn handle_json(&self, client_id: &str, raw: &str) {
        match serde_json::from_str::<ViewerMessage>(raw) {
            Ok(message) => self.handle(client_id, message),
            Err(e) => warn!(client = client_id, "Ignoring malformed viewer message: {}", e),
        }
    }

    /// Handles one parsed message from `client_id`
    pub fn handle(&self, client_id: &str, message: ViewerMessage) {
        match message {
            ViewerMessage::RequestFrame { timestamp: Some(ts) } if ts.is_finite() && ts >= 0.0 => {
                self.heartbeats.send(Heartbeat {
                    client_id: client_id.to_string(),
                    request_ms: ts.trunc() as u64,
                    receive_ms: unix_millis(),
                });
            }
            ViewerMessage::RequestFrame { .. } => {
                warn!(client = client_id, "Ignoring heartbeat without a usable timestamp");
            }
            ViewerMessage::SetFrameRate { frame_rate } => {
                let frame_rate = frame_rate
                    .filter(|fps| fps.is_finite())
                    .map_or(FALLBACK_FRAME_RATE, |fps| fps.trunc() as i64);
                self.params.send_modify(|p| *p = p.with_frame_rate(frame_rate));
                info!(client = client_id, "Frame rate set to {}", self.params().frame_rate);
            }
            ViewerMessage::SetResolution { scale } => {
                let scale = scale.unwrap_or(FALLBACK_SCALE);
                self.params.send_modify(|p| *p = p.with_scale(scale));
                info!(client = client_id, "Capture scale set to {}", self.params().scale);
            }
            ViewerMessage::MouseEvent
            | ViewerMessage::KeyboardEvent
            | ViewerMessage::SpecialKeyCombo => {
                trace!(client = client_id, "Input event not handled by the stream");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::clients::heartbeat_channel;

    fn sample_frame(frame_type: FrameType) -> EncodedFrame {
        EncodedFrame {
            frame_type,
            payload: vec![0xde, 0xad, 0xbe, 0xef],
            timestamp_ms: 1_700_000_000_123,
            width: 4,
            height: 4,
            quality: 80,
        }
    }

    #[test]
    fn test_wire_frame_envelope() {
        let wire = WireFrame::from_frame(&sample_frame(FrameType::Keyframe));
        let json: serde_json::Value = serde_json::from_str(&wire.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "keyframe");
        assert_eq!(json["data"], "3q2+7w==");
        assert_eq!(json["timestamp"], 1_700_000_000_123u64);
        assert_eq!(wire.payload().unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_wire_frame_rejects_bad_base64() {
        let wire = WireFrame {
            frame_type: FrameType::Delta,
            data: "not base64!".to_string(),
            timestamp: 0,
        };
        assert!(wire.payload().is_err());
    }

    #[tokio::test]
    async fn test_forwarder_preserves_order() {
        let hub = BroadcastHub::default();
        let mut viewer = hub.subscribe();
        let (tx, rx) = mpsc::channel(2);
        let forwarder = spawn_forwarder(rx, Arc::new(hub.clone()));

        for ts in 1..=5u64 {
            let mut frame = sample_frame(FrameType::Delta);
            frame.timestamp_ms = ts;
            tx.send(frame).await.unwrap();
        }
        drop(tx);
        forwarder.await.unwrap();

        for ts in 1..=5u64 {
            assert_eq!(viewer.recv().await.unwrap().timestamp_ms, ts);
        }
    }

    #[test]
    fn test_broadcast_without_viewers_is_fine() {
        let hub = BroadcastHub::new(1);
        assert_eq!(hub.viewer_count(), 0);
        hub.broadcast(sample_frame(FrameType::Delta));
    }

    #[tokio::test]
    async fn test_heartbeat_is_routed() {
        let (heartbeats, mut rx) = heartbeat_channel();
        let (params, _params_rx) = watch::channel(RuntimeParams::default());
        let router = ControlRouter::new(heartbeats, params);

        let sent = unix_millis() - 150;
        router.handle_json("viewer-1", &format!(r#"{{"event":"request_frame","timestamp":{}}}"#, sent));

        let hb = rx.try_recv().unwrap();
        assert_eq!(hb.client_id, "viewer-1");
        assert_eq!(hb.request_ms, sent);
        assert!(hb.receive_ms >= sent + 150);
    }

    #[tokio::test]
    async fn test_malformed_heartbeats_are_ignored() {
        let (heartbeats, mut rx) = heartbeat_channel();
        let (params, _params_rx) = watch::channel(RuntimeParams::default());
        let router = ControlRouter::new(heartbeats, params);

        router.handle_json("viewer-1", r#"{"event":"request_frame"}"#);
        router.handle_json("viewer-1", r#"{"event":"request_frame","timestamp":"soon"}"#);
        router.handle_json("viewer-1", "not json");

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fractional_numbers_are_truncated() {
        let (heartbeats, mut rx) = heartbeat_channel();
        let (params, params_rx) = watch::channel(RuntimeParams::default());
        let router = ControlRouter::new(heartbeats, params);

        router.handle_json("v", r#"{"event":"request_frame","timestamp":1700000000123.7}"#);
        assert_eq!(rx.try_recv().unwrap().request_ms, 1_700_000_000_123);

        router.handle_json("v", r#"{"event":"set_frame_rate","frame_rate":15.9}"#);
        assert_eq!(params_rx.borrow().frame_rate, 15);

        router.handle_json("v", r#"{"event":"request_frame","timestamp":-5}"#);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_controls_update_params() {
        let (heartbeats, _rx) = heartbeat_channel();
        let (params, params_rx) = watch::channel(RuntimeParams::default());
        let router = ControlRouter::new(heartbeats, params);

        router.handle_json("v", r#"{"event":"set_frame_rate","frame_rate":120}"#);
        assert_eq!(params_rx.borrow().frame_rate, 30);

        router.handle_json("v", r#"{"event":"set_frame_rate"}"#);
        assert_eq!(params_rx.borrow().frame_rate, 10);

        router.handle_json("v", r#"{"event":"set_resolution","scale":0.05}"#);
        assert_eq!(params_rx.borrow().scale, 0.1);

        router.handle_json("v", r#"{"event":"set_resolution","scale":0.5}"#);
        assert_eq!(params_rx.borrow().scale, 0.5);
        assert_eq!(router.params().frame_rate, 10);
    }

    #[test]
    fn test_input_events_are_accepted() {
        let (heartbeats, _rx) = heartbeat_channel();
        let (params, params_rx) = watch::channel(RuntimeParams::default());
        let router = ControlRouter::new(heartbeats, params);

        router.handle_json("v", r#"{"event":"mouse_event","type":"move","x":10,"y":20}"#);
        assert_eq!(*params_rx.borrow(), RuntimeParams::default());
    }
}
