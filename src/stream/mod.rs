//! Adaptive frame streaming pipeline
//!
//! This module wires the capture loop to its viewers:
//! - Per-viewer lag tracking
//! - The paced capture/detect/encode loop
//! - Broadcast fan-out and inbound control messages

pub mod clients;
pub mod scheduler;
pub mod transport;

pub use clients::{
    heartbeat_channel, ClientCondition, ClientConditionTracker, ClientId, Heartbeat,
    HeartbeatSender, TrackerSettings,
};
pub use scheduler::{
    is_keyframe, CycleOutcome, FailureStage, PipelineEndpoints, PipelineStats, SkipReason,
    StreamHandle, StreamScheduler, StreamSettings,
};
pub use transport::{
    spawn_forwarder, BroadcastHub, ControlRouter, FrameBroadcaster, ViewerMessage, WireFrame,
    BROADCAST_BUFFER,
};
