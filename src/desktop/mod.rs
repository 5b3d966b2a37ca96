//! Desktop module for DeskStream
//!
//! This module handles desktop-related functionality including:
//! - Screen capture
//! - Change detection between captures
//! - Quality-adaptive frame encoding and compression

pub mod capture;
pub mod detector;
pub mod encoder;
pub mod types;

// Re-export commonly used types
pub use capture::{DisplayInfo, ScrapSource, ScreenSource};
pub use detector::{ChangeDetector, Fingerprint, MAX_DISSIMILARITY};
pub use encoder::{
    compress_zstd, decode_payload, decompress_zstd, AdaptiveEncoder, EncodeOutcome,
    EncoderSettings, QualityBudget,
};
pub use types::{
    unix_millis, CapturedImage, EncodedFrame, FrameType, Fps, PixelFormat, Quality,
    RuntimeParams, DEFAULT_FPS, DEFAULT_QUALITY, DEFAULT_SCALE, DELTA_QUALITY_CEILING, MAX_FPS,
    MAX_QUALITY, MAX_SCALE, MIN_FPS, MIN_QUALITY, MIN_SCALE,
};
