//! Error types for DeskStream
//!
//! This module defines all error types used throughout the streaming host.
//! None of these ever terminate the capture loop; the scheduler turns them
//! into skipped or failed cycles.

use std::io;
use thiserror::Error;

/// Main error type for DeskStream
#[derive(Error, Debug)]
pub enum StreamError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Screen capture errors
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    /// Frame encoding errors
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Configuration directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("Failed to create configuration directory: {0}")]
    DirectoryCreationFailed(String),
}

/// Screen capture errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No display available: {0}")]
    NoDisplay(String),

    #[error("Failed to open capturer: {0}")]
    Unavailable(String),

    #[error("Frame capture timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Frame capture failed: {0}")]
    Failed(String),

    #[error("Malformed image: {width}x{height} with {len} bytes")]
    MalformedImage { width: u32, height: u32, len: usize },
}

/// Frame encoding errors
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Invalid input image: {0}")]
    InvalidImage(#[from] CaptureError),

    #[error("JPEG encoding failed: {0}")]
    Jpeg(String),

    #[error("JPEG decoding failed: {0}")]
    JpegDecode(String),

    #[error("zstd compression failed: {0}")]
    Compression(String),

    #[error("zstd decompression failed: {0}")]
    Decompression(String),

    #[error("Invalid payload encoding: {0}")]
    Payload(String),
}

/// Type alias for Results using StreamError
pub type Result<T> = std::result::Result<T, StreamError>;

/// Type alias for Config Results
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Type alias for Capture Results
pub type CaptureResult<T> = std::result::Result<T, CaptureError>;

/// Type alias for Encode Results
pub type EncodeResult<T> = std::result::Result<T, EncodeError>;

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for StreamError {
    fn from(err: toml::de::Error) -> Self {
        StreamError::Config(ConfigError::LoadFailed(err.to_string()))
    }
}

impl From<toml::ser::Error> for StreamError {
    fn from(err: toml::ser::Error) -> Self {
        StreamError::Config(ConfigError::SaveFailed(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CaptureError::MalformedImage {
            width: 10,
            height: 20,
            len: 3,
        };
        assert_eq!(error.to_string(), "Malformed image: 10x20 with 3 bytes");
    }

    #[test]
    fn test_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let stream_error: StreamError = io_error.into();
        assert!(matches!(stream_error, StreamError::Io(_)));

        let encode_error: EncodeError = CaptureError::Failed("gone".to_string()).into();
        assert!(matches!(encode_error, EncodeError::InvalidImage(_)));
    }
}
