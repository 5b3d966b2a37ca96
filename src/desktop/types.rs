//! Desktop types and data structures
//!
//! This module defines the frame types shared by capture, change detection
//! and encoding.

use image::{imageops::FilterType, ImageBuffer, Rgb, RgbImage, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use crate::error::{CaptureError, CaptureResult};

/// Frame quality setting (1-100)
pub type Quality = u8;

/// Frames per second setting
pub type Fps = u8;

/// Valid quality range constants
pub const MIN_QUALITY: Quality = 1;
pub const MAX_QUALITY: Quality = 100;
pub const DEFAULT_QUALITY: Quality = 95;

/// Ceiling applied to delta frames regardless of the requested quality
pub const DELTA_QUALITY_CEILING: Quality = 80;

/// Valid FPS range constants
pub const MIN_FPS: Fps = 1;
pub const MAX_FPS: Fps = 30;
pub const DEFAULT_FPS: Fps = 30;

/// Valid capture scale range constants
pub const MIN_SCALE: f32 = 0.1;
pub const MAX_SCALE: f32 = 1.0;
pub const DEFAULT_SCALE: f32 = 1.0;

/// Layout of the raw pixel buffer of a [`CapturedImage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 4 bytes per pixel, R G B A
    Rgba8,
    /// 4 bytes per pixel, B G R A (native layout of most screen grabbers)
    Bgra8,
    /// 3 bytes per pixel, R G B
    Rgb8,
}

impl PixelFormat {
    /// Returns the number of bytes used by one pixel
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => 4,
            PixelFormat::Rgb8 => 3,
        }
    }
}

/// A raster grabbed from the screen source.
///
/// Never mutated after capture; every stage only reads it.
#[derive(Debug, Clone)]
pub struct CapturedImage {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Layout of `data`
    pub format: PixelFormat,
    /// Raw pixel data
    pub data: Vec<u8>,
    /// When the image was grabbed
    pub captured_at: Instant,
}

impl CapturedImage {
    /// Creates a new captured image stamped with the current instant
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            data,
            captured_at: Instant::now(),
        }
    }

    /// Creates an image filled with a single RGB colour
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self::new(width, height, PixelFormat::Rgb8, data)
    }

    /// Returns the size of the pixel data in bytes
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    /// Validates that the pixel data matches the dimensions
    pub fn is_valid(&self) -> bool {
        let expected = self.width as usize * self.height as usize * self.format.bytes_per_pixel();
        self.width > 0 && self.height > 0 && self.data.len() == expected
    }

    fn ensure_valid(&self) -> CaptureResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(CaptureError::MalformedImage {
                width: self.width,
                height: self.height,
                len: self.data.len(),
            })
        }
    }

    /// Converts the raster to a packed RGB image
    ///
    /// # Errors
    ///
    /// Returns error if the buffer does not match the dimensions
    pub fn to_rgb(&self) -> CaptureResult<RgbImage> {
        self.ensure_valid()?;

        let rgb = match self.format {
            PixelFormat::Rgb8 => self.data.clone(),
            PixelFormat::Rgba8 => self
                .data
                .chunks_exact(4)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect(),
            PixelFormat::Bgra8 => self
                .data
                .chunks_exact(4)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
        };

        ImageBuffer::<Rgb<u8>, _>::from_raw(self.width, self.height, rgb).ok_or(
            CaptureError::MalformedImage {
                width: self.width,
                height: self.height,
                len: self.data.len(),
            },
        )
    }

    /// Returns a downscaled copy of the image, or the image itself when
    /// `factor` is 1.0 or above.
    ///
    /// The result keeps the capture timestamp of the original.
    ///
    /// # Errors
    ///
    /// Returns error if the buffer does not match the dimensions
    pub fn scaled(self, factor: f32) -> CaptureResult<Self> {
        let factor = factor.clamp(MIN_SCALE, MAX_SCALE);
        if factor >= MAX_SCALE {
            return Ok(self);
        }
        self.ensure_valid()?;

        let width = ((self.width as f32 * factor).round() as u32).max(1);
        let height = ((self.height as f32 * factor).round() as u32).max(1);

        let rgba: RgbaImage = match self.format {
            PixelFormat::Rgba8 => {
                ImageBuffer::<Rgba<u8>, _>::from_raw(self.width, self.height, self.data.clone())
                    .ok_or(CaptureError::MalformedImage {
                        width: self.width,
                        height: self.height,
                        len: self.data.len(),
                    })?
            }
            _ => image::DynamicImage::ImageRgb8(self.to_rgb()?).to_rgba8(),
        };

        let resized = image::imageops::resize(&rgba, width, height, FilterType::Triangle);

        Ok(Self {
            width,
            height,
            format: PixelFormat::Rgba8,
            data: resized.into_raw(),
            captured_at: self.captured_at,
        })
    }
}

/// Whether a frame is a periodic resynchronisation point or a regular update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    /// Full colour depth, higher quality ceiling
    Keyframe,
    /// Quantized colours, capped quality
    Delta,
}

impl FrameType {
    /// Returns true for keyframes
    pub fn is_keyframe(&self) -> bool {
        matches!(self, FrameType::Keyframe)
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameType::Keyframe => write!(f, "keyframe"),
            FrameType::Delta => write!(f, "delta"),
        }
    }
}

/// Encoded frame ready for broadcast
///
/// Immutable once produced; the transport only reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Keyframe or delta
    pub frame_type: FrameType,
    /// zstd-compressed JPEG bytes
    pub payload: Vec<u8>,
    /// Capture time in milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    /// Width of the encoded image
    pub width: u32,
    /// Height of the encoded image
    pub height: u32,
    /// JPEG quality that was actually used
    pub quality: Quality,
}

impl EncodedFrame {
    /// Returns the payload size in bytes
    pub fn size_bytes(&self) -> usize {
        self.payload.len()
    }
}

/// Parameters that viewers may adjust while the stream is running
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuntimeParams {
    /// Target capture rate
    pub frame_rate: Fps,
    /// Capture downscale factor
    pub scale: f32,
}

impl Default for RuntimeParams {
    fn default() -> Self {
        Self {
            frame_rate: DEFAULT_FPS,
            scale: DEFAULT_SCALE,
        }
    }
}

impl RuntimeParams {
    /// Creates runtime parameters, clamping both values into range
    pub fn new(frame_rate: i64, scale: f64) -> Self {
        Self {
            frame_rate: clamp_frame_rate(frame_rate),
            scale: clamp_scale(scale),
        }
    }

    /// Returns a copy with a new (clamped) frame rate
    pub fn with_frame_rate(mut self, frame_rate: i64) -> Self {
        self.frame_rate = clamp_frame_rate(frame_rate);
        self
    }

    /// Returns a copy with a new (clamped) scale factor
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = clamp_scale(scale);
        self
    }

    /// Returns the target interval between cycle starts
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate.max(MIN_FPS) as f64)
    }
}

/// Clamps a requested frame rate into `MIN_FPS..=MAX_FPS`
pub fn clamp_frame_rate(frame_rate: i64) -> Fps {
    frame_rate.clamp(MIN_FPS as i64, MAX_FPS as i64) as Fps
}

/// Clamps a requested scale factor into `MIN_SCALE..=MAX_SCALE`
pub fn clamp_scale(scale: f64) -> f32 {
    if scale.is_nan() {
        return DEFAULT_SCALE;
    }
    scale.clamp(MIN_SCALE as f64, MAX_SCALE as f64) as f32
}

/// Returns the current wall-clock time in milliseconds since the Unix epoch
pub fn unix_millis() -> u64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    (nanos / 1_000_000).max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_validation() {
        let image = CapturedImage::new(64, 32, PixelFormat::Rgba8, vec![0u8; 64 * 32 * 4]);
        assert!(image.is_valid());

        let short = CapturedImage::new(64, 32, PixelFormat::Rgba8, vec![0u8; 100]);
        assert!(!short.is_valid());
        assert!(short.to_rgb().is_err());

        let empty = CapturedImage::new(0, 0, PixelFormat::Rgb8, Vec::new());
        assert!(!empty.is_valid());
    }

    #[test]
    fn test_bgra_to_rgb() {
        let image = CapturedImage::new(1, 1, PixelFormat::Bgra8, vec![10, 20, 30, 255]);
        let rgb = image.to_rgb().unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [30, 20, 10]);
    }

    #[test]
    fn test_scaled_halves_dimensions() {
        let image = CapturedImage::solid(100, 50, [200, 100, 50]);
        let scaled = image.scaled(0.5).unwrap();
        assert_eq!((scaled.width, scaled.height), (50, 25));
        assert_eq!(scaled.format, PixelFormat::Rgba8);
        assert!(scaled.is_valid());
    }

    #[test]
    fn test_scaled_full_size_is_untouched() {
        let image = CapturedImage::solid(10, 10, [1, 2, 3]);
        let scaled = image.clone().scaled(1.0).unwrap();
        assert_eq!(scaled.format, PixelFormat::Rgb8);
        assert_eq!(scaled.data, image.data);
    }

    #[test]
    fn test_runtime_params_clamping() {
        let params = RuntimeParams::new(120, 5.0);
        assert_eq!(params.frame_rate, MAX_FPS);
        assert_eq!(params.scale, MAX_SCALE);

        let params = RuntimeParams::new(0, 0.01);
        assert_eq!(params.frame_rate, MIN_FPS);
        assert_eq!(params.scale, MIN_SCALE);

        let params = RuntimeParams::default().with_scale(f64::NAN);
        assert_eq!(params.scale, DEFAULT_SCALE);
    }

    #[test]
    fn test_frame_interval() {
        let params = RuntimeParams::default();
        assert_eq!(params.frame_interval().as_millis(), 33);

        let params = params.with_frame_rate(10);
        assert_eq!(params.frame_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_frame_type_display() {
        assert_eq!(FrameType::Keyframe.to_string(), "keyframe");
        assert_eq!(FrameType::Delta.to_string(), "delta");
        assert!(FrameType::Keyframe.is_keyframe());
    }
}
