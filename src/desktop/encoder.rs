//! Frame encoding and compression
//!
//! Frames are encoded in two passes: a lossy JPEG pass at a quality chosen
//! by frame type, then a zstd pass over the JPEG bytes. Delta frames are
//! colour-quantized before the JPEG pass and compressed with a cheaper zstd
//! level.

use crate::desktop::types::{
    unix_millis, CapturedImage, EncodedFrame, FrameType, Quality, DELTA_QUALITY_CEILING,
    MAX_QUALITY, MIN_QUALITY,
};
use crate::error::{EncodeError, EncodeResult};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::io::Cursor;
use std::time::Instant;
use tracing::{debug, warn};

/// Default zstd level for keyframes
pub const DEFAULT_KEYFRAME_LEVEL: i32 = 3;

/// Default zstd level for delta frames
pub const DEFAULT_DELTA_LEVEL: i32 = 1;

/// Default per-channel quantization stride for delta frames
pub const DEFAULT_QUANTIZATION_STEP: u8 = 32;

/// How much a caller is willing to spend on a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityBudget {
    /// Encode with this quality hint
    Encode(Quality),
    /// The frame is not worth sending
    Drop,
}

/// Result of an encode request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeOutcome {
    /// A frame ready for broadcast
    Encoded(EncodedFrame),
    /// Nothing was produced, by policy or because a stage failed
    Skipped,
}

impl EncodeOutcome {
    /// Returns the frame, if one was produced
    pub fn into_frame(self) -> Option<EncodedFrame> {
        match self {
            EncodeOutcome::Encoded(frame) => Some(frame),
            EncodeOutcome::Skipped => None,
        }
    }
}

/// Encoder settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSettings {
    /// Quality ceiling applied to delta frames
    pub delta_quality_ceiling: Quality,
    /// zstd level for keyframes
    pub keyframe_level: i32,
    /// zstd level for delta frames
    pub delta_level: i32,
    /// Per-channel quantization stride for delta frames (1 disables)
    pub quantization_step: u8,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            delta_quality_ceiling: DELTA_QUALITY_CEILING,
            keyframe_level: DEFAULT_KEYFRAME_LEVEL,
            delta_level: DEFAULT_DELTA_LEVEL,
            quantization_step: DEFAULT_QUANTIZATION_STEP,
        }
    }
}

/// Quality-adaptive frame encoder
#[derive(Debug, Clone, Default)]
pub struct AdaptiveEncoder {
    settings: EncoderSettings,
}

impl AdaptiveEncoder {
    /// Creates a new encoder
    pub fn new(settings: EncoderSettings) -> Self {
        Self { settings }
    }

    /// Returns the encoder settings
    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    /// Resolves the JPEG quality for a frame type and quality hint
    pub fn resolve_quality(&self, frame_type: FrameType, hint: Quality) -> Quality {
        let quality = match frame_type {
            FrameType::Keyframe => hint,
            FrameType::Delta => hint.min(self.settings.delta_quality_ceiling),
        };
        quality.clamp(MIN_QUALITY, MAX_QUALITY)
    }

    /// Encodes an image.
    ///
    /// Returns [`EncodeOutcome::Skipped`] when the budget is
    /// [`QualityBudget::Drop`] or when any stage fails; failures are logged.
    pub fn encode(
        &self,
        image: &CapturedImage,
        frame_type: FrameType,
        budget: QualityBudget,
    ) -> EncodeOutcome {
        let hint = match budget {
            QualityBudget::Encode(hint) => hint,
            QualityBudget::Drop => return EncodeOutcome::Skipped,
        };

        match self.try_encode(image, frame_type, hint) {
            Ok(frame) => EncodeOutcome::Encoded(frame),
            Err(e) => {
                warn!("Failed to encode {} frame: {}", frame_type, e);
                EncodeOutcome::Skipped
            }
        }
    }

    /// Encodes an image, reporting the failing stage
    ///
    /// # Errors
    ///
    /// Returns error if the image is malformed or a compression stage fails
    pub fn try_encode(
        &self,
        image: &CapturedImage,
        frame_type: FrameType,
        hint: Quality,
    ) -> EncodeResult<EncodedFrame> {
        let start = Instant::now();
        let quality = self.resolve_quality(frame_type, hint);

        let mut rgb = image.to_rgb()?;
        if !frame_type.is_keyframe() {
            quantize(&mut rgb, self.settings.quantization_step);
        }

        let jpeg = encode_jpeg(&rgb, quality)?;
        let level = match frame_type {
            FrameType::Keyframe => self.settings.keyframe_level,
            FrameType::Delta => self.settings.delta_level,
        };
        let payload = compress_zstd(&jpeg, level)?;

        debug!(
            "Encoded {} {}x{} q={} ({} -> {} -> {} bytes) in {:.2}ms",
            frame_type,
            image.width,
            image.height,
            quality,
            image.size_bytes(),
            jpeg.len(),
            payload.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );

        Ok(EncodedFrame {
            frame_type,
            payload,
            timestamp_ms: capture_millis(image),
            width: image.width,
            height: image.height,
            quality,
        })
    }
}

/// Maps the capture instant of an image onto the wall clock
fn capture_millis(image: &CapturedImage) -> u64 {
    let age = image.captured_at.elapsed().as_millis() as u64;
    unix_millis().saturating_sub(age)
}

/// Rounds every channel down to a multiple of `step`
pub fn quantize(rgb: &mut RgbImage, step: u8) {
    if step <= 1 {
        return;
    }
    for channel in rgb.iter_mut() {
        *channel = (*channel / step) * step;
    }
}

/// Encodes an RGB image as JPEG
///
/// # Errors
///
/// Returns error if JPEG encoding fails
pub fn encode_jpeg(rgb: &RgbImage, quality: Quality) -> EncodeResult<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
    encoder
        .encode(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            image::ColorType::Rgb8,
        )
        .map_err(|e| EncodeError::Jpeg(e.to_string()))?;
    Ok(buffer.into_inner())
}

/// Compresses data using zstd
///
/// # Errors
///
/// Returns error if compression fails
pub fn compress_zstd(data: &[u8], level: i32) -> EncodeResult<Vec<u8>> {
    zstd::encode_all(data, level).map_err(|e| EncodeError::Compression(e.to_string()))
}

/// Decompresses zstd data
///
/// # Errors
///
/// Returns error if decompression fails
pub fn decompress_zstd(data: &[u8]) -> EncodeResult<Vec<u8>> {
    zstd::decode_all(data).map_err(|e| EncodeError::Decompression(e.to_string()))
}

/// Decodes a frame payload back into an RGB image, as a viewer would
///
/// # Errors
///
/// Returns error if the payload is not zstd-wrapped JPEG
pub fn decode_payload(payload: &[u8]) -> EncodeResult<RgbImage> {
    let jpeg = decompress_zstd(payload)?;
    let img = image::load_from_memory_with_format(&jpeg, image::ImageFormat::Jpeg)
        .map_err(|e| EncodeError::JpegDecode(e.to_string()))?;
    Ok(img.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desktop::types::{PixelFormat, DEFAULT_QUALITY};

    fn create_test_image() -> CapturedImage {
        // Simple gradient (red to blue)
        let width = 100;
        let height = 100;
        let mut data = Vec::with_capacity((width * height * 4) as usize);

        for y in 0..height {
            for x in 0..width {
                data.push((x * 255 / width) as u8);
                data.push(0);
                data.push((y * 255 / height) as u8);
                data.push(255);
            }
        }

        CapturedImage::new(width, height, PixelFormat::Rgba8, data)
    }

    #[test]
    fn test_delta_quality_is_capped() {
        let encoder = AdaptiveEncoder::default();
        assert_eq!(encoder.resolve_quality(FrameType::Delta, 95), 80);
        assert_eq!(encoder.resolve_quality(FrameType::Delta, 60), 60);
        assert_eq!(encoder.resolve_quality(FrameType::Keyframe, 95), 95);
        assert_eq!(encoder.resolve_quality(FrameType::Keyframe, 0), MIN_QUALITY);
    }

    #[test]
    fn test_keyframe_roundtrip() {
        let image = create_test_image();
        let encoder = AdaptiveEncoder::default();

        let frame = encoder
            .encode(&image, FrameType::Keyframe, QualityBudget::Encode(95))
            .into_frame()
            .unwrap();
        assert_eq!(frame.frame_type, FrameType::Keyframe);
        assert_eq!(frame.quality, 95);
        assert!(frame.size_bytes() < image.size_bytes());

        let decoded = decode_payload(&frame.payload).unwrap();
        assert_eq!(decoded.dimensions(), (100, 100));
    }

    #[test]
    fn test_delta_is_quantized_and_capped() {
        let image = CapturedImage::solid(32, 32, [200, 100, 50]);
        let encoder = AdaptiveEncoder::default();

        let key = encoder.try_encode(&image, FrameType::Keyframe, 95).unwrap();
        let delta = encoder.try_encode(&image, FrameType::Delta, 95).unwrap();
        assert_eq!(key.quality, 95);
        assert_eq!(delta.quality, 80);

        let near = |actual: u8, expected: u8| (actual as i16 - expected as i16).abs() <= 6;

        // Keyframes keep the source colour
        let key_px = decode_payload(&key.payload).unwrap().get_pixel(16, 16).0;
        assert!(near(key_px[0], 200) && near(key_px[1], 100) && near(key_px[2], 50), "{:?}", key_px);

        // Delta channels land on multiples of the quantization step
        let delta_px = decode_payload(&delta.payload).unwrap().get_pixel(16, 16).0;
        assert!(near(delta_px[0], 192) && near(delta_px[1], 96) && near(delta_px[2], 32), "{:?}", delta_px);
    }

    #[test]
    fn test_drop_budget_skips() {
        let encoder = AdaptiveEncoder::default();
        let outcome = encoder.encode(&create_test_image(), FrameType::Delta, QualityBudget::Drop);
        assert_eq!(outcome, EncodeOutcome::Skipped);
    }

    #[test]
    fn test_malformed_image_skips() {
        let encoder = AdaptiveEncoder::default();
        let broken = CapturedImage::new(10, 10, PixelFormat::Rgba8, vec![0; 7]);

        assert!(encoder.try_encode(&broken, FrameType::Keyframe, 95).is_err());
        assert_eq!(
            encoder.encode(&broken, FrameType::Keyframe, QualityBudget::Encode(DEFAULT_QUALITY)),
            EncodeOutcome::Skipped
        );
    }

    #[test]
    fn test_quantize_rounds_down() {
        let mut rgb = RgbImage::from_raw(2, 1, vec![0, 31, 32, 63, 200, 255]).unwrap();
        quantize(&mut rgb, 32);
        assert_eq!(rgb.as_raw(), &vec![0, 0, 32, 32, 192, 224]);

        let mut untouched = RgbImage::from_raw(1, 1, vec![7, 8, 9]).unwrap();
        quantize(&mut untouched, 1);
        assert_eq!(untouched.as_raw(), &vec![7, 8, 9]);
    }

    #[test]
    fn test_zstd_compression() {
        let data = vec![1u8; 1000];
        let compressed = compress_zstd(&data, 3).unwrap();
        assert!(compressed.len() < data.len());

        let decompressed = decompress_zstd(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_payload(&[1, 2, 3, 4]).is_err());
    }
}
