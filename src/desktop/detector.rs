//! Change detection between successive captures
//!
//! Each image is reduced to a 64-bit average hash: the image is shrunk to
//! 8x8, converted to grayscale, and every cell brighter than the mean sets
//! one bit. Two captures are compared by the Hamming distance of their
//! hashes, normalized to `[0, 1]`.

use image::imageops;
use tracing::{debug, warn};

use crate::desktop::types::CapturedImage;
use crate::error::CaptureResult;

/// Side length of the downsampled grid
const HASH_SIDE: u32 = 8;

/// Number of bits in a fingerprint
const HASH_BITS: u32 = HASH_SIDE * HASH_SIDE;

/// Score reported when there is nothing to compare against, or when the
/// fingerprint could not be computed
pub const MAX_DISSIMILARITY: f64 = 1.0;

/// Perceptual fingerprint of a captured image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Computes the average hash of an image
    ///
    /// # Errors
    ///
    /// Returns error if the image buffer is malformed
    pub fn of(image: &CapturedImage) -> CaptureResult<Self> {
        let rgb = image.to_rgb()?;
        let small = imageops::thumbnail(&rgb, HASH_SIDE, HASH_SIDE);
        let gray = image::DynamicImage::ImageRgb8(small).to_luma8();

        let sum: u32 = gray.pixels().map(|p| p.0[0] as u32).sum();
        let mean = sum as f64 / HASH_BITS as f64;

        let bits = gray
            .pixels()
            .enumerate()
            .filter(|(_, p)| p.0[0] as f64 > mean)
            .fold(0u64, |acc, (i, _)| acc | (1 << i));

        Ok(Self(bits))
    }

    /// Returns the normalized Hamming distance to another fingerprint
    pub fn distance(&self, other: &Fingerprint) -> f64 {
        (self.0 ^ other.0).count_ones() as f64 / HASH_BITS as f64
    }
}

/// Scores how much the screen changed since the last processed image.
///
/// Only the fingerprint of the previous image is retained.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    last: Option<Fingerprint>,
}

impl ChangeDetector {
    /// Creates a detector with no history
    pub fn new() -> Self {
        Self::default()
    }

    /// Scores `image` against the previously processed image and makes it
    /// the new reference.
    ///
    /// The first image scores [`MAX_DISSIMILARITY`]. A fingerprint failure
    /// also scores [`MAX_DISSIMILARITY`] and clears the reference so the
    /// next image is sent too.
    pub fn score(&mut self, image: &CapturedImage) -> f64 {
        let (score, next) = score(self.last, image);
        self.last = next;
        score
    }

    /// Returns the retained fingerprint
    pub fn last_fingerprint(&self) -> Option<Fingerprint> {
        self.last
    }
}

/// Pure scoring step: `(previous, image) -> (score, new fingerprint)`
pub fn score(previous: Option<Fingerprint>, image: &CapturedImage) -> (f64, Option<Fingerprint>) {
    let current = match Fingerprint::of(image) {
        Ok(fp) => fp,
        Err(e) => {
            warn!("Fingerprint failed, treating frame as changed: {}", e);
            return (MAX_DISSIMILARITY, None);
        }
    };

    let score = match previous {
        Some(prev) => prev.distance(&current),
        None => MAX_DISSIMILARITY,
    };

    debug!(score, "Scored frame");
    (score, Some(current))
}
