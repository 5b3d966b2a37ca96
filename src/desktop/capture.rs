//! Screen capture functionality
//!
//! The scheduler only sees the [`ScreenSource`] trait. [`ScrapSource`] is the
//! real implementation backed by the scrap crate.

use crate::desktop::types::{CapturedImage, PixelFormat};
use crate::error::{CaptureError, CaptureResult};
use scrap::{Capturer, Display};
use std::io::ErrorKind;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Default capture timeout in milliseconds
const CAPTURE_TIMEOUT_MS: u64 = 1000;

/// Poll interval while the grabber has no new frame
const WOULD_BLOCK_POLL_MS: u64 = 10;

/// Something that can grab the current screen contents.
///
/// Capturing is synchronous and blocks for the duration of one grab.
pub trait ScreenSource {
    /// Grabs one image
    ///
    /// # Errors
    ///
    /// Returns error if the grab fails; the caller retries on the next cycle
    fn capture(&mut self) -> CaptureResult<CapturedImage>;
}

impl<S: ScreenSource + ?Sized> ScreenSource for Box<S> {
    fn capture(&mut self) -> CaptureResult<CapturedImage> {
        (**self).capture()
    }
}

/// Display information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayInfo {
    /// Index in the display list
    pub index: usize,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Whether this is the primary display
    pub is_primary: bool,
}

/// Screen source backed by scrap
///
/// The capturer is not `Send`; create it on the thread that runs the loop.
pub struct ScrapSource {
    capturer: Capturer,
    width: usize,
    height: usize,
    timeout: Duration,
}

impl ScrapSource {
    /// Opens a capturer for a display (`None` = primary)
    ///
    /// # Errors
    ///
    /// Returns error if the display cannot be accessed
    pub fn open(display_index: Option<usize>) -> CaptureResult<Self> {
        let display = Self::get_display(display_index)?;
        let capturer =
            Capturer::new(display).map_err(|e| CaptureError::Unavailable(e.to_string()))?;

        let width = capturer.width();
        let height = capturer.height();

        info!("Opened screen capturer ({}x{})", width, height);

        Ok(Self {
            capturer,
            width,
            height,
            timeout: Duration::from_millis(CAPTURE_TIMEOUT_MS),
        })
    }

    fn get_display(display_index: Option<usize>) -> CaptureResult<Display> {
        match display_index {
            Some(index) => Display::all()
                .map_err(|e| CaptureError::NoDisplay(e.to_string()))?
                .into_iter()
                .nth(index)
                .ok_or_else(|| CaptureError::NoDisplay(format!("display {} not found", index))),
            None => Display::primary().map_err(|e| CaptureError::NoDisplay(e.to_string())),
        }
    }

    /// Lists all available displays
    ///
    /// # Errors
    ///
    /// Returns error if displays cannot be enumerated
    pub fn list_displays() -> CaptureResult<Vec<DisplayInfo>> {
        let displays = Display::all().map_err(|e| CaptureError::NoDisplay(e.to_string()))?;

        Ok(displays
            .iter()
            .enumerate()
            .map(|(index, display)| DisplayInfo {
                index,
                width: display.width() as u32,
                height: display.height() as u32,
                is_primary: index == 0,
            })
            .collect())
    }
}

impl ScreenSource for ScrapSource {
    fn capture(&mut self) -> CaptureResult<CapturedImage> {
        let start = Instant::now();
        let (width, height) = (self.width, self.height);

        loop {
            match self.capturer.frame() {
                Ok(frame) => {
                    // Rows may be padded beyond width * 4
                    let stride = (frame.len() / height.max(1)).max(1);
                    let row_bytes = width * 4;
                    let mut data = Vec::with_capacity(row_bytes * height);
                    for row in frame.chunks(stride).take(height) {
                        data.extend_from_slice(&row[..row_bytes.min(row.len())]);
                    }

                    debug!(
                        "Captured {}x{} in {:.2}ms",
                        width,
                        height,
                        start.elapsed().as_secs_f64() * 1000.0
                    );

                    return Ok(CapturedImage::new(
                        width as u32,
                        height as u32,
                        PixelFormat::Bgra8,
                        data,
                    ));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if start.elapsed() > self.timeout {
                        return Err(CaptureError::Timeout(self.timeout));
                    }
                    std::thread::sleep(Duration::from_millis(WOULD_BLOCK_POLL_MS));
                }
                Err(e) => return Err(CaptureError::Failed(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counting(u32);

    impl ScreenSource for Counting {
        fn capture(&mut self) -> CaptureResult<CapturedImage> {
            self.0 += 1;
            Ok(CapturedImage::solid(2, 2, [self.0 as u8, 0, 0]))
        }
    }

    #[test]
    fn test_boxed_source_delegates() {
        let mut source: Box<dyn ScreenSource> = Box::new(Counting(0));
        source.capture().unwrap();
        let image = source.capture().unwrap();
        assert_eq!(image.data[0], 2);
    }

    #[test]
    fn test_list_displays() {
        // May fail in CI environments without displays
        match ScrapSource::list_displays() {
            Ok(displays) => {
                for display in displays {
                    println!("  Display {}: {}x{}", display.index, display.width, display.height);
                }
            }
            Err(e) => println!("Could not enumerate displays (expected in CI): {}", e),
        }
    }
}
