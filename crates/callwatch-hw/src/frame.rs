//! Captured screen frames.

use chrono::{DateTime, Local};
use image::RgbImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A decoded screen capture.
///
/// The pixel buffer is shared immutably so the persistence worker and the
/// detection path can hold it at the same time.
#[derive(Clone, Debug)]
pub struct Frame {
    pub pixels: Arc<RgbImage>,
    pub captured_at: DateTime<Local>,
    /// Per-process, strictly increasing.
    pub sequence: u64,
}

impl Frame {
    pub fn new(pixels: RgbImage, sequence: u64) -> Self {
        Self {
            pixels: Arc::new(pixels),
            captured_at: Local::now(),
            sequence,
        }
    }

    /// Decode an encoded image (PNG, JPEG, ...) into an RGB frame.
    pub fn from_encoded(bytes: &[u8], sequence: u64) -> Result<Self, FrameError> {
        if bytes.is_empty() {
            return Err(FrameError::Empty);
        }
        let image = image::load_from_memory(bytes)?.to_rgb8();
        if image.width() == 0 || image.height() == 0 {
            return Err(FrameError::Empty);
        }
        Ok(Self::new(image, sequence))
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

/// Hands out frame sequence numbers.
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU64);

impl SequenceCounter {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("capture produced no image data")]
    Empty,
    #[error("cannot decode captured image: {0}")]
    Decode(#[from] image::ImageError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([10, 20, 30]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_decode_png() {
        let frame = Frame::from_encoded(&png(8, 6), 7).unwrap();
        assert_eq!((frame.width(), frame.height()), (8, 6));
        assert_eq!(frame.sequence, 7);
        assert_eq!(frame.pixels.get_pixel(3, 3).0, [10, 20, 30]);
    }

    #[test]
    fn test_empty_and_garbage() {
        assert!(matches!(Frame::from_encoded(&[], 1), Err(FrameError::Empty)));
        assert!(matches!(Frame::from_encoded(b"not an image", 1), Err(FrameError::Decode(_))));
    }

    #[test]
    fn test_sequence_strictly_increasing() {
        let counter = SequenceCounter::default();
        let a = counter.next();
        let b = counter.next();
        assert!(b > a);
        assert_eq!(a, 1);
    }

    #[test]
    fn test_clone_shares_pixels() {
        let frame = Frame::new(RgbImage::new(4, 4), 1);
        let copy = frame.clone();
        assert!(Arc::ptr_eq(&frame.pixels, &copy.pixels));
    }
}
