//! Screen capture: frames, the capture seam and perceptual fingerprints.

mod command;
mod fingerprint;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use image::{ImageFormat, RgbaImage};
use std::io::Cursor;
use thiserror::Error;

pub use command::{is_png, CommandCapture, DEFAULT_CAPTURE_TIMEOUT_SECS};
pub use fingerprint::{Fingerprint, Fingerprinter, DEFAULT_MASK_TOP_RATIO};

/// Capture errors.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Capture target unavailable: {0}")]
    Unavailable(String),
    #[error("Failed to decode frame: {0}")]
    Decode(String),
    #[error("Failed to encode frame: {0}")]
    Encode(String),
    #[error("Capture timed out")]
    Timeout,
}

/// A captured image of the target region.
#[derive(Debug, Clone)]
pub struct Frame {
    image: RgbaImage,
    captured_at: DateTime<Utc>,
}

impl Frame {
    /// Wrap an image captured now.
    pub fn new(image: RgbaImage) -> Self {
        Self {
            image,
            captured_at: Utc::now(),
        }
    }

    /// Decode PNG (or any format `image` recognizes) bytes.
    pub fn from_png_bytes(bytes: &[u8]) -> Result<Self, CaptureError> {
        let decoded =
            image::load_from_memory(bytes).map_err(|e| CaptureError::Decode(e.to_string()))?;
        Ok(Self::new(decoded.to_rgba8()))
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// PNG-encode and base64 the frame for the model request.
    pub fn to_base64_png(&self) -> Result<String, CaptureError> {
        let mut buffer = Cursor::new(Vec::new());
        self.image
            .write_to(&mut buffer, ImageFormat::Png)
            .map_err(|e| CaptureError::Encode(e.to_string()))?;
        Ok(STANDARD.encode(buffer.into_inner()))
    }
}

/// Produces frames of the target region on demand.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn capture(&self) -> Result<Frame, CaptureError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_png_round_trip_keeps_dimensions() {
        let frame = Frame::new(RgbaImage::from_pixel(12, 7, Rgba([10, 20, 30, 255])));
        let encoded = frame.to_base64_png().unwrap();
        let bytes = STANDARD.decode(encoded).unwrap();
        assert!(is_png(&bytes));
        let decoded = Frame::from_png_bytes(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (12, 7));
        assert_eq!(decoded.image().get_pixel(3, 3), &Rgba([10, 20, 30, 255]));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Frame::from_png_bytes(b"not an image"),
            Err(CaptureError::Decode(_))
        ));
    }
}
