//! In-memory pixel buffers.
//!
//! A `Frame` is one decoded still image, standalone or pulled from a video.
//! Pixels are RGB8, row-major, no padding. Frames are never persisted by the
//! pipeline; the annotator always works on a clone so the source buffer stays
//! intact for whoever else holds it.

use std::path::Path;

use image::RgbImage;

use crate::error::{DetectError, Result};

/// Channels per pixel. Every frame is normalized to RGB at decode time.
pub const CHANNELS: usize = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    image: RgbImage,
}

impl Frame {
    /// Wrap raw RGB8 bytes. Rejects zero-sized frames and length mismatches.
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(CHANNELS))
            .ok_or_else(|| DetectError::BadInput("frame dimensions overflow".into()))?;
        if pixels.len() != expected {
            return Err(DetectError::BadInput(format!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            )));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| DetectError::BadInput("pixel buffer does not fit frame".into()))?;
        Self::from_image(image)
    }

    pub fn from_image(image: RgbImage) -> Result<Self> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectError::BadInput(format!(
                "zero-sized frame {}x{}",
                image.width(),
                image.height()
            )));
        }
        Ok(Self { image })
    }

    /// Solid-color frame, mostly useful for synthetic sources.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Result<Self> {
        Self::from_image(RgbImage::from_pixel(width, height, image::Rgb(rgb)))
    }

    /// Decode an encoded image (JPEG, PNG, BMP, WebP) held in memory.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(DetectError::BadInput("empty image buffer".into()));
        }
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| DetectError::BadInput(format!("invalid image data: {e}")))?;
        Self::from_image(decoded.to_rgb8())
    }

    /// Read and decode an image file. The format is sniffed from the content,
    /// not the extension.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        Self::decode(&bytes).map_err(|e| match e {
            DetectError::BadInput(reason) => {
                DetectError::BadInput(format!("{}: {reason}", path.display()))
            }
            other => other,
        })
    }

    /// Encode to disk; the format follows the path extension.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.image.save(path).map_err(|e| {
            DetectError::Io(std::io::Error::other(format!(
                "failed to write image {}: {e}",
                path.display()
            )))
        })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width() || y >= self.height() {
            return None;
        }
        Some(self.image.get_pixel(x, y).0)
    }

    pub fn as_image(&self) -> &RgbImage {
        &self.image
    }

    pub(crate) fn image_mut(&mut self) -> &mut RgbImage {
        &mut self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn rejects_length_mismatch() {
        let err = Frame::from_rgb(2, 2, vec![0u8; 11]).unwrap_err();
        assert!(matches!(err, DetectError::BadInput(_)));
    }

    #[test]
    fn rejects_zero_sized() {
        let err = Frame::from_rgb(0, 4, Vec::new()).unwrap_err();
        assert!(matches!(err, DetectError::BadInput(_)));
    }

    #[test]
    fn decode_rejects_garbage_and_empty() {
        assert!(matches!(
            Frame::decode(&[]).unwrap_err(),
            DetectError::BadInput(_)
        ));
        assert!(matches!(
            Frame::decode(b"definitely not a png").unwrap_err(),
            DetectError::BadInput(_)
        ));
    }

    #[test]
    fn decode_png_round_trip_keeps_pixels() {
        let source = RgbImage::from_pixel(3, 2, image::Rgb([10, 20, 30]));
        let mut encoded = Vec::new();
        source
            .write_to(&mut Cursor::new(&mut encoded), image::ImageFormat::Png)
            .unwrap();

        let frame = Frame::decode(&encoded).unwrap();
        assert_eq!((frame.width(), frame.height()), (3, 2));
        assert_eq!(frame.pixel(2, 1), Some([10, 20, 30]));
        assert_eq!(frame.pixel(3, 0), None);
    }
}
