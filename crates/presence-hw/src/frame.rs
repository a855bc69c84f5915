//! Frame type and pixel conversions: YUYV to RGB, detection downscaling.

use image::imageops::{self, FilterType};
use image::RgbImage;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum FrameError {
    #[error("buffer too short: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("scale factor must be in (0, 1], got {0}")]
    InvalidScale(f32),
}

/// A decoded RGB frame from one stream.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    /// Per-source counter, starting at 1 for the first frame after open.
    pub sequence: u64,
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            sequence,
            captured_at: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Shrink the frame by `factor` for cheaper face detection.
    ///
    /// A factor of exactly 1.0 returns a copy of the full-size image.
    pub fn downscaled(&self, factor: f32) -> Result<RgbImage, FrameError> {
        if !(factor > 0.0 && factor <= 1.0) {
            return Err(FrameError::InvalidScale(factor));
        }
        if factor == 1.0 {
            return Ok(self.image.clone());
        }
        let (w, h) = scaled_dimensions(self.width(), self.height(), factor);
        Ok(imageops::resize(&self.image, w, h, FilterType::Triangle))
    }
}

/// Dimensions after scaling by `factor`, never below 1×1.
pub fn scaled_dimensions(width: u32, height: u32, factor: f32) -> (u32, u32) {
    let scale = |v: u32| ((v as f32 * factor).round() as u32).max(1);
    (scale(width), scale(height))
}

/// Convert packed YUYV 4:2:2 to interleaved RGB (BT.601, limited range).
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share chroma.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = (width * height) as usize;
    let expected = pixels * 2;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity(pixels * 3);
    for quad in yuyv[..expected].chunks_exact(4) {
        let (u, v) = (quad[1] as i32 - 128, quad[3] as i32 - 128);
        for y in [quad[0], quad[2]] {
            let c = 298 * (y as i32 - 16);
            rgb.push(clamp_u8((c + 409 * v + 128) >> 8));
            rgb.push(clamp_u8((c - 100 * u - 208 * v + 128) >> 8));
            rgb.push(clamp_u8((c + 516 * u + 128) >> 8));
        }
    }
    Ok(rgb)
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_yuyv_white_and_black() {
        let rgb = yuyv_to_rgb(&[235, 128, 16, 128], 2, 1).unwrap();
        assert_eq!(rgb, vec![255, 255, 255, 0, 0, 0]);
    }

    #[test]
    fn test_yuyv_too_short() {
        let err = yuyv_to_rgb(&[0u8; 6], 2, 2).unwrap_err();
        assert_eq!(err, FrameError::InvalidLength { expected: 8, actual: 6 });
    }

    #[test]
    fn test_yuyv_output_length() {
        let rgb = yuyv_to_rgb(&vec![128u8; 640 * 480 * 2], 640, 480).unwrap();
        assert_eq!(rgb.len(), 640 * 480 * 3);
    }

    #[test]
    fn test_scaled_dimensions() {
        assert_eq!(scaled_dimensions(1920, 1080, 0.25), (480, 270));
        assert_eq!(scaled_dimensions(3, 3, 0.1), (1, 1));
    }

    #[test]
    fn test_downscaled_quarter() {
        let frame = Frame::new(RgbImage::from_pixel(640, 480, Rgb([10, 20, 30])), 1);
        let small = frame.downscaled(0.25).unwrap();
        assert_eq!(small.dimensions(), (160, 120));
        assert_eq!(*small.get_pixel(80, 60), Rgb([10, 20, 30]));
    }

    #[test]
    fn test_downscaled_full_size_is_copy() {
        let frame = Frame::new(RgbImage::new(8, 6), 1);
        assert_eq!(frame.downscaled(1.0).unwrap().dimensions(), (8, 6));
    }

    #[test]
    fn test_downscaled_rejects_bad_factor() {
        let frame = Frame::new(RgbImage::new(8, 6), 1);
        assert_eq!(frame.downscaled(0.0).unwrap_err(), FrameError::InvalidScale(0.0));
        assert!(frame.downscaled(1.5).is_err());
        assert!(frame.downscaled(f32::NAN).is_err());
    }
}
