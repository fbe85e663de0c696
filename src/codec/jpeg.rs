//! Still-image encoding for sampled frames
//!
//! Scales a raw RGBA frame to fit the configured bounds and encodes it as a
//! base64 JPEG, the compact payload carried by `frame` messages.

use base64::{engine::general_purpose::STANDARD, Engine};
use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, DynamicImage, RgbaImage};

use crate::error::CaptureError;

/// JPEG encoder with fixed quality and size bounds
#[derive(Debug, Clone)]
pub struct SnapshotEncoder {
    quality: u8,
    max_width: u32,
    max_height: u32,
}

/// One encoded snapshot
#[derive(Debug, Clone)]
pub struct EncodedImage {
    /// Base64 JPEG, no MIME prefix
    pub base64: String,
    /// Raw JPEG bytes, served to the preview
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl SnapshotEncoder {
    pub fn new(quality: u8, max_width: u32, max_height: u32) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            max_width: max_width.max(1),
            max_height: max_height.max(1),
        }
    }

    /// Encode an RGBA frame, downscaling first if it exceeds the bounds
    pub fn encode(&self, frame: &RgbaImage) -> Result<EncodedImage, CaptureError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(CaptureError::Encode("Empty frame".to_string()));
        }

        let (width, height) =
            scaled_dimensions(frame.width(), frame.height(), self.max_width, self.max_height);

        let rgb = if (width, height) == frame.dimensions() {
            DynamicImage::ImageRgba8(frame.clone()).to_rgb8()
        } else {
            let resized = image::imageops::resize(frame, width, height, FilterType::Triangle);
            DynamicImage::ImageRgba8(resized).to_rgb8()
        };

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.quality)
            .encode_image(&rgb)
            .map_err(|e| CaptureError::Encode(e.to_string()))?;

        Ok(EncodedImage {
            base64: STANDARD.encode(&jpeg),
            jpeg,
            width,
            height,
        })
    }
}

/// Fit `width`x`height` inside the bounds, preserving aspect ratio, never upscaling
fn scaled_dimensions(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    let scale = (max_width as f64 / width as f64)
        .min(max_height as f64 / height as f64)
        .min(1.0);

    let w = ((width as f64) * scale).round() as u32;
    let h = ((height as f64) * scale).round() as u32;
    (w.max(1), h.max(1))
}
