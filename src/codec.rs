//! Still-image codec seam.
//!
//! The transcoder hands interleaved pixels to an `ImageCodec` and gets encoded
//! bytes back. `JpegCodec` is backed by the `image` crate.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorSpace {
    /// Interleaved Y, Cb, Cr triplets (full range).
    YCbCr,
    /// Interleaved R, G, B triplets.
    Rgb,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("pixel buffer holds {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },
    #[error("quality {0} outside 1..=100")]
    Quality(u8),
    #[error("encode failed: {0}")]
    Encode(String),
}

pub trait ImageCodec: Send + Sync {
    /// File extension for encoded output, without the dot.
    fn extension(&self) -> &'static str;

    fn encode(
        &self,
        width: u32,
        height: u32,
        color_space: ColorSpace,
        quality: u8,
        pixels: &[u8],
    ) -> Result<Vec<u8>, CodecError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JpegCodec;

impl ImageCodec for JpegCodec {
    fn extension(&self) -> &'static str {
        "jpg"
    }

    fn encode(
        &self,
        width: u32,
        height: u32,
        color_space: ColorSpace,
        quality: u8,
        pixels: &[u8],
    ) -> Result<Vec<u8>, CodecError> {
        if quality == 0 || quality > 100 {
            return Err(CodecError::Quality(quality));
        }
        let expected = width as usize * height as usize * 3;
        if pixels.len() != expected {
            return Err(CodecError::BufferSize {
                expected,
                actual: pixels.len(),
            });
        }
        // The encoder takes RGB and performs its own YCbCr transform.
        let rgb = match color_space {
            ColorSpace::Rgb => pixels.to_vec(),
            ColorSpace::YCbCr => ycbcr_to_rgb(pixels),
        };
        let mut out = Vec::with_capacity(expected / 8);
        JpegEncoder::new_with_quality(&mut out, quality)
            .encode(&rgb, width, height, ExtendedColorType::Rgb8)
            .map_err(|err| CodecError::Encode(err.to_string()))?;
        Ok(out)
    }
}

/// BT.601 full-range YCbCr to RGB, per triplet.
pub fn ycbcr_to_rgb(pixels: &[u8]) -> Vec<u8> {
    let mut rgb = vec![0u8; pixels.len()];
    for (src, dst) in pixels.chunks_exact(3).zip(rgb.chunks_exact_mut(3)) {
        let y = src[0] as f32;
        let cb = src[1] as f32 - 128.0;
        let cr = src[2] as f32 - 128.0;

        let r = y + 1.402_f32 * cr;
        let g = y - 0.344_136_f32 * cb - 0.714_136_f32 * cr;
        let b = y + 1.772_f32 * cb;

        dst[0] = clamp_to_u8(r);
        dst[1] = clamp_to_u8(g);
        dst[2] = clamp_to_u8(b);
    }
    rgb
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
