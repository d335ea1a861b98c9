//! Planar YUV420 frame → encoded image file.
//!
//! Chroma is upsampled nearest-neighbour: each U/V sample covers its 2x2 luma
//! block. Files are written to a temp name in the target directory and renamed
//! into place, so a failed frame never leaves a partial `frame_*` file behind.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::codec::{CodecError, ColorSpace, ImageCodec};
use crate::device::DeviceError;
use crate::frame::{PlaneLayout, RawFrame};

pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Per-frame failure. Recovered by skipping the frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is {actual_w}x{actual_h}, configured {expected_w}x{expected_h}")]
    Dimensions {
        expected_w: u32,
        expected_h: u32,
        actual_w: u32,
        actual_h: u32,
    },
    #[error("{plane} plane holds {actual} bytes, expected {expected}")]
    PlaneSize {
        plane: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("map: {0}")]
    Map(#[from] DeviceError),
    #[error("encode: {0}")]
    Encode(#[from] CodecError),
    #[error("write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{width}x{height} is not a valid YUV420 size (both sides must be even and non-zero)")]
    OddDimensions { width: u32, height: u32 },
    #[error("request was cancelled by the device")]
    Cancelled,
}

/// `frame_000042.jpg`
pub fn frame_file_name(sequence: u64, extension: &str) -> String {
    format!("frame_{sequence:06}.{extension}")
}

/// Interleave Y/U/V planes into Y,Cb,Cr triplets.
pub fn interleave_yuv420(frame: &RawFrame<'_>) -> Result<Vec<u8>, FrameError> {
    if !is_even_size(frame.width, frame.height) {
        return Err(FrameError::OddDimensions {
            width: frame.width,
            height: frame.height,
        });
    }
    let layout = PlaneLayout::new(frame.width, frame.height);
    check_plane("luma", layout.luma_len(), frame.y.len())?;
    check_plane("u", layout.chroma_len(), frame.u.len())?;
    check_plane("v", layout.chroma_len(), frame.v.len())?;

    let w = frame.width as usize;
    let h = frame.height as usize;
    let chroma_w = layout.chroma_width();
    let mut out = vec![0u8; w * h * 3];
    for row in 0..h {
        for col in 0..w {
            let chroma_index = (row / 2) * chroma_w + (col / 2);
            let offset = (row * w + col) * 3;
            out[offset] = frame.y[row * w + col];
            out[offset + 1] = frame.u[chroma_index];
            out[offset + 2] = frame.v[chroma_index];
        }
    }
    Ok(out)
}

/// 2x2 chroma subsampling needs both sides even.
pub fn is_even_size(width: u32, height: u32) -> bool {
    width > 0 && height > 0 && width % 2 == 0 && height % 2 == 0
}

fn check_plane(plane: &'static str, expected: usize, actual: usize) -> Result<(), FrameError> {
    if actual < expected {
        return Err(FrameError::PlaneSize {
            plane,
            expected,
            actual,
        });
    }
    Ok(())
}

#[derive(Clone)]
pub struct Transcoder {
    codec: Arc<dyn ImageCodec>,
    layout: PlaneLayout,
    quality: u8,
}

impl Transcoder {
    pub fn new(codec: Arc<dyn ImageCodec>, layout: PlaneLayout, quality: u8) -> Self {
        Self {
            codec,
            layout,
            quality,
        }
    }

    pub fn extension(&self) -> &'static str {
        self.codec.extension()
    }

    pub fn layout(&self) -> PlaneLayout {
        self.layout
    }

    /// Encode `frame` and write it as `frame_<sequence>.<ext>` under `dir`.
    pub fn transcode(
        &self,
        frame: &RawFrame<'_>,
        sequence: u64,
        dir: &Path,
    ) -> Result<PathBuf, FrameError> {
        if frame.width != self.layout.width || frame.height != self.layout.height {
            return Err(FrameError::Dimensions {
                expected_w: self.layout.width,
                expected_h: self.layout.height,
                actual_w: frame.width,
                actual_h: frame.height,
            });
        }
        let pixels = interleave_yuv420(frame)?;
        let encoded = self.codec.encode(
            frame.width,
            frame.height,
            ColorSpace::YCbCr,
            self.quality,
            &pixels,
        )?;

        let path = dir.join(frame_file_name(sequence, self.codec.extension()));
        write_atomically(&path, dir, &encoded)?;
        Ok(path)
    }
}

fn write_atomically(path: &Path, dir: &Path, bytes: &[u8]) -> Result<(), FrameError> {
    let io_err = |source| FrameError::Io {
        path: path.to_path_buf(),
        source,
    };
    // Dropping the temp file on any early return removes it.
    let mut tmp = tempfile::Builder::new()
        .prefix(".frame_")
        .suffix(".partial")
        .tempfile_in(dir)
        .map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.flush().map_err(io_err)?;
    tmp.persist(path).map_err(|err| io_err(err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JpegCodec;

    struct FailingCodec;

    impl ImageCodec for FailingCodec {
        fn extension(&self) -> &'static str {
            "jpg"
        }

        fn encode(
            &self,
            _width: u32,
            _height: u32,
            _color_space: ColorSpace,
            _quality: u8,
            _pixels: &[u8],
        ) -> Result<Vec<u8>, CodecError> {
            Err(CodecError::Encode("synthetic".into()))
        }
    }

    fn planes(width: usize, height: usize) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let y = (0..width * height).map(|i| i as u8).collect();
        let chroma = (width / 2) * (height / 2);
        let u = (0..chroma).map(|i| 100u8.wrapping_add(i as u8)).collect();
        let v = (0..chroma).map(|i| 200u8.wrapping_add(i as u8)).collect();
        (y, u, v)
    }

    #[test]
    fn chroma_follows_two_by_two_blocks() -> anyhow::Result<()> {
        let (y, u, v) = planes(4, 4);
        let frame = RawFrame {
            width: 4,
            height: 4,
            y: &y,
            u: &u,
            v: &v,
        };
        let out = interleave_yuv420(&frame)?;
        assert_eq!(out.len(), 48);
        for row in 0..4 {
            for col in 0..4 {
                let px = (row * 4 + col) * 3;
                let chroma_index = (row / 2) * 2 + (col / 2);
                assert_eq!(out[px], y[row * 4 + col], "luma at {row},{col}");
                assert_eq!(out[px + 1], u[chroma_index], "cb at {row},{col}");
                assert_eq!(out[px + 2], v[chroma_index], "cr at {row},{col}");
            }
        }
        Ok(())
    }

    #[test]
    fn short_chroma_plane_is_rejected() {
        let (y, u, _) = planes(4, 4);
        let frame = RawFrame {
            width: 4,
            height: 4,
            y: &y,
            u: &u,
            v: &[0u8; 3],
        };
        assert!(matches!(
            interleave_yuv420(&frame),
            Err(FrameError::PlaneSize { plane: "v", .. })
        ));
    }

    #[test]
    fn same_frame_encodes_to_identical_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (y, u, v) = planes(16, 16);
        let frame = RawFrame {
            width: 16,
            height: 16,
            y: &y,
            u: &u,
            v: &v,
        };
        let transcoder = Transcoder::new(
            Arc::new(JpegCodec),
            PlaneLayout::new(16, 16),
            DEFAULT_JPEG_QUALITY,
        );
        let first = transcoder.transcode(&frame, 0, dir.path())?;
        let second = transcoder.transcode(&frame, 1, dir.path())?;
        assert_eq!(first.file_name().unwrap(), "frame_000000.jpg");
        assert_eq!(second.file_name().unwrap(), "frame_000001.jpg");
        assert_eq!(std::fs::read(&first)?, std::fs::read(&second)?);
        Ok(())
    }

    #[test]
    fn failed_encode_leaves_no_partial_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (y, u, v) = planes(4, 4);
        let frame = RawFrame {
            width: 4,
            height: 4,
            y: &y,
            u: &u,
            v: &v,
        };
        let good = Transcoder::new(Arc::new(JpegCodec), PlaneLayout::new(4, 4), 90);
        let prior = good.transcode(&frame, 0, dir.path())?;
        let prior_bytes = std::fs::read(&prior)?;

        let bad = Transcoder::new(Arc::new(FailingCodec), PlaneLayout::new(4, 4), 90);
        assert!(matches!(
            bad.transcode(&frame, 1, dir.path()),
            Err(FrameError::Encode(_))
        ));

        let names: Vec<String> = std::fs::read_dir(dir.path())?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["frame_000000.jpg".to_string()]);
        assert_eq!(std::fs::read(&prior)?, prior_bytes);
        Ok(())
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let (y, u, v) = planes(4, 4);
        let frame = RawFrame {
            width: 4,
            height: 4,
            y: &y,
            u: &u,
            v: &v,
        };
        let transcoder = Transcoder::new(Arc::new(JpegCodec), PlaneLayout::new(4, 4), 90);
        let result = transcoder.transcode(&frame, 0, Path::new("/nonexistent/frames"));
        assert!(matches!(result, Err(FrameError::Io { .. })));
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let (y, u, v) = planes(4, 4);
        let frame = RawFrame {
            width: 4,
            height: 4,
            y: &y,
            u: &u,
            v: &v,
        };
        let transcoder = Transcoder::new(Arc::new(JpegCodec), PlaneLayout::new(8, 8), 90);
        assert!(matches!(
            transcoder.transcode(&frame, 0, Path::new(".")),
            Err(FrameError::Dimensions { .. })
        ));
    }

    #[test]
    fn odd_sizes_are_rejected_without_writing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let y = [16u8; 25];
        let chroma = [128u8; 4];
        let frame = RawFrame {
            width: 5,
            height: 5,
            y: &y,
            u: &chroma,
            v: &chroma,
        };
        let transcoder = Transcoder::new(Arc::new(JpegCodec), PlaneLayout::new(5, 5), 90);
        assert!(matches!(
            transcoder.transcode(&frame, 0, dir.path()),
            Err(FrameError::OddDimensions {
                width: 5,
                height: 5
            })
        ));
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);

        let (y, u, v) = planes(4, 4);
        let narrow = RawFrame {
            width: 3,
            height: 4,
            y: &y,
            u: &u,
            v: &v,
        };
        assert!(matches!(
            interleave_yuv420(&narrow),
            Err(FrameError::OddDimensions { .. })
        ));
        Ok(())
    }

    #[test]
    fn file_names_are_zero_padded() {
        assert_eq!(frame_file_name(0, "jpg"), "frame_000000.jpg");
        assert_eq!(frame_file_name(119, "jpg"), "frame_000119.jpg");
        assert_eq!(frame_file_name(1_234_567, "jpg"), "frame_1234567.jpg");
    }
}
