//! video — random access to decoded frames of a recorded segment
//!
//! A `VideoSource` is opened once per selected file and answers two
//! questions: how many frames the file holds, and what frame `i` looks like
//! as packed RGB24.  Demuxing and decoding go through FFmpeg, so the capture
//! station's Motion-JPEG AVI files and any other container libav reads are
//! handled alike.
//!
//! Seeking is stateful on the underlying handle, so `get_frame` takes
//! `&mut self`: a session that wants to share a source across threads has to
//! wrap it in its own lock, and the seek + read pair can never interleave.

mod reader;
pub mod writer;

use std::path::{Path, PathBuf};

use image::RgbImage;
use tracing::{debug, info};

use self::reader::FfmpegReader;
use crate::error::{CurationError, Result};

/// A single decoded video frame in RGB24 format, along with its position in
/// the source stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbFrame {
    pub data: Vec<u8>, // packed RGB24, row-major
    pub width: u32,
    pub height: u32,
    pub index: usize,
}

impl RgbFrame {
    pub fn from_image(image: RgbImage, index: usize) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            index,
        }
    }

    /// Copy the frame into an `image` buffer for drawing or encoding.
    pub fn to_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.clone()).ok_or_else(|| {
            CurationError::decode(self.index, "pixel buffer does not match frame dimensions")
        })
    }
}

/// An open video file.  Dropping it closes the file.
pub struct VideoSource {
    path: PathBuf,
    frame_count: usize,
    reader: FfmpegReader,
}

impl std::fmt::Debug for VideoSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoSource")
            .field("path", &self.path)
            .field("frame_count", &self.frame_count)
            .finish_non_exhaustive()
    }
}

impl VideoSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = FfmpegReader::open(path)?;

        let frame_count = reader.frame_count();
        let (width, height) = reader.dimensions();
        info!(path = %path.display(), frame_count, width, height, "opened video");

        Ok(Self {
            path: path.to_path_buf(),
            frame_count,
            reader,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total number of frames; 0 for an empty recording.
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Frame size in pixels as `(width, height)`.
    pub fn dimensions(&self) -> (u32, u32) {
        self.reader.dimensions()
    }

    /// Seek to the 0-based frame `index` and decode it.
    pub fn get_frame(&mut self, index: i64) -> Result<RgbFrame> {
        let idx = self.check_index(index)?;
        debug!(index = idx, path = %self.path.display(), "decoding frame");
        self.reader.read_frame(idx)
    }

    fn check_index(&self, index: i64) -> Result<usize> {
        usize::try_from(index)
            .ok()
            .filter(|&i| i < self.frame_count)
            .ok_or(CurationError::FrameIndexOutOfRange {
                index,
                frame_count: self.frame_count,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use writer::SegmentWriter;

    fn gradient(width: u32, height: u32, seed: u8) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([
                (x * 8) as u8 ^ seed,
                (y * 8) as u8,
                seed.wrapping_mul(37),
            ])
        })
    }

    fn write_clip(dir: &Path, frames: u8) -> PathBuf {
        let path = dir.join("clip.avi");
        let mut writer = SegmentWriter::create(&path, 32, 24, 10).unwrap();
        for i in 0..frames {
            writer.write_frame(&gradient(32, 24, i * 40)).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    #[test]
    fn reports_frame_count_and_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let source = VideoSource::open(write_clip(dir.path(), 5)).unwrap();
        assert_eq!(source.frame_count(), 5);
        assert_eq!(source.dimensions(), (32, 24));
    }

    #[test]
    fn frames_are_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = VideoSource::open(write_clip(dir.path(), 4)).unwrap();
        for i in 0..4 {
            let a = source.get_frame(i).unwrap();
            // Interleave another seek so the second read really re-seeks.
            source.get_frame((i + 1) % 4).unwrap();
            let b = source.get_frame(i).unwrap();
            assert_eq!(a, b);
            assert_eq!((a.width, a.height), (32, 24));
            assert_eq!(a.data.len(), 32 * 24 * 3);
            assert_eq!(a.index, i as usize);
        }
    }

    #[test]
    fn seeking_lands_on_the_requested_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("solid.avi");
        let colors: Vec<[u8; 3]> = (0..6u8).map(|i| [i * 40, 100, 220 - i * 30]).collect();
        let mut writer = SegmentWriter::create(&path, 32, 32, 10).unwrap();
        for &c in &colors {
            writer.write_frame(&RgbImage::from_pixel(32, 32, Rgb(c))).unwrap();
        }
        writer.finish().unwrap();

        let mut source = VideoSource::open(&path).unwrap();
        assert_eq!(source.frame_count(), colors.len());
        // Backwards, so every read needs a real seek.
        for i in (0..colors.len()).rev() {
            let frame = source.get_frame(i as i64).unwrap();
            let image = frame.to_image().unwrap();
            let got = image.get_pixel(16, 16).0;
            for (g, want) in got.iter().zip(colors[i]) {
                assert!(g.abs_diff(want) <= 12, "frame {i}: got {got:?}, want {:?}", colors[i]);
            }
        }
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = VideoSource::open(write_clip(dir.path(), 3)).unwrap();
        for bad in [-1, 3, i64::MAX] {
            let err = source.get_frame(bad).unwrap_err();
            assert!(
                matches!(err, CurationError::FrameIndexOutOfRange { index, frame_count: 3 } if index == bad),
                "{err}"
            );
        }
    }

    #[test]
    fn missing_file_fails_to_open() {
        let err = VideoSource::open("/definitely/not/here.avi").unwrap_err();
        assert!(matches!(err, CurationError::VideoOpenError { .. }));
    }

    #[test]
    fn non_video_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.avi");
        std::fs::write(&path, b"this is not a video file at all").unwrap();
        let err = VideoSource::open(&path).unwrap_err();
        assert!(matches!(err, CurationError::VideoOpenError { .. }));
    }

    #[test]
    fn frame_converts_to_image() {
        let image = gradient(4, 3, 7);
        let frame = RgbFrame::from_image(image.clone(), 9);
        assert_eq!(frame.to_image().unwrap(), image);

        let broken = RgbFrame {
            data: vec![0; 5],
            width: 4,
            height: 3,
            index: 9,
        };
        assert!(matches!(
            broken.to_image(),
            Err(CurationError::DecodeError { index: 9, .. })
        ));
    }
}
