//! writer — record Motion-JPEG AVI segments through FFmpeg
//!
//! Produces the same files the capture station does: one MJPEG stream in an
//! AVI container at a fixed frame rate, named after the time recording
//! started.  Used by `aviary pack` and to build fixtures for tests.

use std::path::Path;

use anyhow::{ensure, Context};
use chrono::{Datelike, NaiveDateTime, Timelike};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, encoder, format, frame, software::scaling, util::rational::Rational};
use image::RgbImage;
use tracing::{debug, info};

/// Frame rate used by the capture station.
pub const CAPTURE_FPS: u32 = 10;
/// MJPEG quantiser scale (2 = best, 31 = worst), as in `ffmpeg -q:v`.
pub const DEFAULT_QSCALE: u32 = 3;

/// MJPEG wants full-range YUV.
const ENCODE_FORMAT: format::Pixel = format::Pixel::YUVJ420P;
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;
/// FFmpeg's `FF_QP2LAMBDA`.
const QP2LAMBDA: usize = 118;

/// File name of a capture segment started at `started`, e.g.
/// `7-3-2022 14-5-9.avi` (fields are not zero-padded).
pub fn segment_file_name(started: NaiveDateTime) -> String {
    format!(
        "{}-{}-{} {}-{}-{}.avi",
        started.day(),
        started.month(),
        started.year(),
        started.hour(),
        started.minute(),
        started.second()
    )
}

pub struct SegmentWriter {
    octx: format::context::Output,
    encoder: encoder::Video,
    to_yuv: scaling::Context,
    rgb_frame: frame::Video,
    yuv_frame: frame::Video,
    stream_index: usize,
    time_base: Rational,
    width: u32,
    height: u32,
    frames: i64,
}

impl SegmentWriter {
    pub fn create<P: AsRef<Path>>(
        path: P,
        width: u32,
        height: u32,
        fps: u32,
    ) -> anyhow::Result<Self> {
        Self::create_with_qscale(path, width, height, fps, DEFAULT_QSCALE)
    }

    pub fn create_with_qscale<P: AsRef<Path>>(
        path: P,
        width: u32,
        height: u32,
        fps: u32,
        qscale: u32,
    ) -> anyhow::Result<Self> {
        ensure!(width > 0 && height > 0, "frame size must be non-zero");
        ensure!(fps > 0, "frame rate must be non-zero");
        ensure!((2..=31).contains(&qscale), "qscale must be within 2..=31, got {qscale}");
        let path = path.as_ref();

        ffmpeg::init().context("failed to initialise FFmpeg")?;
        let mut octx = format::output(&path)
            .with_context(|| format!("could not create segment file {}", path.display()))?;
        let global_header = octx
            .format()
            .flags()
            .contains(format::flag::Flags::GLOBAL_HEADER);

        let codec = encoder::find(codec::Id::MJPEG).context("MJPEG encoder not found")?;
        let time_base = Rational::new(1, fps as i32);

        let mut stream = octx.add_stream(codec)?;
        let mut builder = codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()?;
        builder.set_width(width);
        builder.set_height(height);
        builder.set_format(ENCODE_FORMAT);
        builder.set_time_base(time_base);
        builder.set_frame_rate(Some(Rational::new(fps as i32, 1)));
        let mut flags = codec::flag::Flags::QSCALE;
        if global_header {
            flags |= codec::flag::Flags::GLOBAL_HEADER;
        }
        builder.set_flags(flags);
        builder.set_quality(qscale as usize * QP2LAMBDA);

        let encoder = builder
            .open_as(codec)
            .context("failed to open MJPEG encoder")?;
        stream.set_parameters(&encoder);
        stream.set_time_base(time_base);
        let stream_index = stream.index();

        let to_yuv = scaling::Context::get(
            format::Pixel::RGB24,
            width,
            height,
            ENCODE_FORMAT,
            width,
            height,
            SCALE_FLAGS,
        )
        .context("failed to create to-YUV scaler")?;

        octx.write_header()
            .with_context(|| format!("failed to write header of {}", path.display()))?;
        info!(path = %path.display(), width, height, fps, qscale, "recording segment");

        Ok(Self {
            octx,
            encoder,
            to_yuv,
            rgb_frame: frame::Video::new(format::Pixel::RGB24, width, height),
            yuv_frame: frame::Video::empty(),
            stream_index,
            time_base,
            width,
            height,
            frames: 0,
        })
    }

    pub fn frames_written(&self) -> usize {
        self.frames as usize
    }

    /// Encode one frame.  Every frame must have the segment's dimensions.
    pub fn write_frame(&mut self, image: &RgbImage) -> anyhow::Result<()> {
        ensure!(
            image.dimensions() == (self.width, self.height),
            "frame is {}x{}, segment is {}x{}",
            image.width(),
            image.height(),
            self.width,
            self.height
        );

        let row_len = self.width as usize * 3;
        let stride = self.rgb_frame.stride(0);
        let plane = self.rgb_frame.data_mut(0);
        for (row, pixels) in image.as_raw().chunks_exact(row_len).enumerate() {
            let start = row * stride;
            plane[start..start + row_len].copy_from_slice(pixels);
        }

        self.to_yuv
            .run(&self.rgb_frame, &mut self.yuv_frame)
            .context("to-YUV scaling failed")?;
        self.yuv_frame.set_pts(Some(self.frames));
        self.encoder
            .send_frame(&self.yuv_frame)
            .context("encoder send_frame")?;
        self.drain()?;
        self.frames += 1;
        debug!(frame = self.frames, "encoded frame");
        Ok(())
    }

    /// Flush the encoder and write the container trailer.
    pub fn finish(mut self) -> anyhow::Result<()> {
        self.encoder.send_eof().context("encoder send_eof")?;
        self.drain()?;
        self.octx
            .write_trailer()
            .context("failed to write segment trailer")?;
        info!(frames = self.frames, "segment finished");
        Ok(())
    }

    /// Move every pending packet from the encoder to the muxer.
    fn drain(&mut self) -> anyhow::Result<()> {
        let stream_time_base = self
            .octx
            .stream(self.stream_index)
            .context("output stream missing")?
            .time_base();
        let mut encoded = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut encoded).is_ok() {
            encoded.set_stream(self.stream_index);
            encoded.rescale_ts(self.time_base, stream_time_base);
            encoded
                .write_interleaved(&mut self.octx)
                .context("failed to write encoded packet")?;
        }
        Ok(())
    }
}
