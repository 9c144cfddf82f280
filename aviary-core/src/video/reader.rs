//! reader — frame-accurate access to a recording through FFmpeg
//!
//! Seeks to the nearest keyframe at or before the requested frame, then
//! decodes forward until the frame whose timestamp reaches the target.
//! Every MJPEG frame is a keyframe, so for capture segments the forward
//! decode is a single frame.

use std::path::Path;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, format, frame, media, software::scaling, util::rational::Rational};
use tracing::debug;

use super::RgbFrame;
use crate::error::{CurationError, Result};

/// Bilinear; source and target sizes are equal.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;
const MICROS_PER_SECOND: i64 = 1_000_000;

pub(crate) struct FfmpegReader {
    ictx: format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::decoder::Video,
    to_rgb: scaling::Context,
    width: u32,
    height: u32,
    frame_count: usize,
    time_base: Rational,
    frame_rate: Rational,
    start_pts: i64,
}

impl FfmpegReader {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let open_err = |e: &dyn std::fmt::Display| CurationError::video_open(path, e);

        ffmpeg::init().map_err(|e| open_err(&e))?;
        let ictx = format::input(&path).map_err(|e| open_err(&e))?;

        let stream = ictx
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| open_err(&"no video stream found"))?;
        let stream_index = stream.index();
        let time_base = stream.time_base();
        let frame_rate = stream.avg_frame_rate();
        let start_pts = stream.start_time().max(0);
        let frame_count = estimate_frame_count(&stream);

        let decoder_ctx = codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| open_err(&e))?;
        let decoder = decoder_ctx.decoder().video().map_err(|e| open_err(&e))?;

        let width = decoder.width();
        let height = decoder.height();
        let to_rgb = scaling::Context::get(
            decoder.format(),
            width,
            height,
            format::Pixel::RGB24,
            width,
            height,
            SCALE_FLAGS,
        )
        .map_err(|e| open_err(&e))?;

        debug!(width, height, frame_count, ?frame_rate, "opened decoder");

        Ok(Self {
            ictx,
            stream_index,
            decoder,
            to_rgb,
            width,
            height,
            frame_count,
            time_base,
            frame_rate,
            start_pts,
        })
    }

    /// Presentation timestamp (stream time base) of frame `index`.
    fn target_pts(&self, index: usize) -> i64 {
        let num = i64::from(self.frame_rate.denominator()) * i64::from(self.time_base.denominator());
        let den = i64::from(self.frame_rate.numerator()) * i64::from(self.time_base.numerator());
        self.start_pts + (index as i64 * num) / den.max(1)
    }

    fn seek_micros(&self, index: usize) -> i64 {
        let fps_num = i64::from(self.frame_rate.numerator()).max(1);
        let fps_den = i64::from(self.frame_rate.denominator());
        index as i64 * MICROS_PER_SECOND * fps_den / fps_num
    }

    fn to_rgb_frame(&mut self, decoded: &frame::Video, index: usize) -> Result<RgbFrame> {
        let mut rgb = frame::Video::empty();
        self.to_rgb
            .run(decoded, &mut rgb)
            .map_err(|e| CurationError::decode(index, e))?;

        // Compact to a plain Vec<u8> (remove stride padding if any)
        let stride = rgb.stride(0);
        let raw = rgb.data(0);
        let row_len = self.width as usize * 3;
        let mut data = Vec::with_capacity(row_len * self.height as usize);
        for row in 0..self.height as usize {
            let start = row * stride;
            data.extend_from_slice(&raw[start..start + row_len]);
        }

        Ok(RgbFrame {
            data,
            width: self.width,
            height: self.height,
            index,
        })
    }

    pub(crate) fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub(crate) fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Decode frame `index`; the caller has already bounds-checked it.
    pub(crate) fn read_frame(&mut self, index: usize) -> Result<RgbFrame> {
        let target = self.target_pts(index);
        let micros = self.seek_micros(index);
        self.ictx
            .seek(micros, ..micros)
            .map_err(|e| CurationError::decode(index, e))?;
        self.decoder.flush();
        debug!(index, target, "seeked; decoding forward");

        let mut decoded = frame::Video::empty();
        let mut found = None;
        for (stream, packet) in self.ictx.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            self.decoder
                .send_packet(&packet)
                .map_err(|e| CurationError::decode(index, e))?;
            while self.decoder.receive_frame(&mut decoded).is_ok() {
                let pts = decoded.timestamp().or(decoded.pts()).unwrap_or(target);
                if pts >= target {
                    found = Some(decoded.clone());
                    break;
                }
            }
            if found.is_some() {
                break;
            }
        }

        if found.is_none() {
            // Frames still buffered in the decoder at end of stream.
            self.decoder.send_eof().ok();
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                found = Some(decoded.clone());
            }
        }

        let decoded =
            found.ok_or_else(|| CurationError::decode(index, "end of stream before frame"))?;
        self.to_rgb_frame(&decoded, index)
    }
}

/// Number of frames declared by the container; falls back to
/// duration × fps when the muxer does not record it.
fn estimate_frame_count(stream: &format::stream::Stream<'_>) -> usize {
    let nb = stream.frames();
    if nb > 0 {
        return nb as usize;
    }
    let dur = stream.duration();
    let tb = stream.time_base();
    let fps = stream.avg_frame_rate();
    if dur > 0 && tb.denominator() > 0 && fps.numerator() > 0 && fps.denominator() > 0 {
        let seconds = dur as f64 * f64::from(tb.numerator()) / f64::from(tb.denominator());
        let fps_f = f64::from(fps.numerator()) / f64::from(fps.denominator());
        return (seconds * fps_f).round() as usize;
    }
    0
}
