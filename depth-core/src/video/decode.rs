//! Single seek-aware decoder bound to one video file (spec §4.2).
//!
//! Defaults to forward streaming: a request near the last frame we handed
//! out just advances the existing packet cursor. A request that jumps far
//! ahead or backwards falls back to a seek toward the nearest preceding
//! keyframe, then resumes forward decoding until the target time is
//! reached (or `MAX_SCAN_FRAMES` is exhausted, to bound worst-case latency
//! on a badly keyframed file).

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use ffmpeg::format::Pixel::RGB24;
use ffmpeg::media;
use ffmpeg::software::{scaling, scaling::flag::Flags};
use ffmpeg::util::frame::video::Video;
use ndarray::Array3;

use crate::error::{DepthError, Result};
use crate::video::meta::{FrameInfo, VideoMetadata};

pub const STREAM_WINDOW_MS: f64 = 1000.0;
pub const MAX_SCAN_FRAMES: u32 = 360;

pub struct Decoder {
    source: PathBuf,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    time_base: (i32, i32),
    codec_ctx: ffmpeg::decoder::Video,
    sws_ctx: SendableSwsCtx,
    frame: Video,
    rgb_frame: Video,
    last_frame_time_ms: Option<f64>,
}

/// `Input` and `decoder::Video` wrap raw FFmpeg pointers and aren't `Send`
/// by default. Each `Decoder` is only ever touched from inside the single
/// `spawn_blocking` closure that currently holds it out of the pool's free
/// list, so handing it to a different OS thread between calls is sound.
unsafe impl Send for Decoder {}

impl Decoder {
    pub fn open(source: &Path) -> Result<Self> {
        let input = ffmpeg::format::input(&source)
            .map_err(|e| DepthError::Decode(format!("opening {}: {e}", source.display())))?;
        let stream = input
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| DepthError::Decode("no video stream found".into()))?;
        let stream_index = stream.index();
        let time_base = (stream.time_base().numerator(), stream.time_base().denominator());
        let parameters = stream.parameters();
        let codec_ctx = ffmpeg::codec::Context::from_parameters(parameters)
            .map_err(|e| DepthError::Decode(e.to_string()))?
            .decoder()
            .video()
            .map_err(|e| DepthError::Decode(e.to_string()))?;

        let (w, h) = (codec_ctx.width(), codec_ctx.height());
        let sws_ctx = scaling::Context::get(codec_ctx.format(), w, h, RGB24, w, h, Flags::BILINEAR)
            .map_err(|e| DepthError::Decode(e.to_string()))?;

        Ok(Decoder {
            source: source.to_owned(),
            input,
            stream_index,
            time_base,
            codec_ctx,
            sws_ctx: SendableSwsCtx(sws_ctx),
            frame: Video::empty(),
            rgb_frame: Video::empty(),
            last_frame_time_ms: None,
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn metadata(&self) -> VideoMetadata {
        let stream = self.input.stream(self.stream_index).expect("stream index is stable");
        let rate = stream.avg_frame_rate();
        let fps = if rate.denominator() != 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            30.0
        };
        let tb_num = self.time_base.0 as f64;
        let tb_den = self.time_base.1 as f64;
        let duration_ms = if stream.duration() > 0 {
            Some(stream.duration() as f64 * tb_num / tb_den * 1000.0)
        } else {
            None
        };
        let frames = if stream.frames() > 0 {
            Some(stream.frames() as u64)
        } else {
            None
        };
        VideoMetadata {
            width: self.codec_ctx.width(),
            height: self.codec_ctx.height(),
            frames,
            fps,
            duration_ms,
        }
    }

    /// Returns `true` if a request for `time_ms` can be served by advancing
    /// the current packet cursor rather than seeking.
    pub fn should_stream_forward(&self, time_ms: f64) -> bool {
        match self.last_frame_time_ms {
            None => false,
            Some(last) => {
                let delta = time_ms - last;
                (0.0..=STREAM_WINDOW_MS).contains(&delta)
            }
        }
    }

    pub fn decode_at(&mut self, time_ms: f64) -> Result<(Array3<u8>, FrameInfo)> {
        let time_ms = time_ms.max(0.0);
        if !self.should_stream_forward(time_ms) {
            self.seek_near(time_ms)?;
        }
        self.advance_to(time_ms)
    }

    fn seek_near(&mut self, time_ms: f64) -> Result<()> {
        let target = (time_ms / 1000.0 * f64::from(ffmpeg::ffi::AV_TIME_BASE)) as i64;
        self.input
            .seek(target, ..target)
            .map_err(|e| DepthError::Decode(format!("seek to {time_ms}ms: {e}")))?;
        self.last_frame_time_ms = None;
        Ok(())
    }

    fn advance_to(&mut self, time_ms: f64) -> Result<(Array3<u8>, FrameInfo)> {
        let mut frames_examined: u32 = 0;
        loop {
            let mut packets = self.input.packets();
            let (stream, packet) = loop {
                match packets.next() {
                    Some((stream, packet)) if stream.index() == self.stream_index => {
                        break (stream, packet)
                    }
                    Some(_) => continue,
                    None => return Err(DepthError::EndOfStream),
                }
            };
            drop(stream);
            drop(packets);

            self.codec_ctx
                .send_packet(&packet)
                .map_err(|e| DepthError::Decode(e.to_string()))?;

            while self.codec_ctx.receive_frame(&mut self.frame).is_ok() {
                frames_examined += 1;
                let info = self.frame_info(frames_examined, time_ms);
                let actual_time = if info.time_ms < 0.0 { time_ms } else { info.time_ms };
                self.last_frame_time_ms = Some(actual_time);

                if info.time_ms < 0.0 || actual_time >= time_ms || frames_examined >= MAX_SCAN_FRAMES {
                    self.sws_ctx
                        .run(&self.frame, &mut self.rgb_frame)
                        .map_err(|e| DepthError::Decode(e.to_string()))?;
                    return Ok((self.rgb_to_array(), info));
                }
            }
        }
    }

    fn frame_info(&self, examined: u32, requested_ms: f64) -> FrameInfo {
        let pts = self.frame.timestamp();
        let time_ms = match pts {
            Some(pts) => pts as f64 * self.time_base.0 as f64 / self.time_base.1 as f64 * 1000.0,
            None => {
                let _ = examined;
                let _ = requested_ms;
                -1.0
            }
        };
        FrameInfo {
            time_ms,
            index: -1,
            pts,
            key_frame: self.frame.is_key(),
        }
    }

    fn rgb_to_array(&self) -> Array3<u8> {
        let width = self.rgb_frame.width() as usize;
        let height = self.rgb_frame.height() as usize;
        let stride = self.rgb_frame.stride(0);
        let data = self.rgb_frame.data(0);
        Array3::from_shape_fn((height, width, 3), |(y, x, c)| data[y * stride + x * 3 + c])
    }
}

/// Wraps `scaling::Context` to move it between threads; see the crate-level
/// note on `Decoder`'s `Send` impl for why this is sound here.
struct SendableSwsCtx(scaling::Context);

#[allow(clippy::non_send_fields_in_send_ty)]
unsafe impl Send for SendableSwsCtx {}

impl Deref for SendableSwsCtx {
    type Target = scaling::Context;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SendableSwsCtx {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
