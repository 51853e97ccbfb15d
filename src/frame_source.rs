//! Frame Source Module
//!
//! Opens one video with the ffmpeg-next crate and hands out RGB frames,
//! either sequentially or by timecode. All decode state lives in
//! [`FrameSource`] and is released when it is dropped.

use ffmpeg_next as ffmpeg;
use ffmpeg::format::{context::Input, input, Pixel};
use ffmpeg::media::Type;
use ffmpeg::software::scaling::{Context as ScalingContext, flag::Flags};
use ffmpeg::util::frame::video::Video;
use ffmpeg::Packet;
use image::{ImageBuffer, RgbImage};
use log::debug;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::timecode::Timecode;

/// Frame index that `seconds` lands on, clamped to the decodable range.
///
/// `frame_count == 0` means the length is unknown and only the lower bound
/// is applied.
pub fn frame_index_for(seconds: f64, fps: f64, frame_count: u64) -> u64 {
    let index = (seconds * fps).round().max(0.0) as u64;
    if frame_count == 0 {
        index
    } else {
        index.min(frame_count - 1)
    }
}

/// An open video and its decoder.
pub struct FrameSource {
    path: PathBuf,
    input: Input,
    decoder: ffmpeg::decoder::Video,
    scaler: ScalingContext,
    stream_index: usize,
    time_base: f64,
    start_pts: i64,
    frame_count: u64,
    fps: f64,
}

impl FrameSource {
    /// Acquires a decode handle for `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::MissingFile(path.to_path_buf()));
        }
        ffmpeg::init().map_err(|e| Error::decode(path, format!("failed to initialize FFmpeg: {e}")))?;

        let input = input(path).map_err(|e| Error::decode(path, format!("failed to open input: {e}")))?;
        let stream = input
            .streams()
            .best(Type::Video)
            .ok_or_else(|| Error::decode(path, "could not find video stream"))?;
        let stream_index = stream.index();
        let time_base = f64::from(stream.time_base());
        let start_pts = match stream.start_time() {
            ffmpeg::ffi::AV_NOPTS_VALUE => 0,
            start => start,
        };

        let avg_rate = stream.avg_frame_rate();
        let rate = if avg_rate.numerator() > 0 && avg_rate.denominator() > 0 {
            avg_rate
        } else {
            stream.rate()
        };
        if rate.numerator() <= 0 || rate.denominator() <= 0 {
            return Err(Error::decode(path, "could not determine frame rate"));
        }
        let fps = f64::from(rate);

        // Containers that do not record a frame count get an estimate from the duration.
        let frame_count = match stream.frames() {
            n if n > 0 => n as u64,
            _ if input.duration() > 0 => {
                let duration_secs = input.duration() as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE);
                (duration_secs * fps).round() as u64
            }
            _ => 0,
        };

        let context_decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| Error::decode(path, format!("failed to create decoder context: {e}")))?;
        let decoder = context_decoder
            .decoder()
            .video()
            .map_err(|e| Error::decode(path, format!("failed to create video decoder: {e}")))?;

        let scaler = ScalingContext::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            Flags::BILINEAR,
        )
        .map_err(|e| Error::decode(path, format!("failed to create scaler: {e}")))?;

        debug!(
            target: "frame_source",
            "Opened {:?}: {} frames at {:.3} fps",
            path, frame_count, fps
        );

        Ok(FrameSource {
            path: path.to_path_buf(),
            input,
            decoder,
            scaler,
            stream_index,
            time_base,
            start_pts,
            frame_count,
            fps,
        })
    }

    /// Number of frames in the video stream; 0 when it cannot be determined.
    ///
    /// This can be an estimate for variable frame rate (VFR) videos.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Consumes the source into a lazy sequence of `(index, frame)` pairs.
    ///
    /// Indices start at 1 and advance by one. The sequence can be walked
    /// exactly once; the decode handle is released when it is dropped.
    pub fn iterate(self) -> Frames {
        Frames {
            source: self,
            next_index: 1,
            eof_sent: false,
            exhausted: false,
        }
    }

    /// Seeks to the frame nearest to `timecode` and decodes it.
    ///
    /// Returns the zero-based index of the frame that was read. Timecodes
    /// past the end of the video land on the last decodable frame.
    pub fn frame_at(&mut self, timecode: Timecode) -> Result<(u64, RgbImage)> {
        let target = frame_index_for(timecode.as_secs_f64(), self.fps, self.frame_count);
        let target_secs = target as f64 / self.fps;
        let start_secs = self.start_pts as f64 * self.time_base;
        let position = ((target_secs + start_secs) * f64::from(ffmpeg::ffi::AV_TIME_BASE)) as i64;

        self.input
            .seek(position, ..position)
            .map_err(|e| Error::decode(&self.path, format!("seek to {timecode} failed: {e}")))?;
        // Flushing also re-arms a decoder that has already seen EOF.
        self.decoder.flush();

        let mut last = None;
        loop {
            while let Some(decoded) = self.receive() {
                let index = self.index_of(&decoded).unwrap_or(target);
                if index >= target {
                    let image = self.to_image(&decoded)?;
                    return Ok((index, image));
                }
                last = Some((index, decoded));
            }
            if !self.feed()? {
                // The stream ended before the target; use the last frame we saw.
                while let Some(decoded) = self.receive() {
                    let index = self.index_of(&decoded).unwrap_or(target);
                    last = Some((index, decoded));
                }
                return match last {
                    Some((index, decoded)) => Ok((index, self.to_image(&decoded)?)),
                    None => Err(Error::decode(&self.path, format!("no frame decoded at {timecode}"))),
                };
            }
        }
    }

    /// Zero-based frame index of a decoded frame, from its timestamp.
    fn index_of(&self, decoded: &Video) -> Option<u64> {
        let pts = decoded.timestamp().or_else(|| decoded.pts())?;
        let seconds = (pts - self.start_pts) as f64 * self.time_base;
        Some((seconds * self.fps).round().max(0.0) as u64)
    }

    fn receive(&mut self) -> Option<Video> {
        let mut decoded = Video::empty();
        self.decoder.receive_frame(&mut decoded).ok().map(|_| decoded)
    }

    /// Sends the next video packet to the decoder. Returns `false` once the
    /// container is exhausted and EOF has been signalled.
    fn feed(&mut self) -> Result<bool> {
        let mut packet = Packet::empty();
        loop {
            match packet.read(&mut self.input) {
                Ok(()) if packet.stream() == self.stream_index => {
                    self.decoder
                        .send_packet(&packet)
                        .map_err(|e| Error::decode(&self.path, format!("failed to send packet to decoder: {e}")))?;
                    return Ok(true);
                }
                Ok(()) => continue,
                Err(ffmpeg::Error::Eof) => {
                    self.decoder
                        .send_eof()
                        .map_err(|e| Error::decode(&self.path, format!("failed to flush decoder: {e}")))?;
                    return Ok(false);
                }
                Err(e) => return Err(Error::decode(&self.path, format!("failed to read packet: {e}"))),
            }
        }
    }

    /// Converts a decoded frame into a tightly packed RGB image.
    fn to_image(&mut self, decoded: &Video) -> Result<RgbImage> {
        let mut rgb_frame = Video::empty();
        self.scaler
            .run(decoded, &mut rgb_frame)
            .map_err(|e| Error::decode(&self.path, format!("scaler failed: {e}")))?;

        let frame_data = rgb_frame.data(0);
        let width = rgb_frame.width() as usize;
        let height = rgb_frame.height() as usize;
        let stride = rgb_frame.stride(0);

        if stride == 0 {
            return Err(Error::decode(&self.path, "invalid frame stride"));
        }

        let mut pixels = Vec::with_capacity(width * height * 3);
        for y in 0..height {
            let start_index = y * stride;
            let end_index = start_index + (width * 3);
            if end_index > frame_data.len() {
                return Err(Error::decode(&self.path, "frame data is smaller than expected"));
            }
            pixels.extend_from_slice(&frame_data[start_index..end_index]);
        }

        ImageBuffer::from_vec(width as u32, height as u32, pixels)
            .ok_or_else(|| Error::decode(&self.path, "failed to create image buffer from frame data"))
    }
}

/// Sequential frames of one video. Exhausted once; never restarts.
pub struct Frames {
    source: FrameSource,
    next_index: u64,
    eof_sent: bool,
    exhausted: bool,
}

impl Iterator for Frames {
    type Item = Result<(u64, RgbImage)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        loop {
            if let Some(decoded) = self.source.receive() {
                let index = self.next_index;
                self.next_index += 1;
                return match self.source.to_image(&decoded) {
                    Ok(image) => Some(Ok((index, image))),
                    Err(e) => {
                        self.exhausted = true;
                        Some(Err(e))
                    }
                };
            }
            if self.eof_sent {
                self.exhausted = true;
                debug!(
                    target: "frame_source",
                    "Finished decoding {} frames from {:?}",
                    self.next_index - 1,
                    self.source.path
                );
                return None;
            }
            match self.source.feed() {
                Ok(true) => {}
                Ok(false) => self.eof_sent = true,
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_rounds_to_nearest_frame() {
        assert_eq!(frame_index_for(10.0, 24.0, 1000), 240);
        assert_eq!(frame_index_for(10.02, 24.0, 1000), 240);
        assert_eq!(frame_index_for(10.03, 24.0, 1000), 241);
        assert_eq!(frame_index_for(0.0, 29.97, 1000), 0);
    }

    #[test]
    fn index_past_the_end_is_the_last_frame() {
        // 100 frames at 25 fps last four seconds.
        assert_eq!(frame_index_for(4.0, 25.0, 100), 99);
        assert_eq!(frame_index_for(3600.0, 25.0, 100), 99);
        assert_eq!(frame_index_for(3.96, 25.0, 100), 99);
    }

    #[test]
    fn unknown_length_only_clamps_below() {
        assert_eq!(frame_index_for(-1.0, 25.0, 0), 0);
        assert_eq!(frame_index_for(3600.0, 25.0, 0), 90_000);
    }

    #[test]
    fn missing_video_is_reported_as_missing() {
        let result = FrameSource::open(Path::new("/definitely/not/here.mp4"));
        assert!(matches!(result, Err(Error::MissingFile(_))));
    }
}
