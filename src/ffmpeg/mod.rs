//! FFmpeg-backed media source and record sink (`ffmpeg` feature).
//!
//! `FfmpegSource` decodes any container/codec FFmpeg understands into the
//! engine's fixed output formats: UYVY 4:2:2 video at the channel geometry
//! and 48 kHz signed 16-bit audio. A single audio stream is resampled to one
//! interleaved block across all output channels; multiple audio streams are
//! delivered as mono planes for the producer to interleave.
//!
//! `FfmpegRecordSink` is the matching encode side for ingest ports: MPEG-2
//! video plus PCM audio muxed into MXF, D-10 profile for the SD formats.

use std::sync::Once;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec;
use ffmpeg_next::format::{self, sample, Pixel, Sample};
use ffmpeg_next::frame;
use ffmpeg_next::media;
use ffmpeg_next::software::resampling;
use ffmpeg_next::software::scaling;
use ffmpeg_next::util::channel_layout::ChannelLayout;
use ffmpeg_next::util::rational::Rational;
use ffmpeg_next::Dictionary;
use ffmpeg_next::Packet;
use log::{debug, info, warn};

use crate::core::format::{
    ChannelFormat, RecordContainer, AUDIO_BYTES_PER_SAMPLE, AUDIO_CHANNELS, AUDIO_FRAME_BYTES,
    AUDIO_SAMPLE_RATE,
};
use crate::core::source::{DecodedUnit, MediaInfo, MediaSource, SeekDirection, SourceFactory};
use crate::error::{LoadError, RecordError, SourceError};

static FFMPEG_INIT: Once = Once::new();

fn initialize_ffmpeg() {
    FFMPEG_INIT.call_once(|| {
        if let Err(e) = ffmpeg::init() {
            warn!("ffmpeg initialization failed: {e}");
        }
    });
}

const OUTPUT_SAMPLE: Sample = Sample::I16(sample::Type::Packed);

/// One audio stream with its decoder and resampler. With a single lane the
/// resampler emits interleaved blocks across all output channels; with
/// several lanes each resamples to mono and the producer interleaves.
struct AudioLane {
    stream_index: usize,
    substream: usize,
    decoder: ffmpeg::decoder::Audio,
    resampler: resampling::Context,
}

pub struct FfmpegSource {
    input: format::context::Input,
    info: MediaInfo,
    format: ChannelFormat,
    video_stream: usize,
    video_time_base: f64,
    video_decoder: ffmpeg::decoder::Video,
    /// Built on the first decoded frame, once the real source geometry and
    /// pixel format are known.
    scaler: Option<scaling::Context>,
    audio_lanes: Vec<AudioLane>,
    pending: Vec<DecodedUnit>,
    overlay: Option<u32>,
    draining: bool,
}

impl FfmpegSource {
    pub fn open(path: &str, channel_format: ChannelFormat) -> Result<Self, LoadError> {
        initialize_ffmpeg();

        let input = format::input(&path).map_err(|e| LoadError::OpenFailed {
            path: path.to_string(),
            reason: e.to_string(),
        })?;

        let video = input
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| LoadError::NoStreamInfo {
                path: path.to_string(),
            })?;
        let video_stream = video.index();
        let video_time_base = f64::from(video.time_base());

        let avg = video.avg_frame_rate();
        let detected_fps = if avg.denominator() != 0 {
            avg.numerator() as f64 / avg.denominator() as f64
        } else {
            channel_format.fps()
        };

        // Container timecode, falling back to the video stream's own metadata
        let start_timecode = input
            .metadata()
            .get("timecode")
            .or_else(|| video.metadata().get("timecode"))
            .map(|tc| tc.to_string());

        let duration_ms = if input.duration() > 0 {
            input.duration() / 1000
        } else {
            0
        };

        let video_decoder = codec::context::Context::from_parameters(video.parameters())
            .map_err(|e| LoadError::CodecInit(e.to_string()))?
            .decoder()
            .video()
            .map_err(|e| LoadError::CodecInit(e.to_string()))?;

        let audio_indices: Vec<usize> = input
            .streams()
            .filter(|s| s.parameters().medium() == media::Type::Audio)
            .map(|s| s.index())
            .collect();
        let lanes = audio_indices.len();

        let mut audio_lanes = Vec::with_capacity(lanes);
        for (substream, index) in audio_indices.into_iter().enumerate() {
            let stream = input
                .stream(index)
                .ok_or_else(|| LoadError::NoStreamInfo {
                    path: path.to_string(),
                })?;
            let decoder = codec::context::Context::from_parameters(stream.parameters())
                .map_err(|e| LoadError::CodecInit(e.to_string()))?
                .decoder()
                .audio()
                .map_err(|e| LoadError::CodecInit(e.to_string()))?;
            if decoder.rate() != AUDIO_SAMPLE_RATE {
                return Err(LoadError::UnsupportedSampleRate(decoder.rate()));
            }
            let target_layout = if lanes > 1 {
                ChannelLayout::MONO
            } else {
                ChannelLayout::default(AUDIO_CHANNELS as i32)
            };
            let resampler = resampling::Context::get(
                decoder.format(),
                decoder.channel_layout(),
                decoder.rate(),
                OUTPUT_SAMPLE,
                target_layout,
                AUDIO_SAMPLE_RATE,
            )
            .map_err(|e| LoadError::CodecInit(e.to_string()))?;
            audio_lanes.push(AudioLane {
                stream_index: index,
                substream,
                decoder,
                resampler,
            });
        }

        info!(
            "opened '{path}': {duration_ms}ms, {detected_fps:.3} fps, {} audio substream(s)",
            lanes.max(1)
        );

        Ok(Self {
            input,
            info: MediaInfo {
                duration_ms,
                detected_fps,
                start_timecode,
                audio_substreams: lanes.max(1),
            },
            format: channel_format,
            video_stream,
            video_time_base,
            video_decoder,
            scaler: None,
            audio_lanes,
            pending: Vec::new(),
            overlay: None,
            draining: false,
        })
    }

    fn drain_video(&mut self) -> Result<(), SourceError> {
        let mut decoded = frame::Video::empty();
        while self.video_decoder.receive_frame(&mut decoded).is_ok() {
            if self.scaler.is_none() {
                let created = scaling::Context::get(
                    decoded.format(),
                    decoded.width(),
                    decoded.height(),
                    Pixel::UYVY422,
                    self.format.width() as u32,
                    self.format.height() as u32,
                    scaling::Flags::BICUBIC,
                )
                .map_err(|e| SourceError::ReadFailed(e.to_string()))?;
                self.scaler = Some(created);
            }
            if let Some(scaler) = self.scaler.as_mut() {
                let mut scaled = frame::Video::empty();
                scaler
                    .run(&decoded, &mut scaled)
                    .map_err(|e| SourceError::ReadFailed(e.to_string()))?;

                let pts_units = decoded.timestamp().or(decoded.pts()).unwrap_or(0);
                let pts_seconds = pts_units as f64 * self.video_time_base;
                self.pending.push(DecodedUnit::Video {
                    data: copy_packed_plane(&scaled, self.format.row_bytes(), self.format.height()),
                    pts_seconds,
                });
            }
        }
        Ok(())
    }

    fn drain_audio(&mut self, lane_index: usize) -> Result<(), SourceError> {
        let lanes = self.audio_lanes.len();
        let lane = &mut self.audio_lanes[lane_index];
        let channels = if lanes > 1 { 1 } else { AUDIO_CHANNELS };

        let mut decoded = frame::Audio::empty();
        while lane.decoder.receive_frame(&mut decoded).is_ok() {
            let mut resampled = frame::Audio::empty();
            lane.resampler
                .run(&decoded, &mut resampled)
                .map_err(|e| SourceError::ReadFailed(e.to_string()))?;
            let bytes = resampled.samples() * channels * AUDIO_BYTES_PER_SAMPLE;
            if bytes == 0 {
                continue;
            }
            let data = resampled.data(0)[..bytes].to_vec();
            self.pending.push(if lanes > 1 {
                DecodedUnit::AudioPlane {
                    substream: lane.substream,
                    data,
                }
            } else {
                DecodedUnit::Audio { data }
            });
        }
        Ok(())
    }
}

impl MediaSource for FfmpegSource {
    fn info(&self) -> &MediaInfo {
        &self.info
    }

    fn next_unit(&mut self) -> Result<DecodedUnit, SourceError> {
        loop {
            if !self.pending.is_empty() {
                return Ok(self.pending.remove(0));
            }
            if self.draining {
                return Ok(DecodedUnit::EndOfStream);
            }

            let next = self
                .input
                .packets()
                .next()
                .map(|(stream, packet)| (stream.index(), packet));
            match next {
                Some((index, packet)) if index == self.video_stream => {
                    // Corrupt packets are skipped, not fatal
                    if let Err(e) = self.video_decoder.send_packet(&packet) {
                        debug!("video packet rejected by decoder: {e}");
                        continue;
                    }
                    self.drain_video()?;
                }
                Some((index, packet)) => {
                    let lane_index = self
                        .audio_lanes
                        .iter()
                        .position(|lane| lane.stream_index == index);
                    let Some(lane_index) = lane_index else {
                        continue;
                    };
                    if let Err(e) = self.audio_lanes[lane_index].decoder.send_packet(&packet) {
                        debug!("audio packet rejected by decoder: {e}");
                        continue;
                    }
                    self.drain_audio(lane_index)?;
                }
                None => {
                    // Flush everything buffered in the decoders, then signal
                    self.draining = true;
                    if self.video_decoder.send_eof().is_ok() {
                        self.drain_video()?;
                    }
                    for lane_index in 0..self.audio_lanes.len() {
                        if self.audio_lanes[lane_index].decoder.send_eof().is_ok() {
                            self.drain_audio(lane_index)?;
                        }
                    }
                }
            }
        }
    }

    fn seek(&mut self, position_ms: i64, direction: SeekDirection) -> Result<(), SourceError> {
        let timestamp = position_ms * 1000;
        let mut flags = 0;
        if direction == SeekDirection::Backward {
            flags |= ffmpeg_sys_next::AVSEEK_FLAG_BACKWARD;
        }
        // SAFETY: the context pointer is owned by self.input and stays valid
        // for the duration of the call.
        let ret = unsafe {
            ffmpeg_sys_next::av_seek_frame(self.input.as_mut_ptr(), -1, timestamp, flags)
        };
        if ret < 0 {
            return Err(SourceError::SeekFailed {
                position_ms,
                reason: ffmpeg::Error::from(ret).to_string(),
            });
        }

        self.video_decoder.flush();
        for lane in &mut self.audio_lanes {
            lane.decoder.flush();
        }
        self.pending.clear();
        self.draining = false;
        if let Some(id) = self.overlay {
            debug!("overlay {id} retained across seek");
        }
        Ok(())
    }

    fn set_overlay(&mut self, overlay: Option<u32>) -> Result<(), SourceError> {
        // Compositing happens in the device keyer; the source only tracks the
        // active graphic so a reopened/reseeked stream keeps it.
        self.overlay = overlay;
        match overlay {
            Some(id) => debug!("overlay {id} active"),
            None => debug!("overlay cleared"),
        }
        Ok(())
    }
}

/// Copy the packed plane row by row, dropping the per-row alignment padding.
fn copy_packed_plane(frame: &frame::Video, row_bytes: usize, height: usize) -> Vec<u8> {
    let stride = frame.stride(0);
    let data = frame.data(0);
    if stride == row_bytes {
        return data[..row_bytes * height].to_vec();
    }
    let mut out = Vec::with_capacity(row_bytes * height);
    for row in 0..height {
        let start = row * stride;
        out.extend_from_slice(&data[start..start + row_bytes]);
    }
    out
}

pub struct FfmpegSourceFactory;

impl SourceFactory for FfmpegSourceFactory {
    fn open(
        &self,
        path: &str,
        format: ChannelFormat,
    ) -> Result<Box<dyn MediaSource>, LoadError> {
        Ok(Box::new(FfmpegSource::open(path, format)?))
    }
}

/// Frame rate as an exact rational, for encoder time bases.
fn fps_rational(format: ChannelFormat) -> Rational {
    match format {
        ChannelFormat::Hd720p50 => Rational::new(50, 1),
        ChannelFormat::Hd720p5994 => Rational::new(60_000, 1001),
        ChannelFormat::Hd1080i5994 => Rational::new(30_000, 1001),
        _ => Rational::new(25, 1),
    }
}

struct MuxSession {
    octx: format::context::Output,
    video_encoder: ffmpeg::encoder::video::Encoder,
    audio_encoder: ffmpeg::encoder::audio::Encoder,
    scaler: scaling::Context,
    video_index: usize,
    audio_index: usize,
    video_stream_tb: Rational,
    audio_stream_tb: Rational,
    video_tb: Rational,
    format: ChannelFormat,
    /// Running pts, frames for video and sample frames for audio.
    video_pts: i64,
    audio_pts: i64,
}

impl MuxSession {
    fn flush_packets(&mut self, video: bool) -> Result<(), RecordError> {
        let (index, src_tb, dst_tb) = if video {
            (self.video_index, self.video_tb, self.video_stream_tb)
        } else {
            (
                self.audio_index,
                Rational::new(1, AUDIO_SAMPLE_RATE as i32),
                self.audio_stream_tb,
            )
        };
        let mut encoded = Packet::empty();
        loop {
            let received = if video {
                self.video_encoder.receive_packet(&mut encoded)
            } else {
                self.audio_encoder.receive_packet(&mut encoded)
            };
            if received.is_err() {
                return Ok(());
            }
            encoded.set_stream(index);
            encoded.rescale_ts(src_tb, dst_tb);
            encoded
                .write_interleaved(&mut self.octx)
                .map_err(|e| RecordError::MuxFailed(e.to_string()))?;
        }
    }

    fn duration_ms(&self) -> i64 {
        (self.video_pts as f64 * 1000.0 / self.format.fps()) as i64
    }
}

/// MXF record sink: MPEG-2 video (D-10 bitrates for SD) and 16-bit PCM.
pub struct FfmpegRecordSink {
    session: Option<MuxSession>,
}

impl FfmpegRecordSink {
    pub fn new() -> Self {
        initialize_ffmpeg();
        Self { session: None }
    }

    fn session(&mut self) -> Result<&mut MuxSession, RecordError> {
        self.session
            .as_mut()
            .ok_or_else(|| RecordError::MuxFailed("output not open".to_string()))
    }
}

impl Default for FfmpegRecordSink {
    fn default() -> Self {
        Self::new()
    }
}

impl crate::bridge::recorder::RecordSink for FfmpegRecordSink {
    fn open(
        &mut self,
        path: &str,
        format: ChannelFormat,
        timecode: Option<&str>,
    ) -> Result<(), RecordError> {
        let open_err = |e: ffmpeg::Error| RecordError::OpenFailed {
            path: path.to_string(),
            reason: e.to_string(),
        };
        let mut octx = format::output(&path).map_err(open_err)?;

        let fps = fps_rational(format);
        let video_tb = fps.invert();
        let video_codec = ffmpeg::encoder::find(codec::Id::MPEG2VIDEO)
            .ok_or_else(|| RecordError::EncoderFault("mpeg2video encoder missing".to_string()))?;
        let mut venc = codec::context::Context::new_with_codec(video_codec)
            .encoder()
            .video()
            .map_err(open_err)?;
        venc.set_width(format.width() as u32);
        venc.set_height(format.height() as u32);
        venc.set_format(Pixel::YUV422P);
        venc.set_time_base(video_tb);
        venc.set_frame_rate(Some(fps));
        match format.container() {
            RecordContainer::MxfD10 => {
                venc.set_bit_rate(50_000_000);
                venc.set_max_bit_rate(50_000_000);
                venc.set_gop(0);
            }
            RecordContainer::Mxf => {
                venc.set_bit_rate(80_000_000);
                venc.set_gop(12);
            }
        }
        let video_encoder = venc.open_as(video_codec).map_err(open_err)?;
        let mut video_stream = octx.add_stream(video_codec).map_err(open_err)?;
        video_stream.set_parameters(&video_encoder);
        video_stream.set_time_base(video_tb);
        let video_index = video_stream.index();

        let audio_codec = ffmpeg::encoder::find(codec::Id::PCM_S16LE)
            .ok_or_else(|| RecordError::EncoderFault("pcm_s16le encoder missing".to_string()))?;
        let mut aenc = codec::context::Context::new_with_codec(audio_codec)
            .encoder()
            .audio()
            .map_err(open_err)?;
        aenc.set_rate(AUDIO_SAMPLE_RATE as i32);
        aenc.set_format(OUTPUT_SAMPLE);
        aenc.set_channel_layout(ChannelLayout::default(AUDIO_CHANNELS as i32));
        aenc.set_time_base(Rational::new(1, AUDIO_SAMPLE_RATE as i32));
        let audio_encoder = aenc.open_as(audio_codec).map_err(open_err)?;
        let mut audio_stream = octx.add_stream(audio_codec).map_err(open_err)?;
        audio_stream.set_parameters(&audio_encoder);
        audio_stream.set_time_base(Rational::new(1, AUDIO_SAMPLE_RATE as i32));
        let audio_index = audio_stream.index();

        let scaler = scaling::Context::get(
            Pixel::UYVY422,
            format.width() as u32,
            format.height() as u32,
            Pixel::YUV422P,
            format.width() as u32,
            format.height() as u32,
            scaling::Flags::BILINEAR,
        )
        .map_err(open_err)?;

        if let Some(tc) = timecode {
            let mut metadata = Dictionary::new();
            metadata.set("timecode", tc);
            octx.set_metadata(metadata);
        }
        octx.write_header().map_err(open_err)?;
        let video_stream_tb = octx
            .stream(video_index)
            .map(|s| s.time_base())
            .unwrap_or(video_tb);
        let audio_stream_tb = octx
            .stream(audio_index)
            .map(|s| s.time_base())
            .unwrap_or_else(|| Rational::new(1, AUDIO_SAMPLE_RATE as i32));

        info!("recording output '{path}' open at {}", format.label());
        self.session = Some(MuxSession {
            octx,
            video_encoder,
            audio_encoder,
            scaler,
            video_index,
            audio_index,
            video_stream_tb,
            audio_stream_tb,
            video_tb,
            format,
            video_pts: 0,
            audio_pts: 0,
        });
        Ok(())
    }

    fn write_video(&mut self, data: &[u8]) -> Result<i64, RecordError> {
        let session = self.session()?;
        let format = session.format;
        // Captured frames may carry VANC rows ahead of the active picture
        let offset = data.len().saturating_sub(format.frame_size());
        let active = &data[offset..];
        if active.len() < format.frame_size() {
            return Err(RecordError::EncoderFault(format!(
                "short video frame: {} bytes",
                data.len()
            )));
        }

        let mut src = frame::Video::new(
            Pixel::UYVY422,
            format.width() as u32,
            format.height() as u32,
        );
        let stride = src.stride(0);
        let row_bytes = format.row_bytes();
        for row in 0..format.height() {
            let dst = row * stride;
            src.data_mut(0)[dst..dst + row_bytes]
                .copy_from_slice(&active[row * row_bytes..(row + 1) * row_bytes]);
        }

        let mut converted = frame::Video::empty();
        session
            .scaler
            .run(&src, &mut converted)
            .map_err(|e| RecordError::EncoderFault(e.to_string()))?;
        converted.set_pts(Some(session.video_pts));
        session
            .video_encoder
            .send_frame(&converted)
            .map_err(|e| RecordError::EncoderFault(e.to_string()))?;
        session.video_pts += 1;
        session.flush_packets(true)?;
        Ok(session.duration_ms())
    }

    fn write_audio(&mut self, samples: &[u8]) -> Result<i64, RecordError> {
        let session = self.session()?;
        let sample_frames = samples.len() / AUDIO_FRAME_BYTES;
        if sample_frames == 0 {
            return Ok((session.audio_pts * 1000) / AUDIO_SAMPLE_RATE as i64);
        }

        let mut frame = frame::Audio::new(
            OUTPUT_SAMPLE,
            sample_frames,
            ChannelLayout::default(AUDIO_CHANNELS as i32),
        );
        frame.set_rate(AUDIO_SAMPLE_RATE);
        let bytes = sample_frames * AUDIO_FRAME_BYTES;
        frame.data_mut(0)[..bytes].copy_from_slice(&samples[..bytes]);
        frame.set_pts(Some(session.audio_pts));

        session
            .audio_encoder
            .send_frame(&frame)
            .map_err(|e| RecordError::EncoderFault(e.to_string()))?;
        session.audio_pts += sample_frames as i64;
        session.flush_packets(false)?;
        Ok((session.audio_pts * 1000) / AUDIO_SAMPLE_RATE as i64)
    }

    fn close(&mut self) -> Result<i64, RecordError> {
        let Some(mut session) = self.session.take() else {
            return Ok(0);
        };
        let _ = session.video_encoder.send_eof();
        session.flush_packets(true)?;
        let _ = session.audio_encoder.send_eof();
        session.flush_packets(false)?;
        session
            .octx
            .write_trailer()
            .map_err(|e| RecordError::MuxFailed(e.to_string()))?;
        Ok(session.duration_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fps_rational_matches_nominal_rate() {
        for format in [
            ChannelFormat::Pal,
            ChannelFormat::Hd720p50,
            ChannelFormat::Hd720p5994,
            ChannelFormat::Hd1080i5994,
        ] {
            let fps = fps_rational(format);
            let value = fps.numerator() as f64 / fps.denominator() as f64;
            assert!((value - format.fps()).abs() < 0.005);
        }
    }
}
