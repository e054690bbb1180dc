//! Codec library boundary.
//!
//! The engine never touches demuxers or codecs directly; it pulls decoded,
//! output-format units through `MediaSource`. The real adapter lives behind
//! the `ffmpeg` feature; tests script their own sources.

use crate::error::SourceError;

/// Stream facts fixed at open time.
#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub duration_ms: i64,
    /// Frame rate detected from the stream, which may disagree with the
    /// channel's nominal rate.
    pub detected_fps: f64,
    /// Embedded container timecode (`HH:MM:SS:FF`), when present.
    pub start_timecode: Option<String>,
    /// Number of mono audio substreams. 1 means the source already delivers
    /// interleaved blocks.
    pub audio_substreams: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekDirection {
    Forward,
    Backward,
}

/// One decoded unit pulled from the source. Video payloads are already in
/// the channel's output pixel layout; audio is 48 kHz signed 16-bit.
#[derive(Debug)]
pub enum DecodedUnit {
    Video {
        data: Vec<u8>,
        /// Raw presentation time in seconds of stream time.
        pts_seconds: f64,
    },
    /// Interleaved audio block covering all output channels.
    Audio { data: Vec<u8> },
    /// One mono substream's worth of samples; the producer interleaves
    /// these once every substream of a group has been seen.
    AudioPlane { substream: usize, data: Vec<u8> },
    EndOfStream,
}

pub trait MediaSource: Send {
    fn info(&self) -> &MediaInfo;

    /// Pull the next decoded unit. Per-unit decode failures are handled
    /// inside the implementation (logged, unit skipped); an `Err` here means
    /// the stream is unreadable.
    fn next_unit(&mut self) -> Result<DecodedUnit, SourceError>;

    fn seek(&mut self, position_ms: i64, direction: SeekDirection) -> Result<(), SourceError>;

    /// Apply or clear a graphic overlay composited onto decoded video.
    fn set_overlay(&mut self, overlay: Option<u32>) -> Result<(), SourceError>;
}

/// Opens media sources for a channel. Playout channels get one injected at
/// construction so the core stays independent of the codec backend.
pub trait SourceFactory: Send + Sync {
    fn open(
        &self,
        path: &str,
        format: crate::core::format::ChannelFormat,
    ) -> Result<Box<dyn MediaSource>, crate::error::LoadError>;
}
