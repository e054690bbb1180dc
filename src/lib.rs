//! Broadcast channel playout and ingest engine.
//!
//! Each physical channel is a [`VideoPort`], configured at startup as either
//! a playout port or an ingest port:
//!
//! - **Playout**: a decode producer fills bounded frame queues from a
//!   [`MediaSource`]; the [`PlayoutChannel`] state machine drives transport
//!   verbs (load, recue, take, pause, seek, trick play) and either software
//!   clock consumers (preview operation) or the hardware output scheduler,
//!   which feeds a claimed [`OutputDevice`] from its completion callbacks
//!   with frame-accurate timing and embedded timecode.
//! - **Ingest**: the capture device's callback fans each arriving block out
//!   to hardware pass-through, the recording queues and the preview sink;
//!   the recorder thread muxes both queues in timestamp order through a
//!   [`RecordSink`], restarting the output on encoder faults.
//!
//! Non-fatal conditions (genlock loss, recorder restarts, recording gaps)
//! are surfaced as [`EngineEvent`]s on a crossbeam channel rather than as
//! errors.
//!
//! The FFmpeg-backed source and record sink live behind the optional
//! `ffmpeg` cargo feature; the core only knows the boundary traits, so tests
//! and alternative backends plug in the same way.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use playdeck::{ChannelFormat, PlayoutChannel, VideoPort};
//! use playdeck::ffmpeg::FfmpegSourceFactory;
//!
//! let (events, _event_rx) = crossbeam_channel::unbounded();
//! let factory = Arc::new(FfmpegSourceFactory);
//! let device = registry.claim_output(0)?;
//! let channel = PlayoutChannel::new_hardware(ChannelFormat::Hd1080i50, factory, device, events)?;
//! let mut port = VideoPort::playout(1, channel);
//!
//! port.load("/media/clip.mxf")?;
//! port.take()?;
//! ```

pub mod bridge;
pub mod core;
pub mod device;
pub mod error;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod port;

pub use crate::bridge::recorder::{RecordSink, Recorder};
pub use crate::bridge::IoBridge;
pub use crate::core::channel::{ChannelState, EngineEvent, PlayoutChannel};
pub use crate::core::consumer::PreviewSink;
pub use crate::core::format::{ChannelFormat, RecordContainer};
pub use crate::core::frame::{Frame, MediaKind};
pub use crate::core::source::{DecodedUnit, MediaInfo, MediaSource, SeekDirection, SourceFactory};
pub use crate::core::timecode::TimecodeParts;
pub use crate::device::registry::DeviceRegistry;
pub use crate::device::{
    CaptureDevice, CaptureSink, CompletionResult, DeviceCallbacks, OutputDevice, ReferenceStatus,
};
pub use crate::error::{
    DeviceError, Error, LoadError, RecordError, Result, SourceError, TransportError,
};
pub use crate::port::VideoPort;

#[cfg(feature = "ffmpeg")]
pub use crate::ffmpeg::{FfmpegRecordSink, FfmpegSource, FfmpegSourceFactory};
