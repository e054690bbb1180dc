//! Hardware I/O boundary.
//!
//! The engine treats the output card as an opaque scheduling peer: frames
//! and audio blocks are submitted against the device's own time base, and
//! the device calls back when a frame completes or audio is wanted. The
//! callback thread belongs to the driver; handlers registered here must
//! never block beyond a small bounded number of polls.

pub mod registry;

use std::sync::Arc;

use crate::core::format::ChannelFormat;
use crate::core::timecode::TimecodeParts;
use crate::error::DeviceError;

/// Outcome reported for a completed scheduled frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionResult {
    Completed,
    DisplayedLate,
    Dropped,
    Flushed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceStatus {
    Locked,
    NotLocked,
}

/// Handlers executed on the device's callback thread.
pub trait DeviceCallbacks: Send + Sync {
    /// A scheduled frame finished displaying. `clock_pts_ms` is the value
    /// the frame was submitted with.
    fn frame_completed(&self, clock_pts_ms: i64, result: CompletionResult);

    /// The device wants audio. `preroll` is true while priming before
    /// playback starts.
    fn render_audio(&self, preroll: bool);

    /// Scheduled playback came to a stop, either drained or cancelled.
    fn playback_stopped(&self);
}

pub trait OutputDevice: Send {
    fn enable(&mut self, format: ChannelFormat) -> Result<(), DeviceError>;
    fn disable(&mut self) -> Result<(), DeviceError>;

    fn set_callbacks(&mut self, callbacks: Arc<dyn DeviceCallbacks>);

    /// Show a frame immediately, outside the scheduled stream, with the
    /// timecode to embed as VITC. Used for the recue pre-display while
    /// stopped.
    fn display_frame(&mut self, data: &[u8], timecode: TimecodeParts) -> Result<(), DeviceError>;

    /// Queue a frame at `display_time_ms` on the device clock, with the
    /// timecode to embed as VITC. `clock_pts_ms` is echoed back through
    /// `frame_completed`.
    fn schedule_frame(
        &mut self,
        data: Vec<u8>,
        display_time_ms: i64,
        duration_ms: i64,
        timecode: TimecodeParts,
        clock_pts_ms: i64,
    ) -> Result<(), DeviceError>;

    /// Queue interleaved audio at the running sample offset.
    fn schedule_audio(&mut self, samples: Vec<u8>, stream_sample_offset: i64)
        -> Result<(), DeviceError>;

    fn buffered_audio_samples(&self) -> u32;

    fn reference_status(&self) -> ReferenceStatus;

    fn begin_audio_preroll(&mut self) -> Result<(), DeviceError>;
    fn end_audio_preroll(&mut self) -> Result<(), DeviceError>;

    fn start_scheduled_playback(&mut self) -> Result<(), DeviceError>;

    /// Stop scheduled playback. `at_time_ms` of `None` cancels immediately;
    /// otherwise the device drains up to the given time.
    fn stop_scheduled_playback(&mut self, at_time_ms: Option<i64>) -> Result<(), DeviceError>;
}

/// Receives capture callbacks from an input device. Implemented by the live
/// bridge; runs on the driver's thread, so implementations must not block.
pub trait CaptureSink: Send + Sync {
    /// A raw video frame arrived, with its VITC timecode when the signal
    /// carries one.
    fn video_arrived(&self, data: &[u8], timecode: Option<&str>);

    fn audio_arrived(&self, samples: &[u8]);

    /// The input signal dropped.
    fn signal_lost(&self);
}

pub trait CaptureDevice: Send {
    fn enable(&mut self, format: ChannelFormat, sink: Arc<dyn CaptureSink>)
        -> Result<(), DeviceError>;
    fn disable(&mut self) -> Result<(), DeviceError>;

    /// Pause, drop everything buffered in the driver, resume.
    fn flush(&mut self) -> Result<(), DeviceError>;
}
