//! Playback orchestrator.
//!
//! One `PlayoutChannel` per port: owns the queues, the decode producer and
//! whichever consumer side the channel runs (software clock threads for
//! preview-only operation, or the hardware output scheduler). All state
//! transitions happen here; the producer and consumers only ever observe
//! stop flags.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{debug, info, warn};

use crate::core::consumer::{ConsumerPair, PreviewSink};
use crate::core::format::ChannelFormat;
use crate::core::frame::MediaKind;
use crate::core::frame_queue::FrameQueue;
use crate::core::producer::DecodeProducer;
use crate::core::scheduler::HardwareScheduler;
use crate::core::source::{MediaSource, SeekDirection, SourceFactory};
use crate::core::timecode::{parse_timecode_ms, TimecodeParts};
use crate::device::OutputDevice;
use crate::error::{DeviceError, Error, TransportError};

pub(crate) const VIDEO_QUEUE_CAPACITY: usize = 50;
pub(crate) const AUDIO_QUEUE_CAPACITY: usize = 100;

/// Frames that must be buffered before load/seek returns, and how many
/// 10 ms polls we give the producer to get there.
const MIN_BUFFERED_FRAMES: usize = 5;
const BUFFER_RETRY_LIMIT: usize = 100;
const BUFFER_RETRY_SLEEP: Duration = Duration::from_millis(10);

const RATE_MIN: f64 = 0.1;
const RATE_MAX: f64 = 2.0;
const RATE_STEP: f64 = 0.1;

/// Non-fatal conditions surfaced to the operator without unwinding the
/// state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The output device lost its external timing reference.
    GenlockLost,
    /// The recorder restarted into a new output file after an encoder fault.
    RecorderRestarted { path: String },
    /// The recorder gave up after too many consecutive faults.
    RecorderEscalated { consecutive_faults: u32 },
    /// A captured block was not recorded because the recording queue was full.
    RecordingGap { kind: MediaKind },
}

/// Rate and loop flag, written by the orchestrator, read by the producer
/// and the schedulers.
pub struct PlaybackParams {
    rate_thousandths: AtomicU32,
    looping: AtomicBool,
}

impl PlaybackParams {
    pub fn new() -> Self {
        Self {
            rate_thousandths: AtomicU32::new(1000),
            looping: AtomicBool::new(false),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate_thousandths.load(Ordering::Acquire) as f64 / 1000.0
    }

    pub fn set_rate(&self, rate: f64) {
        let clamped = rate.clamp(RATE_MIN, RATE_MAX);
        self.rate_thousandths
            .store((clamped * 1000.0).round() as u32, Ordering::Release);
    }

    pub fn looping(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }

    pub fn set_looping(&self, looping: bool) {
        self.looping.store(looping, Ordering::Release);
    }
}

impl Default for PlaybackParams {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Paused,
    Playing,
    /// Transient: consumers are being halted before queue mutation.
    Stopping,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Paused => "paused",
            Self::Playing => "playing",
            Self::Stopping => "stopping",
        }
    }
}

/// Consumer side of the channel, fixed at construction.
enum OutputMode {
    /// Software clock consumers, optional preview display.
    Preview(Option<Arc<dyn PreviewSink>>),
    /// Hardware device with callback-driven scheduling.
    Hardware {
        device: Arc<Mutex<Box<dyn OutputDevice>>>,
        scheduler: HardwareScheduler,
    },
}

pub struct PlayoutChannel {
    format: ChannelFormat,
    factory: Arc<dyn SourceFactory>,
    mode: OutputMode,
    state: ChannelState,
    params: Arc<PlaybackParams>,
    video_queue: Arc<FrameQueue>,
    audio_queue: Arc<FrameQueue>,
    video_clock_ms: Arc<AtomicI64>,
    source: Option<Arc<Mutex<Box<dyn MediaSource>>>>,
    producer: Option<DecodeProducer>,
    consumers: Option<ConsumerPair>,
    duration_ms: i64,
    start_ms: i64,
    loaded: bool,
}

impl PlayoutChannel {
    /// Channel without a hardware output; frames pace against the software
    /// clock and go to the preview sink when one is attached.
    pub fn new_preview(
        format: ChannelFormat,
        factory: Arc<dyn SourceFactory>,
        preview: Option<Arc<dyn PreviewSink>>,
    ) -> Self {
        Self {
            format,
            factory,
            mode: OutputMode::Preview(preview),
            state: ChannelState::Idle,
            params: Arc::new(PlaybackParams::new()),
            video_queue: Arc::new(FrameQueue::new(VIDEO_QUEUE_CAPACITY)),
            audio_queue: Arc::new(FrameQueue::new(AUDIO_QUEUE_CAPACITY)),
            video_clock_ms: Arc::new(AtomicI64::new(0)),
            source: None,
            producer: None,
            consumers: None,
            duration_ms: 0,
            start_ms: 0,
            loaded: false,
        }
    }

    /// Channel driving a claimed output device. The device is enabled for
    /// the given format; completion callbacks are wired to the scheduler.
    pub fn new_hardware(
        format: ChannelFormat,
        factory: Arc<dyn SourceFactory>,
        mut device: Box<dyn OutputDevice>,
        events: Sender<EngineEvent>,
    ) -> Result<Self, DeviceError> {
        device.enable(format)?;
        let device = Arc::new(Mutex::new(device));
        let params = Arc::new(PlaybackParams::new());
        let video_queue = Arc::new(FrameQueue::new(VIDEO_QUEUE_CAPACITY));
        let audio_queue = Arc::new(FrameQueue::new(AUDIO_QUEUE_CAPACITY));
        let video_clock_ms = Arc::new(AtomicI64::new(0));

        let scheduler = HardwareScheduler::new(
            Arc::clone(&device),
            Arc::clone(&video_queue),
            Arc::clone(&audio_queue),
            Arc::clone(&params),
            format,
            Arc::clone(&video_clock_ms),
            events,
        );

        Ok(Self {
            format,
            factory,
            mode: OutputMode::Hardware { device, scheduler },
            state: ChannelState::Idle,
            params,
            video_queue,
            audio_queue,
            video_clock_ms,
            source: None,
            producer: None,
            consumers: None,
            duration_ms: 0,
            start_ms: 0,
            loaded: false,
        })
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn format(&self) -> ChannelFormat {
        self.format
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration_ms
    }

    /// Current play position, from the last consumed frame's clock pts.
    pub fn play_time_ms(&self) -> i64 {
        self.video_clock_ms.load(Ordering::Acquire)
    }

    /// Play position offset by the embedded start timecode of the media.
    pub fn timecode_ms(&self) -> i64 {
        self.start_ms + self.play_time_ms()
    }

    pub fn start_millisecond(&self) -> i64 {
        self.start_ms
    }

    pub fn rate(&self) -> f64 {
        self.params.rate()
    }

    /// Load a media file, leaving the channel paused on its first frame.
    /// Returns the duration. Nothing of a failed load survives.
    pub fn load(&mut self, path: &str) -> Result<i64, Error> {
        if self.loaded {
            self.drop_media(true)?;
        }

        let source = self.factory.open(path, self.format)?;
        let info = source.info().clone();

        if let OutputMode::Hardware { scheduler, .. } = &self.mode {
            scheduler.set_detected_fps(info.detected_fps);
        }
        self.start_ms = info
            .start_timecode
            .as_deref()
            .and_then(|tc| parse_timecode_ms(tc, self.format.fps()))
            .unwrap_or(0);
        if let OutputMode::Hardware { scheduler, .. } = &self.mode {
            scheduler.set_start_offset_ms(self.start_ms);
        }
        self.duration_ms = info.duration_ms;

        self.video_queue.clear();
        self.audio_queue.clear();
        self.video_clock_ms.store(0, Ordering::Release);
        self.params.set_rate(1.0);
        self.params.set_looping(false);

        let source = Arc::new(Mutex::new(source));
        let mut producer = DecodeProducer::new(
            Arc::clone(&source),
            Arc::clone(&self.video_queue),
            Arc::clone(&self.audio_queue),
            Arc::clone(&self.params),
        );
        producer.start();
        self.source = Some(source);
        self.producer = Some(producer);
        self.loaded = true;
        self.state = ChannelState::Paused;

        self.wait_for_buffer();
        self.predisplay();

        info!(
            "loaded '{path}': {}ms at {:.2}fps, start timecode offset {}ms",
            self.duration_ms, info.detected_fps, self.start_ms
        );
        Ok(self.duration_ms)
    }

    /// Reset to the first frame without starting playback.
    pub fn recue(&mut self, looping: bool) -> Result<(), Error> {
        self.require_loaded()?;
        debug!("recue, loop={looping}");

        self.state = ChannelState::Stopping;
        self.stop_consumption(true);
        if let Some(producer) = &mut self.producer {
            producer.stop();
        }
        self.video_queue.clear();
        self.audio_queue.clear();

        self.params.set_looping(looping);
        self.params.set_rate(1.0);
        self.seek_source(0, SeekDirection::Backward)?;
        self.video_clock_ms.store(0, Ordering::Release);

        if let Some(producer) = &mut self.producer {
            producer.start();
        }
        self.state = ChannelState::Paused;
        self.wait_for_buffer();
        self.predisplay();
        Ok(())
    }

    /// Start (or resume) playback.
    pub fn take(&mut self) -> Result<(), Error> {
        self.require_loaded()?;
        if self.state == ChannelState::Playing {
            return Ok(());
        }
        self.state = ChannelState::Playing;
        match &mut self.mode {
            OutputMode::Preview(preview) => {
                self.consumers = Some(ConsumerPair::start(
                    Arc::clone(&self.video_queue),
                    Arc::clone(&self.audio_queue),
                    Arc::clone(&self.params),
                    Arc::clone(&self.video_clock_ms),
                    preview.clone(),
                ));
            }
            OutputMode::Hardware { scheduler, .. } => {
                scheduler.start_playback()?;
            }
        }
        Ok(())
    }

    /// Halt playback and re-home the playback origin to the current
    /// position via a seek. With `reset_rate` the rate returns to 1.0.
    pub fn pause(&mut self, reset_rate: bool) -> Result<(), Error> {
        self.require_loaded()?;
        if self.state != ChannelState::Playing {
            // Already paused; nothing to double-stop
            if reset_rate {
                self.params.set_rate(1.0);
            }
            return Ok(());
        }
        self.stop_consumption(true);
        self.state = ChannelState::Paused;
        if reset_rate {
            self.params.set_rate(1.0);
        }
        // Re-home the playback origin to the current position; queued
        // frames from before the pause are discarded by the seek
        self.seek(self.play_time_ms())?;
        Ok(())
    }

    /// Unload. `immediate` skips the graceful output drain.
    pub fn drop_media(&mut self, immediate: bool) -> Result<(), Error> {
        if !self.loaded {
            self.state = ChannelState::Idle;
            return Ok(());
        }
        self.state = ChannelState::Stopping;
        self.stop_consumption(immediate);
        if let Some(mut producer) = self.producer.take() {
            producer.stop();
        }
        self.source = None;
        self.video_queue.clear();
        self.audio_queue.clear();
        self.video_clock_ms.store(0, Ordering::Release);
        self.duration_ms = 0;
        self.start_ms = 0;
        self.loaded = false;
        self.state = ChannelState::Idle;
        debug!("media dropped");
        Ok(())
    }

    /// Jump to a position. Restores the Playing state if we were playing.
    pub fn seek(&mut self, position_ms: i64) -> Result<(), Error> {
        self.require_loaded()?;
        let was_playing = self.state == ChannelState::Playing;
        self.state = ChannelState::Stopping;
        if was_playing {
            self.stop_consumption(true);
        }
        if let Some(producer) = &mut self.producer {
            producer.stop();
        }

        let current = self.play_time_ms();
        let target = position_ms.clamp(0, self.duration_ms);
        let direction = if target < current {
            SeekDirection::Backward
        } else {
            SeekDirection::Forward
        };
        self.video_queue.clear();
        self.audio_queue.clear();
        self.seek_source(target, direction)?;
        self.video_clock_ms.store(target, Ordering::Release);

        if let Some(producer) = &mut self.producer {
            producer.start();
        }
        self.state = ChannelState::Paused;
        self.wait_for_buffer();
        self.predisplay();
        if was_playing {
            self.take()?;
        }
        Ok(())
    }

    pub fn next_frame(&mut self) -> Result<(), Error> {
        let step = self.format.frame_duration_ms() as i64;
        self.seek(self.play_time_ms() + step)
    }

    pub fn previous_frame(&mut self) -> Result<(), Error> {
        let step = self.format.frame_duration_ms() as i64;
        self.seek(self.play_time_ms() - step)
    }

    /// Step the rate up. Saturates at 2.0 and returns the resulting rate.
    pub fn forward(&mut self) -> Result<f64, Error> {
        self.change_rate(RATE_STEP)
    }

    /// Step the rate down. Saturates at 0.1.
    pub fn reverse(&mut self) -> Result<f64, Error> {
        self.change_rate(-RATE_STEP)
    }

    fn change_rate(&mut self, step: f64) -> Result<f64, Error> {
        self.require_loaded()?;
        let current = self.params.rate();
        let target = (((current + step) * 10.0).round() / 10.0).clamp(RATE_MIN, RATE_MAX);
        if (target - current).abs() < f64::EPSILON {
            return Ok(current);
        }
        self.params.set_rate(target);
        info!("rate changed to {target:.1}");
        // Re-home by pausing and retaking; a momentary output glitch at the
        // transition is expected
        if self.state == ChannelState::Playing {
            self.pause(false)?;
            self.take()?;
        }
        Ok(target)
    }

    /// Apply a graphic overlay. Only allowed while not playing; the current
    /// frame is re-decoded so the overlay shows up on the recue display.
    pub fn activate_overlay(&mut self, overlay: Option<u32>) -> Result<(), Error> {
        self.require_loaded()?;
        if self.state == ChannelState::Playing {
            return Err(TransportError::WrongState {
                required: "paused",
                actual: self.state.as_str(),
            }
            .into());
        }
        if let Some(producer) = &mut self.producer {
            producer.stop();
        }
        if let Some(source) = &self.source {
            let mut guard = match source.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.set_overlay(overlay)?;
        }
        self.seek(self.play_time_ms())
    }

    /// Switch the channel format. Only allowed while idle; hardware
    /// channels re-enable the device in the new mode.
    pub fn change_format(&mut self, format: ChannelFormat) -> Result<(), Error> {
        if self.state != ChannelState::Idle {
            return Err(TransportError::WrongState {
                required: "idle",
                actual: self.state.as_str(),
            }
            .into());
        }
        if let OutputMode::Hardware { device, scheduler } = &mut self.mode {
            let mut guard = match device.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.disable()?;
            guard.enable(format)?;
            scheduler.set_format(format);
        }
        self.format = format;
        info!("channel format changed to {}", format.label());
        Ok(())
    }

    /// True once playback ran off the end of the stream naturally.
    pub fn eof_reached(&self) -> bool {
        if self.state != ChannelState::Playing {
            return false;
        }
        match &self.mode {
            OutputMode::Preview(_) => self
                .consumers
                .as_ref()
                .map(|c| c.both_finished())
                .unwrap_or(false),
            OutputMode::Hardware { scheduler, .. } => scheduler.eof_reached(),
        }
    }

    fn require_loaded(&self) -> Result<(), TransportError> {
        if self.loaded {
            Ok(())
        } else {
            Err(TransportError::NotLoaded)
        }
    }

    fn stop_consumption(&mut self, immediate: bool) {
        match &mut self.mode {
            OutputMode::Preview(_) => {
                if let Some(mut consumers) = self.consumers.take() {
                    consumers.stop();
                }
            }
            OutputMode::Hardware { scheduler, .. } => {
                scheduler.stop(immediate);
            }
        }
    }

    fn seek_source(&self, position_ms: i64, direction: SeekDirection) -> Result<(), Error> {
        if let Some(source) = &self.source {
            let mut guard = match source.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.seek(position_ms, direction)?;
        }
        Ok(())
    }

    /// Block (bounded) until a minimum of video is buffered, so the first
    /// `take` does not starve.
    fn wait_for_buffer(&self) {
        for _ in 0..BUFFER_RETRY_LIMIT {
            if self.video_queue.len() >= MIN_BUFFERED_FRAMES {
                return;
            }
            if let Some(producer) = &self.producer {
                if producer.is_finished() {
                    return;
                }
            }
            std::thread::sleep(BUFFER_RETRY_SLEEP);
        }
        warn!("buffer warmup incomplete after bounded wait");
    }

    /// Show the first buffered frame while stopped: sync display on the
    /// hardware output and a copy to the preview sink.
    fn predisplay(&mut self) {
        let Some((data, clock_pts)) = self.video_queue.front_frame_copy() else {
            return;
        };
        match &self.mode {
            OutputMode::Preview(Some(sink)) => sink.video_frame(&data),
            OutputMode::Preview(None) => {}
            OutputMode::Hardware { device, .. } => {
                let fps = self.format.fps();
                let start_frames = (self.start_ms as f64 * fps / 1000.0) as i64;
                let media_frames = (clock_pts as f64 * fps * self.params.rate() / 1000.0) as i64;
                let timecode = TimecodeParts::from_frame_index(start_frames + media_frames, fps);
                let mut guard = match device.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Err(e) = guard.display_frame(&data, timecode) {
                    warn!("recue pre-display failed at {clock_pts}ms: {e}");
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn buffered_video_frames(&self) -> usize {
        self.video_queue.len()
    }
}

impl Drop for PlayoutChannel {
    fn drop(&mut self) {
        let _ = self.drop_media(true);
    }
}
