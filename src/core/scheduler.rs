//! Hardware output scheduler.
//!
//! The device's completion callback, not a local clock, decides when the
//! next frame is due: every completed frame pulls exactly one replacement
//! from the video queue, so the device always has the preloaded depth in
//! flight. Audio is topped up from the render callback against a one-second
//! watermark. All handlers run on the driver's callback thread and poll the
//! queues a bounded number of times instead of sleeping.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{debug, error, info, warn};

use crate::core::channel::{EngineEvent, PlaybackParams};
use crate::core::format::{ChannelFormat, AUDIO_FRAME_BYTES, AUDIO_SAMPLE_RATE};
use crate::core::frame::Frame;
use crate::core::frame_queue::{FrameQueue, Slot};
use crate::core::timecode::TimecodeParts;
use crate::device::{CompletionResult, DeviceCallbacks, OutputDevice, ReferenceStatus};
use crate::error::DeviceError;

/// Frames submitted ahead before preroll starts.
const PRELOAD_FRAMES: usize = 10;
/// Audio render callbacks counted during preroll before playback begins.
const PREROLL_AUDIO_CALLBACKS: usize = 20;
/// Retry ceiling while loading, where sleeping is allowed.
const LOAD_RETRY_LIMIT: usize = 100;
const LOAD_RETRY_SLEEP: Duration = Duration::from_millis(10);
/// Poll ceiling inside device callbacks, which must not sleep.
const CALLBACK_POLL_LIMIT: usize = 10;

enum Pulled {
    Frame(Frame),
    EndOfStream,
    Empty,
}

pub(crate) struct HardwareScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    device: Arc<Mutex<Box<dyn OutputDevice>>>,
    video_queue: Arc<FrameQueue>,
    audio_queue: Arc<FrameQueue>,
    params: Arc<PlaybackParams>,
    format: Mutex<ChannelFormat>,
    video_clock_ms: Arc<AtomicI64>,
    events: Sender<EngineEvent>,

    running: AtomicBool,
    prerolling: AtomicBool,
    preroll_callbacks: AtomicUsize,
    /// Frames scheduled since playback start; also the next display slot.
    total_frames: AtomicI64,
    frames_completed: AtomicI64,
    /// Interleaved sample frames scheduled so far.
    total_samples: AtomicI64,
    /// Stop boundary recorded at end of stream; -1 while none.
    end_frame: AtomicI64,
    /// Detected source fps, bits of an f64. 0 means "same as nominal".
    detected_fps_bits: AtomicU64,
    /// Timecode origin in output frames.
    start_frame_offset: AtomicI64,
    reference_locked: AtomicBool,
}

impl HardwareScheduler {
    pub(crate) fn new(
        device: Arc<Mutex<Box<dyn OutputDevice>>>,
        video_queue: Arc<FrameQueue>,
        audio_queue: Arc<FrameQueue>,
        params: Arc<PlaybackParams>,
        format: ChannelFormat,
        video_clock_ms: Arc<AtomicI64>,
        events: Sender<EngineEvent>,
    ) -> Self {
        let inner = Arc::new(SchedulerInner {
            device: Arc::clone(&device),
            video_queue,
            audio_queue,
            params,
            format: Mutex::new(format),
            video_clock_ms,
            events,
            running: AtomicBool::new(false),
            prerolling: AtomicBool::new(false),
            preroll_callbacks: AtomicUsize::new(0),
            total_frames: AtomicI64::new(0),
            frames_completed: AtomicI64::new(0),
            total_samples: AtomicI64::new(0),
            end_frame: AtomicI64::new(-1),
            detected_fps_bits: AtomicU64::new(0),
            start_frame_offset: AtomicI64::new(0),
            reference_locked: AtomicBool::new(true),
        });
        {
            let callbacks: Arc<dyn DeviceCallbacks> = inner.clone();
            let mut guard = lock_device(&device);
            guard.set_callbacks(callbacks);
        }
        Self { inner }
    }

    /// Record the source's detected frame rate. A mismatch against the
    /// channel's nominal rate scales the per-frame display duration.
    pub(crate) fn set_detected_fps(&self, detected: f64) {
        let nominal = self.inner.nominal_fps();
        if detected > 0.0 && (detected - nominal).abs() > 0.01 {
            warn!("source fps {detected:.2} differs from channel fps {nominal:.2}, adjusting frame duration");
        }
        self.inner
            .detected_fps_bits
            .store(detected.max(0.0).to_bits(), Ordering::Release);
    }

    /// Timecode origin from the media's embedded start timecode.
    pub(crate) fn set_start_offset_ms(&self, start_ms: i64) {
        let frames = (start_ms.max(0) as f64 * self.inner.nominal_fps() / 1000.0) as i64;
        self.inner
            .start_frame_offset
            .store(frames, Ordering::Release);
    }

    pub(crate) fn set_format(&self, format: ChannelFormat) {
        let mut guard = match self.inner.format.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = format;
    }

    /// Preload the device and begin audio preroll. Playback proper starts
    /// from the preroll render callbacks once enough audio is primed.
    pub(crate) fn start_playback(&self) -> Result<(), DeviceError> {
        let inner = &self.inner;
        inner.total_frames.store(0, Ordering::Release);
        inner.frames_completed.store(0, Ordering::Release);
        inner.total_samples.store(0, Ordering::Release);
        inner.end_frame.store(-1, Ordering::Release);
        inner.preroll_callbacks.store(0, Ordering::Release);
        inner.prerolling.store(true, Ordering::Release);
        inner.running.store(true, Ordering::Release);

        for _ in 0..PRELOAD_FRAMES {
            match inner.pull_video(LOAD_RETRY_LIMIT, true) {
                Pulled::Frame(frame) => inner.schedule_video(frame)?,
                Pulled::EndOfStream | Pulled::Empty => {
                    // Very short clip: everything it has is already in flight
                    let boundary = inner.total_frames.load(Ordering::Acquire);
                    inner.end_frame.store(boundary, Ordering::Release);
                    debug!("stream exhausted during preload, stop boundary at frame {boundary}");
                    break;
                }
            }
        }

        let mut device = lock_device(&inner.device);
        device.begin_audio_preroll()
    }

    /// Halt scheduled playback. Immediate cancels in place; otherwise the
    /// device drains to the recorded stop boundary (or the last scheduled
    /// frame).
    pub(crate) fn stop(&self, immediate: bool) {
        let inner = &self.inner;
        if !inner.running.load(Ordering::Acquire) {
            return;
        }
        let result = {
            let mut device = lock_device(&inner.device);
            if immediate {
                device.stop_scheduled_playback(None)
            } else {
                let boundary = match inner.end_frame.load(Ordering::Acquire) {
                    -1 => inner.total_frames.load(Ordering::Acquire),
                    recorded => recorded,
                };
                // Drain up to the last scheduled frame's display slot
                let at = ((boundary - 1).max(0) as f64 * inner.frame_display_duration_ms()) as i64;
                device.stop_scheduled_playback(Some(at))
            }
        };
        if let Err(e) = result {
            error!("stop scheduled playback failed: {e}");
        }
        if immediate {
            inner.running.store(false, Ordering::Release);
            inner.prerolling.store(false, Ordering::Release);
        }
    }

    /// Playback drained past its end-of-stream boundary and stopped.
    pub(crate) fn eof_reached(&self) -> bool {
        self.inner.end_frame.load(Ordering::Acquire) >= 0
            && !self.inner.running.load(Ordering::Acquire)
    }
}

fn lock_device<'a>(
    device: &'a Arc<Mutex<Box<dyn OutputDevice>>>,
) -> std::sync::MutexGuard<'a, Box<dyn OutputDevice>> {
    match device.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SchedulerInner {
    fn nominal_fps(&self) -> f64 {
        match self.format.lock() {
            Ok(guard) => guard.fps(),
            Err(poisoned) => poisoned.into_inner().fps(),
        }
    }

    /// Display duration of one output frame at the current rate, including
    /// the source fps mismatch adjustment.
    fn frame_display_duration_ms(&self) -> f64 {
        let nominal = self.nominal_fps();
        let detected = f64::from_bits(self.detected_fps_bits.load(Ordering::Acquire));
        let effective_fps = if detected > 0.0 { detected } else { nominal };
        1000.0 / effective_fps / self.params.rate()
    }

    /// Pull one video frame. Loop sentinels are skipped while looping;
    /// otherwise they mark end of stream. `may_sleep` is false on the
    /// device callback path.
    fn pull_video(&self, limit: usize, may_sleep: bool) -> Pulled {
        for attempt in 0..limit {
            match self.video_queue.try_pop() {
                Some(Slot::Frame(frame)) => return Pulled::Frame(frame),
                Some(Slot::EndOfStream) => {
                    if self.params.looping() {
                        continue;
                    }
                    return Pulled::EndOfStream;
                }
                None => {
                    if may_sleep && attempt + 1 < limit {
                        std::thread::sleep(LOAD_RETRY_SLEEP);
                    }
                }
            }
        }
        Pulled::Empty
    }

    fn pull_audio(&self, limit: usize) -> Pulled {
        for _ in 0..limit {
            match self.audio_queue.try_pop() {
                Some(Slot::Frame(frame)) => return Pulled::Frame(frame),
                Some(Slot::EndOfStream) => {
                    if self.params.looping() {
                        continue;
                    }
                    return Pulled::EndOfStream;
                }
                None => {}
            }
        }
        Pulled::Empty
    }

    fn schedule_video(&self, frame: Frame) -> Result<(), DeviceError> {
        let duration = self.frame_display_duration_ms();
        let index = self.total_frames.load(Ordering::Acquire);
        let display_time = (index as f64 * duration) as i64;
        let clock_pts = frame.clock_pts_ms();
        // VITC follows the media position, so it survives seek and re-take
        let fps = self.nominal_fps();
        let media_frames = (clock_pts as f64 * fps * self.params.rate() / 1000.0) as i64;
        let timecode_index = self.start_frame_offset.load(Ordering::Acquire) + media_frames;
        let timecode = TimecodeParts::from_frame_index(timecode_index, fps);

        let mut device = lock_device(&self.device);
        device.schedule_frame(
            frame.into_data(),
            display_time,
            duration as i64,
            timecode,
            clock_pts,
        )?;
        self.total_frames.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn check_reference(&self) {
        let status = {
            let device = lock_device(&self.device);
            device.reference_status()
        };
        match status {
            ReferenceStatus::Locked => {
                self.reference_locked.store(true, Ordering::Release);
            }
            ReferenceStatus::NotLocked => {
                if self.reference_locked.swap(false, Ordering::AcqRel) {
                    warn!("reference lock lost, output timing may drift");
                    let _ = self.events.try_send(EngineEvent::GenlockLost);
                }
            }
        }
    }
}

impl DeviceCallbacks for SchedulerInner {
    fn frame_completed(&self, clock_pts_ms: i64, result: CompletionResult) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        match result {
            CompletionResult::Completed => {}
            CompletionResult::DisplayedLate => {
                warn!("frame at {clock_pts_ms}ms displayed late");
                // The missed display slot is gone; schedule past it
                self.total_frames.fetch_add(1, Ordering::AcqRel);
            }
            CompletionResult::Dropped => warn!("frame at {clock_pts_ms}ms dropped by device"),
            CompletionResult::Flushed => debug!("frame at {clock_pts_ms}ms flushed"),
        }
        self.video_clock_ms.store(clock_pts_ms, Ordering::Release);
        let completed = self.frames_completed.fetch_add(1, Ordering::AcqRel) + 1;
        self.check_reference();

        let end_frame = self.end_frame.load(Ordering::Acquire);
        if end_frame >= 0 {
            // Draining to the stop boundary
            if completed >= self.total_frames.load(Ordering::Acquire) {
                let mut device = lock_device(&self.device);
                if let Err(e) = device.stop_scheduled_playback(None) {
                    error!("stop at end of stream failed: {e}");
                }
            }
            return;
        }

        match self.pull_video(CALLBACK_POLL_LIMIT, false) {
            Pulled::Frame(frame) => {
                if let Err(e) = self.schedule_video(frame) {
                    error!("scheduling next frame failed: {e}");
                }
            }
            Pulled::EndOfStream | Pulled::Empty => {
                let boundary = self.total_frames.load(Ordering::Acquire);
                self.end_frame.store(boundary, Ordering::Release);
                info!("end of stream, stop boundary at frame {boundary}");
            }
        }
    }

    fn render_audio(&self, preroll: bool) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }

        let buffered = {
            let device = lock_device(&self.device);
            device.buffered_audio_samples()
        };
        // Keep one second of audio buffered
        if buffered < AUDIO_SAMPLE_RATE {
            if let Pulled::Frame(frame) = self.pull_audio(CALLBACK_POLL_LIMIT) {
                let sample_frames = (frame.size() / AUDIO_FRAME_BYTES) as i64;
                let offset = self.total_samples.load(Ordering::Acquire);
                let mut device = lock_device(&self.device);
                match device.schedule_audio(frame.into_data(), offset) {
                    Ok(()) => {
                        self.total_samples.fetch_add(sample_frames, Ordering::AcqRel);
                    }
                    Err(e) => error!("scheduling audio failed: {e}"),
                }
            }
        }

        if preroll && self.prerolling.load(Ordering::Acquire) {
            let count = self.preroll_callbacks.fetch_add(1, Ordering::AcqRel) + 1;
            if count > PREROLL_AUDIO_CALLBACKS {
                self.prerolling.store(false, Ordering::Release);
                let mut device = lock_device(&self.device);
                let ended = device.end_audio_preroll();
                let started = device.start_scheduled_playback();
                match ended.and(started) {
                    Ok(()) => info!("audio preroll complete, scheduled playback started"),
                    Err(e) => error!("starting scheduled playback failed: {e}"),
                }
            }
        }
    }

    fn playback_stopped(&self) {
        info!("scheduled playback stopped");
        self.running.store(false, Ordering::Release);
        self.prerolling.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::MediaKind;
    use std::sync::atomic::AtomicU32;

    struct MockState {
        callbacks: Mutex<Option<Arc<dyn DeviceCallbacks>>>,
        scheduled_frames: Mutex<Vec<(i64, i64, String)>>,
        scheduled_audio: Mutex<Vec<i64>>,
        buffered_samples: AtomicU32,
        prerolling: AtomicBool,
        playback_started: AtomicBool,
        stop_requests: Mutex<Vec<Option<i64>>>,
        reference: Mutex<ReferenceStatus>,
    }

    impl MockState {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                callbacks: Mutex::new(None),
                scheduled_frames: Mutex::new(Vec::new()),
                scheduled_audio: Mutex::new(Vec::new()),
                buffered_samples: AtomicU32::new(0),
                prerolling: AtomicBool::new(false),
                playback_started: AtomicBool::new(false),
                stop_requests: Mutex::new(Vec::new()),
                reference: Mutex::new(ReferenceStatus::Locked),
            })
        }

        fn callbacks(&self) -> Arc<dyn DeviceCallbacks> {
            Arc::clone(self.callbacks.lock().unwrap().as_ref().unwrap())
        }

        fn complete_frame(&self, clock_pts_ms: i64, result: CompletionResult) {
            self.callbacks().frame_completed(clock_pts_ms, result);
        }

        fn render_audio(&self, preroll: bool) {
            self.callbacks().render_audio(preroll);
        }

        fn frame_count(&self) -> usize {
            self.scheduled_frames.lock().unwrap().len()
        }
    }

    struct MockDevice {
        state: Arc<MockState>,
    }

    impl OutputDevice for MockDevice {
        fn enable(&mut self, _format: ChannelFormat) -> Result<(), DeviceError> {
            Ok(())
        }
        fn disable(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }
        fn set_callbacks(&mut self, callbacks: Arc<dyn DeviceCallbacks>) {
            *self.state.callbacks.lock().unwrap() = Some(callbacks);
        }
        fn display_frame(
            &mut self,
            _data: &[u8],
            _timecode: TimecodeParts,
        ) -> Result<(), DeviceError> {
            Ok(())
        }
        fn schedule_frame(
            &mut self,
            _data: Vec<u8>,
            display_time_ms: i64,
            _duration_ms: i64,
            timecode: TimecodeParts,
            clock_pts_ms: i64,
        ) -> Result<(), DeviceError> {
            self.state.scheduled_frames.lock().unwrap().push((
                display_time_ms,
                clock_pts_ms,
                timecode.to_string(),
            ));
            Ok(())
        }
        fn schedule_audio(
            &mut self,
            _samples: Vec<u8>,
            stream_sample_offset: i64,
        ) -> Result<(), DeviceError> {
            self.state
                .scheduled_audio
                .lock()
                .unwrap()
                .push(stream_sample_offset);
            Ok(())
        }
        fn buffered_audio_samples(&self) -> u32 {
            self.state.buffered_samples.load(Ordering::Acquire)
        }
        fn reference_status(&self) -> ReferenceStatus {
            *self.state.reference.lock().unwrap()
        }
        fn begin_audio_preroll(&mut self) -> Result<(), DeviceError> {
            self.state.prerolling.store(true, Ordering::Release);
            Ok(())
        }
        fn end_audio_preroll(&mut self) -> Result<(), DeviceError> {
            self.state.prerolling.store(false, Ordering::Release);
            Ok(())
        }
        fn start_scheduled_playback(&mut self) -> Result<(), DeviceError> {
            self.state.playback_started.store(true, Ordering::Release);
            Ok(())
        }
        fn stop_scheduled_playback(&mut self, at_time_ms: Option<i64>) -> Result<(), DeviceError> {
            self.state.stop_requests.lock().unwrap().push(at_time_ms);
            Ok(())
        }
    }

    struct Fixture {
        scheduler: HardwareScheduler,
        state: Arc<MockState>,
        video_queue: Arc<FrameQueue>,
        audio_queue: Arc<FrameQueue>,
        events: crossbeam_channel::Receiver<EngineEvent>,
    }

    fn fixture() -> Fixture {
        let state = MockState::new();
        let device: Box<dyn OutputDevice> = Box::new(MockDevice {
            state: Arc::clone(&state),
        });
        let device = Arc::new(Mutex::new(device));
        let video_queue = Arc::new(FrameQueue::new(50));
        let audio_queue = Arc::new(FrameQueue::new(100));
        let params = Arc::new(PlaybackParams::new());
        let clock = Arc::new(AtomicI64::new(0));
        let (tx, rx) = crossbeam_channel::unbounded();
        let scheduler = HardwareScheduler::new(
            device,
            Arc::clone(&video_queue),
            Arc::clone(&audio_queue),
            params,
            ChannelFormat::Pal,
            clock,
            tx,
        );
        Fixture {
            scheduler,
            state,
            video_queue,
            audio_queue,
            events: rx,
        }
    }

    fn fill_video(queue: &FrameQueue, count: usize) {
        for i in 0..count {
            let frame = Frame::new(MediaKind::Video, vec![0u8; 8], 40, i as i64 * 40);
            queue.try_push(Slot::Frame(frame)).unwrap();
        }
    }

    fn fill_audio(queue: &FrameQueue, blocks: usize) {
        for _ in 0..blocks {
            let frame = Frame::new(MediaKind::Audio, vec![0u8; 1920 * AUDIO_FRAME_BYTES], 40, 0);
            queue.try_push(Slot::Frame(frame)).unwrap();
        }
    }

    #[test]
    fn test_start_preloads_and_begins_preroll() {
        let f = fixture();
        fill_video(&f.video_queue, 20);
        f.scheduler.start_playback().unwrap();

        assert_eq!(f.state.frame_count(), PRELOAD_FRAMES);
        assert!(f.state.prerolling.load(Ordering::Acquire));
        assert!(!f.state.playback_started.load(Ordering::Acquire));

        // Frames sit at 40ms intervals with running timecodes
        let frames = f.state.scheduled_frames.lock().unwrap();
        assert_eq!(frames[0].0, 0);
        assert_eq!(frames[1].0, 40);
        assert_eq!(frames[0].2, "00:00:00:00");
        assert_eq!(frames[1].2, "00:00:00:01");
    }

    #[test]
    fn test_preroll_threshold_starts_playback() {
        let f = fixture();
        fill_video(&f.video_queue, 20);
        fill_audio(&f.audio_queue, 30);
        f.scheduler.start_playback().unwrap();

        for _ in 0..PREROLL_AUDIO_CALLBACKS {
            f.state.render_audio(true);
            assert!(!f.state.playback_started.load(Ordering::Acquire));
        }
        f.state.render_audio(true);
        assert!(f.state.playback_started.load(Ordering::Acquire));
        assert!(!f.state.prerolling.load(Ordering::Acquire));
    }

    #[test]
    fn test_completion_schedules_replacement() {
        let f = fixture();
        fill_video(&f.video_queue, 20);
        f.scheduler.start_playback().unwrap();
        assert_eq!(f.state.frame_count(), PRELOAD_FRAMES);

        f.state.complete_frame(0, CompletionResult::Completed);
        assert_eq!(f.state.frame_count(), PRELOAD_FRAMES + 1);

        // Late completions still keep the pipeline moving
        f.state.complete_frame(40, CompletionResult::DisplayedLate);
        assert_eq!(f.state.frame_count(), PRELOAD_FRAMES + 2);
    }

    #[test]
    fn test_timecode_follows_media_position() {
        let f = fixture();
        // Frames resuming mid-clip, as after a seek to 5000ms
        for i in 0..12 {
            let frame = Frame::new(MediaKind::Video, vec![0u8; 8], 40, 5000 + i * 40);
            f.video_queue.try_push(Slot::Frame(frame)).unwrap();
        }
        f.scheduler.start_playback().unwrap();

        let frames = f.state.scheduled_frames.lock().unwrap();
        assert_eq!(frames[0].2, "00:00:05:00");
        assert_eq!(frames[1].2, "00:00:05:01");
    }

    #[test]
    fn test_timecode_includes_start_offset() {
        let f = fixture();
        f.scheduler.set_start_offset_ms(10 * 3600 * 1000);
        fill_video(&f.video_queue, 12);
        f.scheduler.start_playback().unwrap();

        let frames = f.state.scheduled_frames.lock().unwrap();
        assert_eq!(frames[0].2, "10:00:00:00");
        assert_eq!(frames[1].2, "10:00:00:01");
    }

    #[test]
    fn test_late_completion_skips_a_display_slot() {
        let f = fixture();
        fill_video(&f.video_queue, 20);
        f.scheduler.start_playback().unwrap();

        f.state.complete_frame(0, CompletionResult::Completed);
        f.state.complete_frame(40, CompletionResult::DisplayedLate);
        let frames = f.state.scheduled_frames.lock().unwrap();
        // Preload filled slots 0..=9; the completed frame took 400, the
        // late one skips 440 and lands at 480
        assert_eq!(frames[PRELOAD_FRAMES].0, 400);
        assert_eq!(frames[PRELOAD_FRAMES + 1].0, 480);
    }

    #[test]
    fn test_graceful_stop_targets_last_scheduled_slot() {
        let f = fixture();
        fill_video(&f.video_queue, 3);
        f.video_queue.try_push(Slot::EndOfStream).unwrap();
        f.scheduler.start_playback().unwrap();
        assert_eq!(f.state.frame_count(), 3);

        f.scheduler.stop(false);
        // Three frames occupy slots 0, 40, 80; the drain stops at the last
        assert_eq!(f.state.stop_requests.lock().unwrap().as_slice(), &[Some(80)]);
    }

    #[test]
    fn test_empty_queue_sets_stop_boundary_and_drains() {
        let f = fixture();
        fill_video(&f.video_queue, 3);
        f.video_queue.try_push(Slot::EndOfStream).unwrap();
        f.scheduler.start_playback().unwrap();
        assert_eq!(f.state.frame_count(), 3);

        // Drain all three completions; the last one stops the device
        f.state.complete_frame(0, CompletionResult::Completed);
        f.state.complete_frame(40, CompletionResult::Completed);
        assert!(f.state.stop_requests.lock().unwrap().is_empty());
        f.state.complete_frame(80, CompletionResult::Completed);
        assert_eq!(f.state.stop_requests.lock().unwrap().len(), 1);

        f.state.callbacks().playback_stopped();
        assert!(f.scheduler.eof_reached());
    }

    #[test]
    fn test_audio_watermark_skips_pull_when_buffered() {
        let f = fixture();
        fill_video(&f.video_queue, 20);
        fill_audio(&f.audio_queue, 5);
        f.scheduler.start_playback().unwrap();

        f.state
            .buffered_samples
            .store(AUDIO_SAMPLE_RATE, Ordering::Release);
        f.state.render_audio(false);
        assert!(f.state.scheduled_audio.lock().unwrap().is_empty());

        f.state.buffered_samples.store(0, Ordering::Release);
        f.state.render_audio(false);
        let audio = f.state.scheduled_audio.lock().unwrap();
        assert_eq!(audio.len(), 1);
        assert_eq!(audio[0], 0);
    }

    #[test]
    fn test_audio_offset_advances_by_sample_frames() {
        let f = fixture();
        fill_video(&f.video_queue, 20);
        fill_audio(&f.audio_queue, 3);
        f.scheduler.start_playback().unwrap();

        f.state.render_audio(false);
        f.state.render_audio(false);
        let audio = f.state.scheduled_audio.lock().unwrap();
        assert_eq!(audio.as_slice(), &[0, 1920]);
    }

    #[test]
    fn test_genlock_loss_surfaces_once() {
        let f = fixture();
        fill_video(&f.video_queue, 20);
        f.scheduler.start_playback().unwrap();

        *f.state.reference.lock().unwrap() = ReferenceStatus::NotLocked;
        f.state.complete_frame(0, CompletionResult::Completed);
        f.state.complete_frame(40, CompletionResult::Completed);
        assert_eq!(f.events.try_iter().count(), 1);

        // Relock then lose again: a second event
        *f.state.reference.lock().unwrap() = ReferenceStatus::Locked;
        f.state.complete_frame(80, CompletionResult::Completed);
        *f.state.reference.lock().unwrap() = ReferenceStatus::NotLocked;
        f.state.complete_frame(120, CompletionResult::Completed);
        assert_eq!(f.events.try_iter().count(), 1);
    }

    #[test]
    fn test_immediate_stop_cancels() {
        let f = fixture();
        fill_video(&f.video_queue, 20);
        f.scheduler.start_playback().unwrap();
        f.scheduler.stop(true);

        assert_eq!(f.state.stop_requests.lock().unwrap().as_slice(), &[None]);
        // Callbacks after the stop are ignored
        let before = f.state.frame_count();
        f.state.complete_frame(0, CompletionResult::Completed);
        assert_eq!(f.state.frame_count(), before);
    }
}
