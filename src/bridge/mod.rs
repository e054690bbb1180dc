//! Live capture bridge.
//!
//! Ingest ports run no decode pipeline; the capture device's callback is
//! the producer. Every arriving block fans out to hardware pass-through,
//! the recording queues (only while armed) and the preview sink. The
//! callback runs on the driver's thread, so nothing here blocks: a full
//! recording queue means the block is simply not recorded.

pub mod recorder;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;
use log::{debug, warn};

use crate::core::channel::EngineEvent;
use crate::core::consumer::PreviewSink;
use crate::core::format::ChannelFormat;
use crate::core::frame::{Frame, MediaKind};
use crate::core::frame_queue::{FrameQueue, Slot};
use crate::core::timecode::TimecodeParts;
use crate::device::{CaptureSink, OutputDevice};

/// Black UYVY fill for the VANC rows ahead of the active picture.
fn vanc_black_prefix(len: usize) -> Vec<u8> {
    let mut rows = vec![0u8; len];
    for (i, byte) in rows.iter_mut().enumerate() {
        *byte = if i % 2 == 0 { 128 } else { 16 };
    }
    rows
}

pub struct IoBridge {
    output: Option<Arc<Mutex<Box<dyn OutputDevice>>>>,
    preview: Option<Arc<dyn PreviewSink>>,
    /// Next bridge in a monitoring chain, fed the same capture stream.
    chained: Option<Arc<dyn CaptureSink>>,
    events: Sender<EngineEvent>,

    format: Mutex<ChannelFormat>,
    recording: AtomicBool,
    record_video: Arc<FrameQueue>,
    record_audio: Arc<FrameQueue>,

    /// Clock positions for recorded blocks, advanced per arrival.
    video_frame_index: AtomicI64,
    audio_clock_ms: AtomicI64,
    /// Display slot and sample offset for pass-through scheduling.
    passthrough_frames: AtomicI64,
    passthrough_samples: AtomicI64,
    /// Scheduled playback on the output starts with the first audio block.
    playback_started: AtomicBool,
    last_timecode: Mutex<Option<String>>,
}

impl IoBridge {
    pub fn new(
        format: ChannelFormat,
        record_video: Arc<FrameQueue>,
        record_audio: Arc<FrameQueue>,
        events: Sender<EngineEvent>,
    ) -> Self {
        Self {
            output: None,
            preview: None,
            chained: None,
            events,
            format: Mutex::new(format),
            recording: AtomicBool::new(false),
            record_video,
            record_audio,
            video_frame_index: AtomicI64::new(0),
            audio_clock_ms: AtomicI64::new(0),
            passthrough_frames: AtomicI64::new(0),
            passthrough_samples: AtomicI64::new(0),
            playback_started: AtomicBool::new(false),
            last_timecode: Mutex::new(None),
        }
    }

    /// Attach the hardware pass-through output.
    pub fn with_output(mut self, output: Arc<Mutex<Box<dyn OutputDevice>>>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_preview(mut self, preview: Arc<dyn PreviewSink>) -> Self {
        self.preview = Some(preview);
        self
    }

    pub fn with_chain(mut self, next: Arc<dyn CaptureSink>) -> Self {
        self.chained = Some(next);
        self
    }

    /// Start routing arriving blocks into the recording queues.
    pub fn arm_recording(&self) {
        self.record_video.clear();
        self.record_audio.clear();
        self.video_frame_index.store(0, Ordering::Release);
        self.audio_clock_ms.store(0, Ordering::Release);
        self.recording.store(true, Ordering::Release);
    }

    pub fn disarm_recording(&self) {
        self.recording.store(false, Ordering::Release);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    /// Timecode of the most recent captured frame, used to seed recording
    /// outputs at the live position.
    pub fn timecode(&self) -> Option<String> {
        match self.last_timecode.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn change_format(&self, format: ChannelFormat) {
        let mut guard = match self.format.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = format;
        self.clear_buffers();
    }

    pub fn clear_buffers(&self) {
        self.record_video.clear();
        self.record_audio.clear();
        self.video_frame_index.store(0, Ordering::Release);
        self.audio_clock_ms.store(0, Ordering::Release);
        self.passthrough_frames.store(0, Ordering::Release);
        self.passthrough_samples.store(0, Ordering::Release);
        self.playback_started.store(false, Ordering::Release);
    }

    fn current_format(&self) -> ChannelFormat {
        match self.format.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl CaptureSink for IoBridge {
    fn video_arrived(&self, data: &[u8], timecode: Option<&str>) {
        let format = self.current_format();

        if let Some(tc) = timecode {
            let mut guard = match self.last_timecode.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = Some(tc.to_string());
        }

        // VANC rows are blacked out ahead of the active picture on SD
        let offset = format.video_offset();
        let framed: Vec<u8> = if offset > 0 {
            let mut buf = vanc_black_prefix(offset);
            buf.extend_from_slice(data);
            buf
        } else {
            data.to_vec()
        };

        if let Some(output) = &self.output {
            let slot = self.passthrough_frames.fetch_add(1, Ordering::AcqRel);
            let duration = format.frame_duration_ms();
            let display_time = (slot as f64 * duration) as i64;
            let timecode = TimecodeParts::from_frame_index(0, format.fps());
            let mut device = match output.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Err(e) = device.schedule_frame(
                framed.clone(),
                display_time,
                duration as i64,
                timecode,
                display_time,
            ) {
                warn!("pass-through scheduling failed: {e}");
            }
        }

        if self.recording.load(Ordering::Acquire) {
            let index = self.video_frame_index.fetch_add(1, Ordering::AcqRel);
            let clock_pts = (index as f64 * format.frame_duration_ms()) as i64;
            let frame = Frame::new(MediaKind::Video, framed, 0, clock_pts);
            if self.record_video.try_push(Slot::Frame(frame)).is_err() {
                warn!("recording queue full, video frame at {clock_pts}ms not recorded");
                let _ = self.events.try_send(EngineEvent::RecordingGap {
                    kind: MediaKind::Video,
                });
            }
        }

        if let Some(preview) = &self.preview {
            preview.video_frame(data);
        }
        if let Some(next) = &self.chained {
            next.video_arrived(data, timecode);
        }
    }

    fn audio_arrived(&self, samples: &[u8]) {
        use crate::core::format::AUDIO_FRAME_BYTES;

        if let Some(output) = &self.output {
            let offset = self.passthrough_samples.load(Ordering::Acquire);
            let mut device = match output.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // No preroll phase on a bridge; the first audio block starts
            // the output's scheduled playback clock
            if !self.playback_started.swap(true, Ordering::AcqRel) {
                if let Err(e) = device.start_scheduled_playback() {
                    warn!("starting pass-through playback failed: {e}");
                    self.playback_started.store(false, Ordering::Release);
                }
            }
            match device.schedule_audio(samples.to_vec(), offset) {
                Ok(()) => {
                    let sample_frames = (samples.len() / AUDIO_FRAME_BYTES) as i64;
                    self.passthrough_samples
                        .fetch_add(sample_frames, Ordering::AcqRel);
                }
                Err(e) => warn!("pass-through audio failed: {e}"),
            }
        }

        if self.recording.load(Ordering::Acquire) {
            let clock_pts = self.audio_clock_ms.load(Ordering::Acquire);
            let duration =
                crate::core::producer::audio_block_delta(samples.len(), 1.0);
            self.audio_clock_ms.fetch_add(duration, Ordering::AcqRel);
            let frame = Frame::new(MediaKind::Audio, samples.to_vec(), 0, clock_pts);
            if self.record_audio.try_push(Slot::Frame(frame)).is_err() {
                warn!("recording queue full, audio block at {clock_pts}ms not recorded");
                let _ = self.events.try_send(EngineEvent::RecordingGap {
                    kind: MediaKind::Audio,
                });
            }
        }

        if let Some(preview) = &self.preview {
            preview.audio_block(samples);
        }
        if let Some(next) = &self.chained {
            next.audio_arrived(samples);
        }
    }

    fn signal_lost(&self) {
        debug!("capture input signal lost");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCallbacks, ReferenceStatus};
    use crate::error::DeviceError;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct PassthroughState {
        video_slots: Mutex<Vec<i64>>,
        audio_offsets: Mutex<Vec<i64>>,
        starts: AtomicUsize,
    }

    struct PassthroughDevice {
        state: Arc<PassthroughState>,
    }

    impl OutputDevice for PassthroughDevice {
        fn enable(&mut self, _format: ChannelFormat) -> Result<(), DeviceError> {
            Ok(())
        }
        fn disable(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }
        fn set_callbacks(&mut self, _callbacks: Arc<dyn DeviceCallbacks>) {}
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
            _timecode: TimecodeParts,
            _clock_pts_ms: i64,
        ) -> Result<(), DeviceError> {
            self.state.video_slots.lock().unwrap().push(display_time_ms);
            Ok(())
        }
        fn schedule_audio(
            &mut self,
            _samples: Vec<u8>,
            stream_sample_offset: i64,
        ) -> Result<(), DeviceError> {
            self.state
                .audio_offsets
                .lock()
                .unwrap()
                .push(stream_sample_offset);
            Ok(())
        }
        fn buffered_audio_samples(&self) -> u32 {
            0
        }
        fn reference_status(&self) -> ReferenceStatus {
            ReferenceStatus::Locked
        }
        fn begin_audio_preroll(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }
        fn end_audio_preroll(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }
        fn start_scheduled_playback(&mut self) -> Result<(), DeviceError> {
            self.state.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn stop_scheduled_playback(&mut self, _at_time_ms: Option<i64>) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    fn bridge(format: ChannelFormat) -> (IoBridge, crossbeam_channel::Receiver<EngineEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let bridge = IoBridge::new(
            format,
            Arc::new(FrameQueue::new(4)),
            Arc::new(FrameQueue::new(4)),
            tx,
        );
        (bridge, rx)
    }

    #[test]
    fn test_vanc_prefix_pattern() {
        let prefix = vanc_black_prefix(8);
        assert_eq!(prefix, vec![128, 16, 128, 16, 128, 16, 128, 16]);
    }

    #[test]
    fn test_recording_disarmed_by_default() {
        let (bridge, _rx) = bridge(ChannelFormat::Hd1080i50);
        bridge.video_arrived(&[1, 2, 3], None);
        assert!(bridge.record_video.is_empty());
    }

    #[test]
    fn test_armed_recording_queues_frames_with_vanc() {
        let (bridge, _rx) = bridge(ChannelFormat::Pal);
        bridge.arm_recording();
        bridge.video_arrived(&[9, 9], Some("10:00:00:00"));

        assert_eq!(bridge.record_video.len(), 1);
        assert_eq!(bridge.timecode().as_deref(), Some("10:00:00:00"));
        let Some(Slot::Frame(frame)) = bridge.record_video.try_pop() else {
            panic!("expected a frame");
        };
        let offset = ChannelFormat::Pal.video_offset();
        assert_eq!(frame.size(), offset + 2);
        assert_eq!(frame.data()[0], 128);
        assert_eq!(frame.data()[1], 16);
        assert_eq!(frame.data()[offset], 9);
    }

    #[test]
    fn test_overflow_is_a_logged_gap_not_backpressure() {
        let (bridge, rx) = bridge(ChannelFormat::Hd1080i50);
        bridge.arm_recording();
        for _ in 0..6 {
            bridge.video_arrived(&[0], None);
        }
        // Queue capacity is 4; the two overflowing frames became gap events
        assert_eq!(bridge.record_video.len(), 4);
        let gaps = rx
            .try_iter()
            .filter(|e| matches!(e, EngineEvent::RecordingGap { .. }))
            .count();
        assert_eq!(gaps, 2);
    }

    #[test]
    fn test_recorded_video_clock_advances_per_frame() {
        let (bridge, _rx) = bridge(ChannelFormat::Hd1080i50);
        bridge.arm_recording();
        bridge.video_arrived(&[0], None);
        bridge.video_arrived(&[0], None);

        let mut clocks = Vec::new();
        while let Some(Slot::Frame(frame)) = bridge.record_video.try_pop() {
            clocks.push(frame.clock_pts_ms());
        }
        assert_eq!(clocks, vec![0, 40]);
    }

    #[test]
    fn test_passthrough_schedules_video_at_frame_slots() {
        let state = Arc::new(PassthroughState::default());
        let device: Box<dyn OutputDevice> = Box::new(PassthroughDevice {
            state: Arc::clone(&state),
        });
        let (tx, _rx) = crossbeam_channel::unbounded();
        let bridge = IoBridge::new(
            ChannelFormat::Hd1080i50,
            Arc::new(FrameQueue::new(4)),
            Arc::new(FrameQueue::new(4)),
            tx,
        )
        .with_output(Arc::new(Mutex::new(device)));

        bridge.video_arrived(&[0], None);
        bridge.video_arrived(&[0], None);
        bridge.video_arrived(&[0], None);
        assert_eq!(*state.video_slots.lock().unwrap(), vec![0, 40, 80]);
    }

    #[test]
    fn test_first_audio_block_starts_playback_once() {
        let state = Arc::new(PassthroughState::default());
        let device: Box<dyn OutputDevice> = Box::new(PassthroughDevice {
            state: Arc::clone(&state),
        });
        let (tx, _rx) = crossbeam_channel::unbounded();
        let bridge = IoBridge::new(
            ChannelFormat::Hd1080i50,
            Arc::new(FrameQueue::new(4)),
            Arc::new(FrameQueue::new(4)),
            tx,
        )
        .with_output(Arc::new(Mutex::new(device)));

        let block = vec![0u8; 1920 * crate::core::format::AUDIO_FRAME_BYTES];
        bridge.audio_arrived(&block);
        bridge.audio_arrived(&block);
        assert_eq!(state.starts.load(Ordering::SeqCst), 1);
        assert_eq!(*state.audio_offsets.lock().unwrap(), vec![0, 1920]);
    }

    #[test]
    fn test_chained_bridge_receives_stream() {
        struct CountingSink(AtomicUsize);
        impl CaptureSink for CountingSink {
            fn video_arrived(&self, _data: &[u8], _timecode: Option<&str>) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            fn audio_arrived(&self, _samples: &[u8]) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            fn signal_lost(&self) {}
        }

        let next = Arc::new(CountingSink(AtomicUsize::new(0)));
        let chained: Arc<dyn CaptureSink> = next.clone();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let bridge = IoBridge::new(
            ChannelFormat::Hd1080i50,
            Arc::new(FrameQueue::new(4)),
            Arc::new(FrameQueue::new(4)),
            tx,
        )
        .with_chain(chained);

        bridge.video_arrived(&[0], None);
        bridge.audio_arrived(&[0; 16]);
        assert_eq!(next.0.load(Ordering::SeqCst), 2);
    }
}
