// Recorder thread for ingest ports.
//
// Pulls whichever of the two recording queues has the lower already-muxed
// timestamp, which keeps interleave order correct without sorting. Encoder
// faults restart the current output into a fresh timestamped file; after
// too many consecutive faults the recorder gives up and tells the operator.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::Sender;
use log::{error, info, warn};

use crate::core::channel::EngineEvent;
use crate::core::format::ChannelFormat;
use crate::core::frame::{Frame, MediaKind};
use crate::core::frame_queue::{FrameQueue, Slot};
use crate::error::RecordError;

/// Silent restarts tolerated before escalating.
const MAX_CONSECUTIVE_RESTARTS: u32 = 5;
const IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Encode/mux library boundary. Write calls return the stream's running
/// muxed timestamp in milliseconds.
pub trait RecordSink: Send {
    fn open(
        &mut self,
        path: &str,
        format: ChannelFormat,
        timecode: Option<&str>,
    ) -> Result<(), RecordError>;

    fn write_video(&mut self, frame: &[u8]) -> Result<i64, RecordError>;

    fn write_audio(&mut self, samples: &[u8]) -> Result<i64, RecordError>;

    /// Flush and finalize the output. Returns the recorded duration.
    fn close(&mut self) -> Result<i64, RecordError>;
}

pub struct Recorder {
    video_queue: Arc<FrameQueue>,
    audio_queue: Arc<FrameQueue>,
    format: ChannelFormat,
    sink: Arc<Mutex<Box<dyn RecordSink>>>,
    events: Sender<EngineEvent>,
    stop: Arc<AtomicBool>,
    recording: Arc<AtomicBool>,
    video_frames_written: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl Recorder {
    pub fn new(
        video_queue: Arc<FrameQueue>,
        audio_queue: Arc<FrameQueue>,
        format: ChannelFormat,
        sink: Box<dyn RecordSink>,
        events: Sender<EngineEvent>,
    ) -> Self {
        Self {
            video_queue,
            audio_queue,
            format,
            sink: Arc::new(Mutex::new(sink)),
            events,
            stop: Arc::new(AtomicBool::new(false)),
            recording: Arc::new(AtomicBool::new(false)),
            video_frames_written: Arc::new(AtomicU64::new(0)),
            handle: None,
        }
    }

    /// Open the output and start the drain thread. `timecode` seeds the
    /// file's start timecode from the live signal when available.
    pub fn start(&mut self, path: &str, timecode: Option<&str>) -> Result<(), RecordError> {
        if self.recording.load(Ordering::Acquire) {
            return Ok(());
        }
        {
            let mut sink = lock_sink(&self.sink);
            sink.open(path, self.format, timecode)?;
        }
        self.stop.store(false, Ordering::Release);
        self.video_frames_written.store(0, Ordering::Release);
        self.recording.store(true, Ordering::Release);

        let worker = Worker {
            video_queue: Arc::clone(&self.video_queue),
            audio_queue: Arc::clone(&self.audio_queue),
            format: self.format,
            sink: Arc::clone(&self.sink),
            events: self.events.clone(),
            stop: Arc::clone(&self.stop),
            recording: Arc::clone(&self.recording),
            video_frames_written: Arc::clone(&self.video_frames_written),
            base_path: path.to_string(),
        };
        match std::thread::Builder::new()
            .name("recorder".to_string())
            .spawn(move || worker.run())
        {
            Ok(handle) => {
                self.handle = Some(handle);
                info!("recording started to '{path}'");
                Ok(())
            }
            Err(e) => {
                self.recording.store(false, Ordering::Release);
                let _ = lock_sink(&self.sink).close();
                Err(RecordError::OpenFailed {
                    path: path.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Drain both queues, close the output and join. Returns the recorded
    /// duration when the close succeeded.
    pub fn stop(&mut self) -> Option<i64> {
        if !self.recording.swap(false, Ordering::AcqRel) && self.handle.is_none() {
            return None;
        }
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("recorder thread panicked");
            }
        }
        let duration = {
            let mut sink = lock_sink(&self.sink);
            sink.close().ok()
        };
        self.video_queue.clear();
        self.audio_queue.clear();
        if let Some(ms) = duration {
            info!("recording stopped, {ms}ms written");
        }
        duration
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    /// Running record time from the muxed video frame count.
    pub fn record_time_ms(&self) -> i64 {
        let frames = self.video_frames_written.load(Ordering::Acquire);
        (frames as f64 * self.format.frame_duration_ms()) as i64
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock_sink(sink: &Arc<Mutex<Box<dyn RecordSink>>>) -> std::sync::MutexGuard<'_, Box<dyn RecordSink>> {
    match sink.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Worker {
    video_queue: Arc<FrameQueue>,
    audio_queue: Arc<FrameQueue>,
    format: ChannelFormat,
    sink: Arc<Mutex<Box<dyn RecordSink>>>,
    events: Sender<EngineEvent>,
    stop: Arc<AtomicBool>,
    recording: Arc<AtomicBool>,
    video_frames_written: Arc<AtomicU64>,
    base_path: String,
}

impl Worker {
    fn run(self) {
        let mut video_pts: i64 = 0;
        let mut audio_pts: i64 = 0;
        let mut restarts: u32 = 0;

        loop {
            if self.stop.load(Ordering::Acquire) {
                self.drain(&mut video_pts, &mut audio_pts);
                break;
            }

            // Pull from the stream that is behind in the mux, falling back
            // to the other one when that queue has nothing to offer
            let pull_audio = if self.audio_queue.is_empty() {
                false
            } else if self.video_queue.is_empty() {
                true
            } else {
                audio_pts < video_pts
            };
            let slot = if pull_audio {
                self.audio_queue.try_pop()
            } else {
                self.video_queue.try_pop()
            };

            let frame = match slot {
                Some(Slot::Frame(frame)) => frame,
                // Capture queues carry no sentinels; skip if one appears
                Some(Slot::EndOfStream) => continue,
                None => {
                    std::thread::sleep(IDLE_SLEEP);
                    continue;
                }
            };

            match self.write(&frame, &mut video_pts, &mut audio_pts) {
                Ok(()) => restarts = 0,
                Err(e) => {
                    if !self.handle_fault(e, &mut restarts, &mut video_pts, &mut audio_pts) {
                        break;
                    }
                }
            }
        }
    }

    fn write(
        &self,
        frame: &Frame,
        video_pts: &mut i64,
        audio_pts: &mut i64,
    ) -> Result<(), RecordError> {
        let mut sink = lock_sink(&self.sink);
        match frame.kind() {
            MediaKind::Video => {
                *video_pts = sink.write_video(frame.data())?;
                self.video_frames_written.fetch_add(1, Ordering::AcqRel);
            }
            MediaKind::Audio => {
                *audio_pts = sink.write_audio(frame.data())?;
            }
        }
        Ok(())
    }

    /// Restart the output after an encoder fault. Returns false once the
    /// recorder has escalated and must stop.
    fn handle_fault(
        &self,
        fault: RecordError,
        restarts: &mut u32,
        video_pts: &mut i64,
        audio_pts: &mut i64,
    ) -> bool {
        *restarts += 1;
        if *restarts > MAX_CONSECUTIVE_RESTARTS {
            error!("recorder giving up after {restarts} consecutive faults: {fault}");
            let _ = self.events.try_send(EngineEvent::RecorderEscalated {
                consecutive_faults: *restarts,
            });
            let _ = lock_sink(&self.sink).close();
            self.video_queue.clear();
            self.audio_queue.clear();
            self.recording.store(false, Ordering::Release);
            return false;
        }

        warn!("encoder fault ({fault}), restarting output (attempt {restarts})");
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let new_path = restart_path(&self.base_path, now);

        let mut sink = lock_sink(&self.sink);
        let _ = sink.close();
        match sink.open(&new_path, self.format, None) {
            Ok(()) => {
                *video_pts = 0;
                *audio_pts = 0;
                let _ = self
                    .events
                    .try_send(EngineEvent::RecorderRestarted { path: new_path });
                true
            }
            Err(e) => {
                error!("reopening recorder output failed: {e}");
                let _ = self.events.try_send(EngineEvent::RecorderEscalated {
                    consecutive_faults: *restarts,
                });
                self.recording.store(false, Ordering::Release);
                false
            }
        }
    }

    /// Write out everything still queued, in mux order.
    fn drain(&self, video_pts: &mut i64, audio_pts: &mut i64) {
        loop {
            let pull_audio = if self.audio_queue.is_empty() {
                false
            } else if self.video_queue.is_empty() {
                true
            } else {
                *audio_pts < *video_pts
            };
            let slot = if pull_audio {
                self.audio_queue.try_pop()
            } else {
                self.video_queue.try_pop()
            };
            let frame = match slot {
                Some(Slot::Frame(frame)) => frame,
                Some(Slot::EndOfStream) => continue,
                None => break,
            };
            if let Err(e) = self.write(&frame, video_pts, audio_pts) {
                warn!("fault while draining recording, remaining frames lost: {e}");
                break;
            }
        }
    }
}

/// Insert a `_YYYYmmdd_HHMMSS` suffix before the extension.
fn restart_path(base: &str, epoch_secs: u64) -> String {
    let suffix = timestamp_suffix(epoch_secs);
    match base.rfind('.') {
        Some(dot) if dot > base.rfind('/').map(|s| s + 1).unwrap_or(0) => {
            format!("{}_{}{}", &base[..dot], suffix, &base[dot..])
        }
        _ => format!("{base}_{suffix}"),
    }
}

/// UTC wall-clock timestamp without pulling in a date dependency.
fn timestamp_suffix(epoch_secs: u64) -> String {
    let days = epoch_secs / 86_400;
    let rem = epoch_secs % 86_400;
    let (year, month, day) = civil_from_days(days as i64);
    format!(
        "{year:04}{month:02}{day:02}_{:02}{:02}{:02}",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

/// Days since 1970-01-01 to a civil date (proleptic Gregorian).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = if month <= 2 { year + 1 } else { year };
    (year, month, day)
}
