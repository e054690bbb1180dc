// Decode producer thread.
//
// Pulls decoded units from the media source, stamps presentation deltas and
// clock positions, and offers frames to the queues. Backpressure is the only
// throttle: a full queue parks the push until space appears or stop is
// raised. The producer never drops frames and never paces against the wall
// clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, error, info, warn};

use crate::core::channel::PlaybackParams;
use crate::core::format::{AUDIO_FRAME_BYTES, AUDIO_SAMPLE_RATE};
use crate::core::frame::{Frame, MediaKind};
use crate::core::frame_queue::{FrameQueue, Slot};
use crate::core::source::{DecodedUnit, MediaSource, SeekDirection};

/// Presentation delta for a video frame: the gap to the previous frame in
/// milliseconds, divided by the playback rate. The first frame after a
/// load/seek gets one nominal frame interval.
pub(crate) fn video_presentation_delta(
    pts_seconds: f64,
    last_pts_seconds: Option<f64>,
    fps: f64,
    rate: f64,
) -> i64 {
    let diff_ms = match last_pts_seconds {
        None => 1000.0 / fps,
        Some(last) => ((pts_seconds - last) * 1000.0 + 0.5).floor(),
    };
    (diff_ms / rate) as i64
}

/// Duration covered by an interleaved audio block, rate-adjusted.
pub(crate) fn audio_block_delta(block_len: usize, rate: f64) -> i64 {
    let sample_frames = block_len / AUDIO_FRAME_BYTES;
    let duration_ms = sample_frames as f64 * 1000.0 / AUDIO_SAMPLE_RATE as f64;
    (duration_ms / rate) as i64
}

/// Collects per-substream mono planes and interleaves them into one block
/// across all output channels once every substream of a group is present.
/// Missing output channels are zero-filled.
pub(crate) struct SubstreamInterleaver {
    expected: usize,
    planes: Vec<Option<Vec<u8>>>,
}

impl SubstreamInterleaver {
    pub(crate) fn new(expected: usize) -> Self {
        Self {
            expected,
            planes: (0..expected).map(|_| None).collect(),
        }
    }

    pub(crate) fn push(&mut self, substream: usize, data: Vec<u8>) -> Option<Vec<u8>> {
        if substream >= self.expected {
            warn!("audio substream {substream} out of range, dropping plane");
            return None;
        }
        if self.planes[substream].is_some() {
            debug!("substream {substream} seen twice before group completed");
        }
        self.planes[substream] = Some(data);
        if self.planes.iter().any(|p| p.is_none()) {
            return None;
        }

        let sample_frames = self
            .planes
            .iter()
            .flatten()
            .map(|p| p.len() / 2)
            .min()
            .unwrap_or(0);
        let mut out = vec![0u8; sample_frames * AUDIO_FRAME_BYTES];
        for (channel, plane) in self.planes.iter().flatten().enumerate() {
            for sample in 0..sample_frames {
                let src = sample * 2;
                let dst = sample * AUDIO_FRAME_BYTES + channel * 2;
                out[dst] = plane[src];
                out[dst + 1] = plane[src + 1];
            }
        }
        for plane in &mut self.planes {
            *plane = None;
        }
        Some(out)
    }

    pub(crate) fn reset(&mut self) {
        for plane in &mut self.planes {
            *plane = None;
        }
    }
}

pub(crate) struct DecodeProducer {
    source: Arc<Mutex<Box<dyn MediaSource>>>,
    video_queue: Arc<FrameQueue>,
    audio_queue: Arc<FrameQueue>,
    params: Arc<PlaybackParams>,
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DecodeProducer {
    pub(crate) fn new(
        source: Arc<Mutex<Box<dyn MediaSource>>>,
        video_queue: Arc<FrameQueue>,
        audio_queue: Arc<FrameQueue>,
        params: Arc<PlaybackParams>,
    ) -> Self {
        Self {
            source,
            video_queue,
            audio_queue,
            params,
            stop: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Spawn the decode loop. Restartable: `stop()` then `start()` begins a
    /// fresh pass from the source's current position with reset accumulators.
    pub(crate) fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        self.stop.store(false, Ordering::Release);
        self.finished.store(false, Ordering::Release);

        let source = Arc::clone(&self.source);
        let video_queue = Arc::clone(&self.video_queue);
        let audio_queue = Arc::clone(&self.audio_queue);
        let params = Arc::clone(&self.params);
        let stop = Arc::clone(&self.stop);
        let finished = Arc::clone(&self.finished);

        let result = std::thread::Builder::new()
            .name("decode-producer".to_string())
            .spawn(move || {
                decode_loop(source, video_queue, audio_queue, params, stop, finished);
            });
        match result {
            Ok(handle) => self.handle = Some(handle),
            Err(e) => error!("failed to spawn decode producer: {e}"),
        }
    }

    /// Cooperative stop, joined before returning.
    pub(crate) fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("decode producer thread panicked");
            }
        }
    }

    /// True once the loop exited after pushing its end-of-stream sentinels.
    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for DecodeProducer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn decode_loop(
    source: Arc<Mutex<Box<dyn MediaSource>>>,
    video_queue: Arc<FrameQueue>,
    audio_queue: Arc<FrameQueue>,
    params: Arc<PlaybackParams>,
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
) {
    let (fps, substreams) = {
        let guard = match source.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        (guard.info().detected_fps, guard.info().audio_substreams)
    };
    let mut interleaver = SubstreamInterleaver::new(substreams.max(1));
    let mut last_video_pts: Option<f64> = None;
    let mut audio_clock_ms: i64 = 0;

    loop {
        if stop.load(Ordering::Acquire) {
            debug!("decode producer received stop");
            break;
        }

        let unit = {
            let mut guard = match source.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.next_unit()
        };

        match unit {
            Ok(DecodedUnit::Video { data, pts_seconds }) => {
                let rate = params.rate();
                let delta = video_presentation_delta(pts_seconds, last_video_pts, fps, rate);
                last_video_pts = Some(pts_seconds);
                let clock_pts = (pts_seconds * 1000.0) as i64;
                let frame = Frame::new(MediaKind::Video, data, delta, clock_pts);
                if video_queue.push_blocking(Slot::Frame(frame), &stop).is_err() {
                    // stop raised while the queue was full; frame discarded
                    break;
                }
            }
            Ok(DecodedUnit::Audio { data }) => {
                if !push_audio_block(&audio_queue, &params, &stop, data, &mut audio_clock_ms) {
                    break;
                }
            }
            Ok(DecodedUnit::AudioPlane { substream, data }) => {
                if let Some(block) = interleaver.push(substream, data) {
                    if !push_audio_block(&audio_queue, &params, &stop, block, &mut audio_clock_ms) {
                        break;
                    }
                }
            }
            Ok(DecodedUnit::EndOfStream) => {
                if video_queue.push_blocking(Slot::EndOfStream, &stop).is_err()
                    || audio_queue.push_blocking(Slot::EndOfStream, &stop).is_err()
                {
                    break;
                }
                if params.looping() {
                    debug!("end of stream, looping back to start");
                    let seek_result = {
                        let mut guard = match source.lock() {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        guard.seek(0, SeekDirection::Backward)
                    };
                    if let Err(e) = seek_result {
                        error!("loop seek failed, ending playback: {e}");
                        finished.store(true, Ordering::Release);
                        break;
                    }
                    last_video_pts = None;
                    audio_clock_ms = 0;
                    interleaver.reset();
                    continue;
                }
                info!("decode producer reached end of stream");
                finished.store(true, Ordering::Release);
                break;
            }
            Err(e) => {
                error!("unrecoverable source error, ending stream: {e}");
                let _ = video_queue.push_blocking(Slot::EndOfStream, &stop);
                let _ = audio_queue.push_blocking(Slot::EndOfStream, &stop);
                finished.store(true, Ordering::Release);
                break;
            }
        }
    }
}

fn push_audio_block(
    audio_queue: &Arc<FrameQueue>,
    params: &Arc<PlaybackParams>,
    stop: &Arc<AtomicBool>,
    data: Vec<u8>,
    audio_clock_ms: &mut i64,
) -> bool {
    let delta = audio_block_delta(data.len(), params.rate());
    let raw_duration = audio_block_delta(data.len(), 1.0);
    let frame = Frame::new(MediaKind::Audio, data, delta, *audio_clock_ms);
    *audio_clock_ms += raw_duration;
    audio_queue.push_blocking(Slot::Frame(frame), stop).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::source::fake::FakeSource;

    #[test]
    fn test_first_frame_delta_is_nominal_interval() {
        let delta = video_presentation_delta(5.0, None, 25.0, 1.0);
        assert_eq!(delta, 40);
    }

    #[test]
    fn test_delta_from_previous_frame() {
        let delta = video_presentation_delta(1.04, Some(1.0), 25.0, 1.0);
        assert_eq!(delta, 40);
    }

    #[test]
    fn test_delta_is_rate_scaled() {
        let delta = video_presentation_delta(1.04, Some(1.0), 25.0, 2.0);
        assert_eq!(delta, 20);
        let delta = video_presentation_delta(1.04, Some(1.0), 25.0, 0.5);
        assert_eq!(delta, 80);
    }

    #[test]
    fn test_audio_block_delta() {
        // 48000 sample frames = 1 second
        let block = 48_000 * AUDIO_FRAME_BYTES;
        assert_eq!(audio_block_delta(block, 1.0), 1000);
        assert_eq!(audio_block_delta(block, 2.0), 500);
    }

    #[test]
    fn test_interleaver_waits_for_all_substreams() {
        let mut interleaver = SubstreamInterleaver::new(2);
        assert!(interleaver.push(0, vec![1, 0, 2, 0]).is_none());
        let block = interleaver.push(1, vec![3, 0, 4, 0]).unwrap();

        // Two sample frames, each AUDIO_FRAME_BYTES wide
        assert_eq!(block.len(), 2 * AUDIO_FRAME_BYTES);
        // First sample: channel 0 then channel 1, remaining channels zero
        assert_eq!(block[0], 1);
        assert_eq!(block[2], 3);
        assert_eq!(block[4], 0);
        // Second sample
        assert_eq!(block[AUDIO_FRAME_BYTES], 2);
        assert_eq!(block[AUDIO_FRAME_BYTES + 2], 4);
    }

    #[test]
    fn test_interleaver_resets_after_group() {
        let mut interleaver = SubstreamInterleaver::new(2);
        interleaver.push(0, vec![1, 0]);
        interleaver.push(1, vec![2, 0]);
        // Next group starts over
        assert!(interleaver.push(0, vec![5, 0]).is_none());
    }

    #[test]
    fn test_producer_fills_queue_and_signals_eof() {
        let source: Box<dyn MediaSource> = Box::new(FakeSource::new(200, 25.0).video_only());
        let source = Arc::new(Mutex::new(source));
        let video_queue = Arc::new(FrameQueue::new(50));
        let audio_queue = Arc::new(FrameQueue::new(100));
        let params = Arc::new(PlaybackParams::new());

        let mut producer = DecodeProducer::new(
            source,
            Arc::clone(&video_queue),
            Arc::clone(&audio_queue),
            params,
        );
        producer.start();

        // 5 frames plus the sentinel
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while !producer.is_finished() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        producer.stop();

        assert!(producer.is_finished());
        assert_eq!(video_queue.len(), 6);
        let mut frames = 0;
        let mut sentinel = false;
        while let Some(slot) = video_queue.try_pop() {
            match slot {
                Slot::Frame(_) => frames += 1,
                Slot::EndOfStream => sentinel = true,
            }
        }
        assert_eq!(frames, 5);
        assert!(sentinel);
    }

    #[test]
    fn test_producer_stops_cleanly_against_full_queue() {
        let source: Box<dyn MediaSource> = Box::new(FakeSource::new(10_000, 25.0).video_only());
        let source = Arc::new(Mutex::new(source));
        // Tiny queue so the producer parks on backpressure immediately
        let video_queue = Arc::new(FrameQueue::new(2));
        let audio_queue = Arc::new(FrameQueue::new(2));
        let params = Arc::new(PlaybackParams::new());

        let mut producer = DecodeProducer::new(
            source,
            Arc::clone(&video_queue),
            audio_queue,
            params,
        );
        producer.start();
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(video_queue.len(), 2);

        // Must join promptly even though the queue never drains
        producer.stop();
        assert!(!producer.is_finished());
    }
}
