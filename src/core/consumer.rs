// Software clock consumers.
//
// Preview-only channels have no device callback to pace them, so one thread
// per media kind drains its queue in real time by sleeping out each frame's
// presentation delta. A/V sync is reconstructed independently per thread
// against the shared decode timeline, there is no cross-queue barrier.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error};

use crate::core::channel::PlaybackParams;
use crate::core::frame_queue::{FrameQueue, Slot};

/// Downstream display for the preview signal. Absent on channels that only
/// drive hardware.
pub trait PreviewSink: Send + Sync {
    fn video_frame(&self, data: &[u8]);

    fn audio_block(&self, samples: &[u8]) {
        let _ = samples;
    }
}

pub(crate) struct ConsumerPair {
    stop: Arc<AtomicBool>,
    video_done: Arc<AtomicBool>,
    audio_done: Arc<AtomicBool>,
    video_handle: Option<JoinHandle<()>>,
    audio_handle: Option<JoinHandle<()>>,
}

impl ConsumerPair {
    pub(crate) fn start(
        video_queue: Arc<FrameQueue>,
        audio_queue: Arc<FrameQueue>,
        params: Arc<PlaybackParams>,
        video_clock_ms: Arc<AtomicI64>,
        preview: Option<Arc<dyn PreviewSink>>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let video_done = Arc::new(AtomicBool::new(false));
        let audio_done = Arc::new(AtomicBool::new(false));

        let video_handle = {
            let queue = video_queue;
            let params = Arc::clone(&params);
            let stop = Arc::clone(&stop);
            let done = Arc::clone(&video_done);
            let preview = preview.clone();
            spawn_consumer("video-consumer", move || {
                video_loop(queue, params, stop, done, video_clock_ms, preview);
            })
        };

        let audio_handle = {
            let queue = audio_queue;
            let stop = Arc::clone(&stop);
            let done = Arc::clone(&audio_done);
            spawn_consumer("audio-consumer", move || {
                audio_loop(queue, params, stop, done, preview);
            })
        };

        Self {
            stop,
            video_done,
            audio_done,
            video_handle,
            audio_handle,
        }
    }

    /// Cooperative stop, joined. Safe to call on already-finished threads.
    pub(crate) fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        for handle in [self.video_handle.take(), self.audio_handle.take()]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                error!("consumer thread panicked");
            }
        }
    }

    /// Both threads observed their end-of-stream sentinel.
    pub(crate) fn both_finished(&self) -> bool {
        self.video_done.load(Ordering::Acquire) && self.audio_done.load(Ordering::Acquire)
    }
}

impl Drop for ConsumerPair {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_consumer<F>(name: &str, body: F) -> Option<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    match std::thread::Builder::new().name(name.to_string()).spawn(body) {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!("failed to spawn {name}: {e}");
            None
        }
    }
}

fn video_loop(
    queue: Arc<FrameQueue>,
    params: Arc<PlaybackParams>,
    stop: Arc<AtomicBool>,
    done: Arc<AtomicBool>,
    video_clock_ms: Arc<AtomicI64>,
    preview: Option<Arc<dyn PreviewSink>>,
) {
    let mut next_due = Instant::now();
    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        match queue.pop_blocking(&stop) {
            None => break,
            Some(Slot::EndOfStream) => {
                if params.looping() {
                    // Loop boundary, keep draining without a pace reset
                    continue;
                }
                debug!("video consumer reached end of stream");
                done.store(true, Ordering::Release);
                break;
            }
            Some(Slot::Frame(frame)) => {
                next_due += Duration::from_millis(frame.pts_delta_ms().max(0) as u64);
                let now = Instant::now();
                if next_due > now {
                    std::thread::sleep(next_due - now);
                } else {
                    // Fell behind; re-home the pace instead of racing ahead
                    next_due = now;
                }
                video_clock_ms.store(frame.clock_pts_ms(), Ordering::Release);
                if let Some(sink) = &preview {
                    sink.video_frame(frame.data());
                }
            }
        }
    }
}

fn audio_loop(
    queue: Arc<FrameQueue>,
    params: Arc<PlaybackParams>,
    stop: Arc<AtomicBool>,
    done: Arc<AtomicBool>,
    preview: Option<Arc<dyn PreviewSink>>,
) {
    let mut next_due = Instant::now();
    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        match queue.pop_blocking(&stop) {
            None => break,
            Some(Slot::EndOfStream) => {
                if params.looping() {
                    continue;
                }
                debug!("audio consumer reached end of stream");
                done.store(true, Ordering::Release);
                break;
            }
            Some(Slot::Frame(frame)) => {
                next_due += Duration::from_millis(frame.pts_delta_ms().max(0) as u64);
                let now = Instant::now();
                if next_due > now {
                    std::thread::sleep(next_due - now);
                } else {
                    next_due = now;
                }
                // Preview audio is muted during trick play
                if params.rate() == 1.0 {
                    if let Some(sink) = &preview {
                        sink.audio_block(frame.data());
                    }
                }
            }
        }
    }
}
