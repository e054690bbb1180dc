// Bounded FIFO between the decode producer and a consumer.
//
// Push to a full queue and pop from an empty one never block in the `try_`
// variants; the blocking variants wait on a condition variable and bail out
// as soon as the shared stop flag is raised. Lock scope is the queue
// mutation only, nothing else runs under the mutex.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::core::frame::Frame;

/// How long a blocking push/pop waits before re-checking the stop flag.
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Queue entry. The producer pushes one `EndOfStream` per queue when the
/// input is exhausted; in loop mode the consumer skips over it.
#[derive(Debug)]
pub enum Slot {
    Frame(Frame),
    EndOfStream,
}

pub struct FrameQueue {
    slots: Mutex<VecDeque<Slot>>,
    space: Condvar,
    available: Condvar,
    capacity: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(VecDeque::with_capacity(capacity)),
            space: Condvar::new(),
            available: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-blocking push. Returns the slot back when the queue is full so
    /// the caller can retry or discard it.
    pub fn try_push(&self, slot: Slot) -> std::result::Result<(), Slot> {
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slots.len() >= self.capacity {
            return Err(slot);
        }
        slots.push_back(slot);
        self.available.notify_one();
        Ok(())
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<Slot> {
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let slot = slots.pop_front();
        if slot.is_some() {
            self.space.notify_one();
        }
        slot
    }

    /// Push, waiting for space. Returns the slot back when `stop` was raised
    /// before space appeared; the caller discards it.
    pub fn push_blocking(&self, slot: Slot, stop: &Arc<AtomicBool>) -> std::result::Result<(), Slot> {
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while slots.len() >= self.capacity {
            if stop.load(Ordering::Acquire) {
                return Err(slot);
            }
            let (guard, _) = match self.space.wait_timeout(slots, WAIT_SLICE) {
                Ok(res) => res,
                Err(poisoned) => poisoned.into_inner(),
            };
            slots = guard;
        }
        slots.push_back(slot);
        self.available.notify_one();
        Ok(())
    }

    /// Pop, waiting for a slot. Returns `None` when `stop` was raised while
    /// the queue stayed empty.
    pub fn pop_blocking(&self, stop: &Arc<AtomicBool>) -> Option<Slot> {
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            if let Some(slot) = slots.pop_front() {
                self.space.notify_one();
                return Some(slot);
            }
            if stop.load(Ordering::Acquire) {
                return None;
            }
            let (guard, _) = match self.available.wait_timeout(slots, WAIT_SLICE) {
                Ok(res) => res,
                Err(poisoned) => poisoned.into_inner(),
            };
            slots = guard;
        }
    }

    /// Discard everything queued. Waiting producers are woken so they can
    /// re-check their stop flags.
    pub fn clear(&self) {
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.clear();
        self.space.notify_all();
    }

    /// Copy of the first queued frame's payload and clock position, used for
    /// the recue pre-display. The frame stays queued.
    pub fn front_frame_copy(&self) -> Option<(Vec<u8>, i64)> {
        let slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.iter().find_map(|slot| match slot {
            Slot::Frame(frame) => Some((frame.data().to_vec(), frame.clock_pts_ms())),
            Slot::EndOfStream => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::{Frame, MediaKind};

    fn video_frame(clock_pts: i64) -> Slot {
        Slot::Frame(Frame::new(MediaKind::Video, vec![0u8; 16], 40, clock_pts))
    }

    #[test]
    fn test_push_beyond_capacity_is_rejected() {
        let queue = FrameQueue::new(3);
        for i in 0..3 {
            assert!(queue.try_push(video_frame(i * 40)).is_ok());
        }
        assert_eq!(queue.len(), 3);

        // Fourth push is returned to the caller, length never exceeds capacity
        let rejected = queue.try_push(video_frame(120));
        assert!(rejected.is_err());
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_pop_order_is_push_order() {
        let queue = FrameQueue::new(8);
        for i in 0..5 {
            queue.try_push(video_frame(i * 40)).unwrap();
        }

        let mut last = -1;
        while let Some(Slot::Frame(frame)) = queue.try_pop() {
            assert!(frame.clock_pts_ms() > last);
            last = frame.clock_pts_ms();
        }
        assert_eq!(last, 160);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_empty_returns_none() {
        let queue = FrameQueue::new(2);
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_blocking_push_abandons_on_stop() {
        let queue = FrameQueue::new(1);
        queue.try_push(video_frame(0)).unwrap();

        let stop = Arc::new(AtomicBool::new(true));
        let result = queue.push_blocking(video_frame(40), &stop);
        assert!(result.is_err());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_blocking_pop_returns_none_on_stop() {
        let queue = FrameQueue::new(1);
        let stop = Arc::new(AtomicBool::new(true));
        assert!(queue.pop_blocking(&stop).is_none());
    }

    #[test]
    fn test_blocking_push_wakes_on_pop() {
        let queue = Arc::new(FrameQueue::new(1));
        queue.try_push(video_frame(0)).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let producer = {
            let queue = Arc::clone(&queue);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || queue.push_blocking(video_frame(40), &stop).is_ok())
        };

        std::thread::sleep(Duration::from_millis(20));
        assert!(queue.try_pop().is_some());
        assert!(producer.join().unwrap());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_front_frame_copy_does_not_consume() {
        let queue = FrameQueue::new(4);
        queue.try_push(video_frame(200)).unwrap();

        let (data, clock_pts) = queue.front_frame_copy().unwrap();
        assert_eq!(data.len(), 16);
        assert_eq!(clock_pts, 200);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_clear_discards_all() {
        let queue = FrameQueue::new(4);
        queue.try_push(video_frame(0)).unwrap();
        queue.try_push(Slot::EndOfStream).unwrap();
        queue.clear();
        assert!(queue.is_empty());
    }
}
