//! Playback pipeline: decode producer, bounded frame queues, the playout
//! state machine and both consumer sides (software clock and hardware
//! scheduler).

pub mod channel;
pub mod consumer;
pub mod format;
pub mod frame;
pub mod frame_queue;
pub(crate) mod producer;
pub(crate) mod scheduler;
pub mod source;
pub mod timecode;
