//! Decoded media payloads handed between pipeline stages.
//!
//! A `Frame` owns its byte buffer outright. Pushing it into a queue moves it;
//! whoever pops it is the sole owner and drops it when done. Nothing in the
//! pipeline shares a frame between two consumers.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

#[derive(Debug)]
pub struct Frame {
    kind: MediaKind,
    data: Vec<u8>,
    /// Inter-frame presentation delta in milliseconds, already divided by the
    /// playback rate. Consumers pace themselves by accumulating these.
    pts_delta_ms: i64,
    /// Raw decode position in milliseconds, independent of rate. Drives the
    /// play-time readout and the hardware-embedded timecode.
    clock_pts_ms: i64,
}

impl Frame {
    pub fn new(kind: MediaKind, data: Vec<u8>, pts_delta_ms: i64, clock_pts_ms: i64) -> Self {
        Self {
            kind,
            data,
            pts_delta_ms,
            clock_pts_ms,
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn pts_delta_ms(&self) -> i64 {
        self.pts_delta_ms
    }

    pub fn clock_pts_ms(&self) -> i64 {
        self.clock_pts_ms
    }
}
