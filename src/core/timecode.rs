//! Timecode math shared by the hardware scheduler, the recue pre-display
//! and the load-time metadata parse.

/// Timecode split into the components the output device embeds as VITC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimecodeParts {
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub frames: u8,
}

impl TimecodeParts {
    /// Derive the timecode for a given output frame index at the channel
    /// frame rate. Fractional rates truncate to whole frames per second.
    pub fn from_frame_index(frame_index: i64, fps: f64) -> Self {
        let fps_whole = fps as i64;
        let fps_whole = fps_whole.max(1);
        let index = frame_index.max(0);
        let frames = index % fps_whole;
        let total_seconds = index / fps_whole;
        Self {
            hours: ((total_seconds / 3600) % 24) as u8,
            minutes: ((total_seconds / 60) % 60) as u8,
            seconds: (total_seconds % 60) as u8,
            frames: frames as u8,
        }
    }

    pub fn from_millis(position_ms: i64, fps: f64) -> Self {
        let frame_index = (position_ms.max(0) as f64 * fps / 1000.0) as i64;
        Self::from_frame_index(frame_index, fps)
    }
}

impl std::fmt::Display for TimecodeParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02}:{:02}",
            self.hours, self.minutes, self.seconds, self.frames
        )
    }
}

/// Parse an embedded container timecode (`HH:MM:SS:FF`) into a millisecond
/// origin at the given frame rate. Returns `None` for anything malformed;
/// callers fall back to a zero origin.
pub fn parse_timecode_ms(timecode: &str, fps: f64) -> Option<i64> {
    let mut parts = timecode.split(&[':', ';'][..]);
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds: i64 = parts.next()?.parse().ok()?;
    let frames: i64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    if !(0..60).contains(&minutes) || !(0..60).contains(&seconds) || frames < 0 {
        return None;
    }
    let total_seconds = hours * 3600 + minutes * 60 + seconds;
    let frame_ms = (frames as f64 * 1000.0 / fps) as i64;
    Some(total_seconds * 1000 + frame_ms)
}
