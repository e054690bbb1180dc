//! Channel format table.
//!
//! The format names come from external configuration and are matched
//! verbatim. Geometry, frame rate and ancillary line counts are fixed per
//! format; the output pixel layout is always UYVY 4:2:2 (two bytes per
//! pixel).

use crate::error::LoadError;

/// Output audio is fixed across all formats: 48 kHz, 8 channels, signed
/// 16-bit interleaved.
pub const AUDIO_SAMPLE_RATE: u32 = 48_000;
pub const AUDIO_CHANNELS: usize = 8;
pub const AUDIO_BYTES_PER_SAMPLE: usize = 2;

/// Bytes per interleaved sample frame across all channels.
pub const AUDIO_FRAME_BYTES: usize = AUDIO_CHANNELS * AUDIO_BYTES_PER_SAMPLE;

/// Recording container family for a format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordContainer {
    /// MXF D-10 (IMX) for standard definition.
    MxfD10,
    /// Plain MXF for high definition.
    Mxf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFormat {
    Pal,
    PalWide,
    Hd720p50,
    Hd720p5994,
    Hd1080p25,
    Hd1080i50,
    Hd1080i5994,
}

impl ChannelFormat {
    pub fn parse(name: &str) -> Result<Self, LoadError> {
        match name {
            "PAL" => Ok(Self::Pal),
            "PAL 16:9" => Ok(Self::PalWide),
            "720p50" => Ok(Self::Hd720p50),
            "720p5994" => Ok(Self::Hd720p5994),
            "1080p25" => Ok(Self::Hd1080p25),
            "1080i50" => Ok(Self::Hd1080i50),
            "1080i5994" => Ok(Self::Hd1080i5994),
            other => Err(LoadError::UnknownFormat(other.to_string())),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pal => "PAL",
            Self::PalWide => "PAL 16:9",
            Self::Hd720p50 => "720p50",
            Self::Hd720p5994 => "720p5994",
            Self::Hd1080p25 => "1080p25",
            Self::Hd1080i50 => "1080i50",
            Self::Hd1080i5994 => "1080i5994",
        }
    }

    pub fn width(&self) -> usize {
        match self {
            Self::Pal | Self::PalWide => 720,
            Self::Hd720p50 | Self::Hd720p5994 => 1280,
            Self::Hd1080p25 | Self::Hd1080i50 | Self::Hd1080i5994 => 1920,
        }
    }

    pub fn height(&self) -> usize {
        match self {
            Self::Pal | Self::PalWide => 576,
            Self::Hd720p50 | Self::Hd720p5994 => 720,
            Self::Hd1080p25 | Self::Hd1080i50 | Self::Hd1080i5994 => 1080,
        }
    }

    /// Nominal frame rate. Interlaced modes count full frames.
    pub fn fps(&self) -> f64 {
        match self {
            Self::Pal | Self::PalWide | Self::Hd1080p25 | Self::Hd1080i50 => 25.0,
            Self::Hd720p50 => 50.0,
            Self::Hd720p5994 => 59.94,
            Self::Hd1080i5994 => 29.97,
        }
    }

    /// Vertical ancillary rows carried ahead of the active picture.
    pub fn vanc_rows(&self) -> usize {
        match self {
            Self::Pal | Self::PalWide => 32,
            _ => 0,
        }
    }

    pub fn row_bytes(&self) -> usize {
        self.width() * 2
    }

    /// Active picture size in bytes (UYVY, no VANC).
    pub fn frame_size(&self) -> usize {
        self.row_bytes() * self.height()
    }

    /// Byte offset of the active picture when VANC rows are present.
    pub fn video_offset(&self) -> usize {
        self.vanc_rows() * self.row_bytes()
    }

    pub fn frame_duration_ms(&self) -> f64 {
        1000.0 / self.fps()
    }

    pub fn container(&self) -> RecordContainer {
        match self {
            Self::Pal | Self::PalWide => RecordContainer::MxfD10,
            _ => RecordContainer::Mxf,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_labels() {
        for label in [
            "PAL",
            "PAL 16:9",
            "720p50",
            "720p5994",
            "1080p25",
            "1080i50",
            "1080i5994",
        ] {
            let format = ChannelFormat::parse(label).unwrap();
            assert_eq!(format.label(), label);
        }
    }

    #[test]
    fn test_parse_unknown_label() {
        assert!(matches!(
            ChannelFormat::parse("NTSC"),
            Err(LoadError::UnknownFormat(_))
        ));
    }

    #[test]
    fn test_pal_geometry() {
        let pal = ChannelFormat::Pal;
        assert_eq!(pal.width(), 720);
        assert_eq!(pal.height(), 576);
        assert_eq!(pal.frame_size(), 720 * 576 * 2);
        assert_eq!(pal.vanc_rows(), 32);
        assert_eq!(pal.video_offset(), 32 * 720 * 2);
        assert_eq!(pal.container(), RecordContainer::MxfD10);
    }

    #[test]
    fn test_hd_has_no_vanc() {
        let hd = ChannelFormat::Hd1080i50;
        assert_eq!(hd.frame_size(), 1920 * 1080 * 2);
        assert_eq!(hd.vanc_rows(), 0);
        assert_eq!(hd.video_offset(), 0);
        assert_eq!(hd.container(), RecordContainer::Mxf);
    }

    #[test]
    fn test_frame_durations() {
        assert_eq!(ChannelFormat::Pal.frame_duration_ms(), 40.0);
        assert_eq!(ChannelFormat::Hd720p50.frame_duration_ms(), 20.0);
        assert!((ChannelFormat::Hd1080i5994.frame_duration_ms() - 33.367).abs() < 0.01);
    }
}
