//! Port transport surface.
//!
//! One `VideoPort` per physical channel. A port is exclusively a playout
//! port or an ingest port; transport verbs for the other mode are rejected
//! rather than silently ignored. The external dispatch layer maps port
//! numbers to these objects and calls one verb per command.

use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;
use log::info;

use crate::bridge::recorder::{RecordSink, Recorder};
use crate::bridge::IoBridge;
use crate::core::channel::{
    ChannelState, EngineEvent, PlayoutChannel, AUDIO_QUEUE_CAPACITY, VIDEO_QUEUE_CAPACITY,
};
use crate::core::consumer::PreviewSink;
use crate::core::format::ChannelFormat;
use crate::core::frame_queue::FrameQueue;
use crate::device::{CaptureDevice, CaptureSink, OutputDevice};
use crate::error::{DeviceError, Error, RecordError, TransportError};

enum PortKind {
    Playout(PlayoutChannel),
    Ingest {
        format: ChannelFormat,
        bridge: Arc<IoBridge>,
        recorder: Recorder,
        capture: Box<dyn CaptureDevice>,
    },
}

pub struct VideoPort {
    number: usize,
    kind: PortKind,
}

impl VideoPort {
    pub fn playout(number: usize, channel: PlayoutChannel) -> Self {
        info!("port {number} configured for playout");
        Self {
            number,
            kind: PortKind::Playout(channel),
        }
    }

    /// Ingest port: wires the capture device into a bridge and recorder.
    /// Pass-through output and preview are optional collaborators.
    pub fn ingest(
        number: usize,
        format: ChannelFormat,
        mut capture: Box<dyn CaptureDevice>,
        record_sink: Box<dyn RecordSink>,
        output: Option<Arc<Mutex<Box<dyn OutputDevice>>>>,
        preview: Option<Arc<dyn PreviewSink>>,
        events: Sender<EngineEvent>,
    ) -> Result<Self, DeviceError> {
        let record_video = Arc::new(FrameQueue::new(VIDEO_QUEUE_CAPACITY));
        let record_audio = Arc::new(FrameQueue::new(AUDIO_QUEUE_CAPACITY));

        let mut bridge = IoBridge::new(
            format,
            Arc::clone(&record_video),
            Arc::clone(&record_audio),
            events.clone(),
        );
        if let Some(output) = output {
            bridge = bridge.with_output(output);
        }
        if let Some(preview) = preview {
            bridge = bridge.with_preview(preview);
        }
        let bridge = Arc::new(bridge);

        let sink: Arc<dyn CaptureSink> = bridge.clone();
        capture.enable(format, sink)?;

        let recorder = Recorder::new(record_video, record_audio, format, record_sink, events);
        info!("port {number} configured for ingest at {}", format.label());
        Ok(Self {
            number,
            kind: PortKind::Ingest {
                format,
                bridge,
                recorder,
                capture,
            },
        })
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn is_playout(&self) -> bool {
        matches!(self.kind, PortKind::Playout(_))
    }

    fn channel(&mut self) -> Result<&mut PlayoutChannel, TransportError> {
        match &mut self.kind {
            PortKind::Playout(channel) => Ok(channel),
            PortKind::Ingest { .. } => Err(TransportError::NotPlayout),
        }
    }

    fn channel_ref(&self) -> Result<&PlayoutChannel, TransportError> {
        match &self.kind {
            PortKind::Playout(channel) => Ok(channel),
            PortKind::Ingest { .. } => Err(TransportError::NotPlayout),
        }
    }

    // Playout transport verbs, one per dispatch command.

    pub fn load(&mut self, path: &str) -> Result<i64, Error> {
        self.channel()?.load(path)
    }

    pub fn recue(&mut self, looping: bool) -> Result<(), Error> {
        self.channel()?.recue(looping)
    }

    pub fn take(&mut self) -> Result<(), Error> {
        self.channel()?.take()
    }

    pub fn pause(&mut self) -> Result<(), Error> {
        self.channel()?.pause(false)
    }

    pub fn drop_media(&mut self, immediate: bool) -> Result<(), Error> {
        self.channel()?.drop_media(immediate)
    }

    pub fn seek(&mut self, position_ms: i64) -> Result<(), Error> {
        self.channel()?.seek(position_ms)
    }

    pub fn next_frame(&mut self) -> Result<(), Error> {
        self.channel()?.next_frame()
    }

    pub fn previous_frame(&mut self) -> Result<(), Error> {
        self.channel()?.previous_frame()
    }

    pub fn forward(&mut self) -> Result<f64, Error> {
        self.channel()?.forward()
    }

    pub fn reverse(&mut self) -> Result<f64, Error> {
        self.channel()?.reverse()
    }

    pub fn activate_overlay(&mut self, overlay: Option<u32>) -> Result<(), Error> {
        self.channel()?.activate_overlay(overlay)
    }

    pub fn play_time_ms(&self) -> Result<i64, TransportError> {
        Ok(self.channel_ref()?.play_time_ms())
    }

    pub fn timecode_ms(&self) -> Result<i64, TransportError> {
        Ok(self.channel_ref()?.timecode_ms())
    }

    pub fn state(&self) -> Option<ChannelState> {
        match &self.kind {
            PortKind::Playout(channel) => Some(channel.state()),
            PortKind::Ingest { .. } => None,
        }
    }

    pub fn change_format(&mut self, name: &str) -> Result<(), Error> {
        let new_format = ChannelFormat::parse(name)?;
        match &mut self.kind {
            PortKind::Playout(channel) => channel.change_format(new_format),
            PortKind::Ingest {
                format,
                bridge,
                capture,
                ..
            } => {
                capture.disable()?;
                bridge.change_format(new_format);
                let sink: Arc<dyn CaptureSink> = bridge.clone();
                capture.enable(new_format, sink)?;
                *format = new_format;
                Ok(())
            }
        }
    }

    // Ingest verbs.

    pub fn start_recording(&mut self, path: &str) -> Result<(), Error> {
        match &mut self.kind {
            PortKind::Playout(_) => Err(TransportError::NotIngest.into()),
            PortKind::Ingest {
                bridge, recorder, ..
            } => {
                let timecode = bridge.timecode();
                bridge.arm_recording();
                recorder
                    .start(path, timecode.as_deref())
                    .map_err(|e: RecordError| {
                        bridge.disarm_recording();
                        Error::from(e)
                    })
            }
        }
    }

    /// Stop recording, draining queued blocks first. Returns the recorded
    /// duration when known.
    pub fn stop_recording(&mut self) -> Result<Option<i64>, Error> {
        match &mut self.kind {
            PortKind::Playout(_) => Err(TransportError::NotIngest.into()),
            PortKind::Ingest {
                bridge, recorder, ..
            } => {
                bridge.disarm_recording();
                Ok(recorder.stop())
            }
        }
    }

    pub fn record_time_ms(&self) -> Result<i64, TransportError> {
        match &self.kind {
            PortKind::Playout(_) => Err(TransportError::NotIngest),
            PortKind::Ingest { recorder, .. } => Ok(recorder.record_time_ms()),
        }
    }

    pub fn is_recording(&self) -> bool {
        match &self.kind {
            PortKind::Playout(_) => false,
            PortKind::Ingest { recorder, .. } => recorder.is_recording(),
        }
    }
}
