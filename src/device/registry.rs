//! Explicit device ownership.
//!
//! Devices are registered once at startup and claimed exclusively by the
//! port that drives them; a second claim on the same index fails instead of
//! sharing the handle.

use std::sync::Mutex;

use log::info;

use crate::device::{CaptureDevice, OutputDevice};
use crate::error::DeviceError;

pub struct DeviceRegistry {
    outputs: Mutex<Vec<Option<Box<dyn OutputDevice>>>>,
    captures: Mutex<Vec<Option<Box<dyn CaptureDevice>>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            outputs: Mutex::new(Vec::new()),
            captures: Mutex::new(Vec::new()),
        }
    }

    /// Register an output device, returning its index.
    pub fn register_output(&self, device: Box<dyn OutputDevice>) -> usize {
        let mut outputs = match self.outputs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        outputs.push(Some(device));
        let index = outputs.len() - 1;
        info!("registered output device {index}");
        index
    }

    pub fn register_capture(&self, device: Box<dyn CaptureDevice>) -> usize {
        let mut captures = match self.captures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        captures.push(Some(device));
        let index = captures.len() - 1;
        info!("registered capture device {index}");
        index
    }

    /// Take exclusive ownership of an output device.
    pub fn claim_output(&self, index: usize) -> Result<Box<dyn OutputDevice>, DeviceError> {
        let mut outputs = match self.outputs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match outputs.get_mut(index) {
            None => Err(DeviceError::NoSuchDevice { index }),
            Some(slot) => slot.take().ok_or(DeviceError::AlreadyClaimed { index }),
        }
    }

    pub fn claim_capture(&self, index: usize) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        let mut captures = match self.captures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match captures.get_mut(index) {
            None => Err(DeviceError::NoSuchDevice { index }),
            Some(slot) => slot.take().ok_or(DeviceError::AlreadyClaimed { index }),
        }
    }

    /// Return a previously claimed output so another port can claim it.
    pub fn release_output(&self, index: usize, device: Box<dyn OutputDevice>) {
        let mut outputs = match self.outputs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(slot) = outputs.get_mut(index) {
            *slot = Some(device);
        }
    }

    pub fn release_capture(&self, index: usize, device: Box<dyn CaptureDevice>) {
        let mut captures = match self.captures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(slot) = captures.get_mut(index) {
            *slot = Some(device);
        }
    }

    pub fn output_count(&self) -> usize {
        self.outputs.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn capture_count(&self) -> usize {
        self.captures.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::format::ChannelFormat;
    use crate::core::timecode::TimecodeParts;
    use crate::device::{DeviceCallbacks, ReferenceStatus};
    use std::sync::Arc;

    struct NullOutput;

    impl OutputDevice for NullOutput {
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
            _display_time_ms: i64,
            _duration_ms: i64,
            _timecode: TimecodeParts,
            _clock_pts_ms: i64,
        ) -> Result<(), DeviceError> {
            Ok(())
        }
        fn schedule_audio(
            &mut self,
            _samples: Vec<u8>,
            _stream_sample_offset: i64,
        ) -> Result<(), DeviceError> {
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
            Ok(())
        }
        fn stop_scheduled_playback(&mut self, _at_time_ms: Option<i64>) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    #[test]
    fn test_claim_is_exclusive() {
        let registry = DeviceRegistry::new();
        let index = registry.register_output(Box::new(NullOutput));

        let device = registry.claim_output(index).unwrap();
        assert!(matches!(
            registry.claim_output(index),
            Err(DeviceError::AlreadyClaimed { .. })
        ));

        registry.release_output(index, device);
        assert!(registry.claim_output(index).is_ok());
    }

    #[test]
    fn test_claim_unknown_index() {
        let registry = DeviceRegistry::new();
        assert!(matches!(
            registry.claim_output(3),
            Err(DeviceError::NoSuchDevice { index: 3 })
        ));
    }
}
