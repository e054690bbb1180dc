use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for the engine. Operation-specific enums below are
/// converted into this via `#[from]`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("load failed: {0}")]
    Load(#[from] LoadError),

    #[error("media source error: {0}")]
    Source(#[from] SourceError),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("recording error: {0}")]
    Record(#[from] RecordError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Failures that abort `load` synchronously. No partial state survives any
/// of these: the channel stays in its previous state.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("could not open input '{path}': {reason}")]
    OpenFailed { path: String, reason: String },

    #[error("no usable stream information in '{path}'")]
    NoStreamInfo { path: String },

    #[error("codec initialization failed: {0}")]
    CodecInit(String),

    #[error("unsupported pixel format")]
    UnsupportedPixelFormat,

    #[error("unsupported sample rate {0} (output requires 48000)")]
    UnsupportedSampleRate(u32),

    #[error("unknown channel format '{0}'")]
    UnknownFormat(String),
}

/// Steady-state media source errors. Per-unit decode failures are logged
/// and skipped inside the adapter; only unrecoverable read/seek failures
/// surface here.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("seek to {position_ms}ms failed: {reason}")]
    SeekFailed { position_ms: i64, reason: String },

    #[error("overlay {0} could not be applied")]
    OverlayFailed(u32),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device does not support mode {0}")]
    UnsupportedMode(String),

    #[error("device is not enabled")]
    NotEnabled,

    #[error("device {index} is already claimed")]
    AlreadyClaimed { index: usize },

    #[error("no device at index {index}")]
    NoSuchDevice { index: usize },

    #[error("scheduling failed: {0}")]
    ScheduleFailed(String),
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("could not open output '{path}': {reason}")]
    OpenFailed { path: String, reason: String },

    #[error("encoder fault: {0}")]
    EncoderFault(String),

    #[error("mux failed: {0}")]
    MuxFailed(String),

    #[error("recorder gave up after {restarts} consecutive restarts")]
    TooManyRestarts { restarts: u32 },
}

/// Transport verbs called against the wrong port mode or channel state.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("port is not a playout port")]
    NotPlayout,

    #[error("port is not an ingest port")]
    NotIngest,

    #[error("no media loaded")]
    NotLoaded,

    #[error("operation requires state {required}, channel is {actual}")]
    WrongState {
        required: &'static str,
        actual: &'static str,
    },
}
