use crate::pose::KeypointKind;
use std::path::PathBuf;

/// Coarse classification of [`Error`] values, used to decide what a caller
/// should tell the user and whether a retry makes sense.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Too few usable motion samples were collected for a clip.
    InsufficientData,
    /// Pose detection could not be initialized or kept failing.
    PoseProviderUnavailable,
    /// The benchmark pattern failed to load or is malformed.
    BenchmarkUnavailable,
    /// The video source could not be sampled reliably.
    Playback,
    /// The user stopped the analysis.
    Cancelled,
    /// Misuse of the API or a bad configuration.
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("insufficient motion data: got {samples} samples, need at least {required}")]
    InsufficientData { samples: usize, required: usize },

    #[error("all pose providers failed: {}", .failures.join("; "))]
    PoseProviderUnavailable { failures: Vec<String> },

    #[error("cannot construct provider chain from an empty provider list")]
    NoPoseProviders,

    #[error("failed to read benchmark pattern from {1:?}")]
    ReadBenchmark(#[source] std::io::Error, PathBuf),

    #[error("failed to parse benchmark pattern document")]
    ParseBenchmark(#[source] serde_json::Error),

    #[error("benchmark pattern is malformed: {0}")]
    InvalidBenchmark(String),

    #[error("unsupported benchmark document version: {0}")]
    UnsupportedBenchmarkVersion(u32),

    #[error("failed to write benchmark pattern to {1:?}")]
    WriteBenchmark(#[source] std::io::Error, PathBuf),

    #[error("failed to serialize benchmark pattern document")]
    SerializeBenchmark(#[source] serde_json::Error),

    #[error("seek to {timestamp:.3}s did not complete within {timeout_ms} ms")]
    SeekTimeout { timestamp: f64, timeout_ms: u128 },

    #[error("gave up after {0} consecutive frames failed to seek")]
    TooManySkippedFrames(usize),

    #[error("analysis cancelled")]
    Cancelled,

    #[error("motion pattern is malformed: {0}")]
    InvalidPattern(String),

    #[error("{0} pattern has no elbow angle profile")]
    MissingAngleProfile(&'static str),

    #[error("cannot {action} while session is {state}")]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to read configuration from {1:?}")]
    ReadConfig(#[source] std::io::Error, PathBuf),

    #[error("failed to parse configuration")]
    ParseConfig(#[source] serde_json::Error),

    #[error("failed to read pose track from {1:?}")]
    ReadPoseTrack(#[source] std::io::Error, PathBuf),

    #[error("failed to parse pose track")]
    ParsePoseTrack(#[source] serde_json::Error),

    #[error("failed to construct NotNan from f32: {1}")]
    ConstructNotNan(#[source] ordered_float::FloatIsNan, f32),

    #[error("failed to convert keypoint variant to usize: {0:?}")]
    KeypointVariantToUSize(KeypointKind),

    #[cfg(feature = "opencv")]
    #[error("failed to open video at {1:?}")]
    OpenVideo(#[source] opencv::Error, PathBuf),

    #[cfg(feature = "opencv")]
    #[error("video at {0:?} could not be opened for reading")]
    VideoNotOpened(PathBuf),

    #[cfg(feature = "opencv")]
    #[error("failed to query video property")]
    GetVideoProperty(#[source] opencv::Error),

    #[cfg(feature = "opencv")]
    #[error("failed to seek video")]
    Seek(#[source] opencv::Error),

    #[cfg(feature = "opencv")]
    #[error("failed to capture frame")]
    CaptureFrame(#[source] opencv::Error),

    #[cfg(feature = "opencv")]
    #[error("no frame available at {0:.3}s")]
    FrameUnavailable(f64),

    #[cfg(feature = "opencv")]
    #[error("failed to resize frame")]
    ResizeFrame(#[source] opencv::Error),

    #[cfg(feature = "opencv")]
    #[error("failed to convert frame to raster")]
    ConvertFrame(#[source] ndarray::ShapeError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InsufficientData { .. } => ErrorKind::InsufficientData,
            Self::PoseProviderUnavailable { .. } | Self::NoPoseProviders => {
                ErrorKind::PoseProviderUnavailable
            }
            Self::ReadBenchmark(..)
            | Self::ParseBenchmark(_)
            | Self::InvalidBenchmark(_)
            | Self::UnsupportedBenchmarkVersion(_)
            | Self::MissingAngleProfile("benchmark") => ErrorKind::BenchmarkUnavailable,
            Self::MissingAngleProfile(_) => ErrorKind::InsufficientData,
            Self::SeekTimeout { .. } | Self::TooManySkippedFrames(_) => ErrorKind::Playback,
            #[cfg(feature = "opencv")]
            Self::OpenVideo(..)
            | Self::VideoNotOpened(_)
            | Self::GetVideoProperty(_)
            | Self::Seek(_)
            | Self::CaptureFrame(_)
            | Self::FrameUnavailable(_)
            | Self::ResizeFrame(_)
            | Self::ConvertFrame(_) => ErrorKind::Playback,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidPattern(_)
            | Self::InvalidTransition { .. }
            | Self::WriteBenchmark(..)
            | Self::SerializeBenchmark(_)
            | Self::InvalidConfig(_)
            | Self::ReadConfig(..)
            | Self::ParseConfig(_)
            | Self::ReadPoseTrack(..)
            | Self::ParsePoseTrack(_)
            | Self::ConstructNotNan(..)
            | Self::KeypointVariantToUSize(_) => ErrorKind::Internal,
        }
    }

    /// Whether recording or loading again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InsufficientData
                | ErrorKind::PoseProviderUnavailable
                | ErrorKind::BenchmarkUnavailable
                | ErrorKind::Playback
        )
    }

    /// Message suitable for showing to the person who recorded the clip.
    pub fn user_message(&self) -> &'static str {
        match self.kind() {
            ErrorKind::InsufficientData => "video too short or action not detected clearly",
            ErrorKind::PoseProviderUnavailable => "pose detection could not be started",
            ErrorKind::BenchmarkUnavailable => "benchmark action could not be loaded",
            ErrorKind::Playback => "video could not be played back reliably",
            ErrorKind::Cancelled => "analysis was cancelled",
            ErrorKind::Internal => "something went wrong while analysing the video",
        }
    }
}
