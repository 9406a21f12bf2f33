use crate::error::Error;
use num_traits::ToPrimitive;
use std::{
    iter::FusedIterator,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, warn};

/// An RGB image laid out as `[height, width, channel]`.
pub type Raster = ndarray::Array3<u8>;

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Seconds from the start of the clip.
    pub timestamp: f64,
    pub image: Raster,
}

/// A seekable clip. The sampler is the only thing that moves its playback
/// position while a session is running.
pub trait VideoSource {
    /// Length of the clip in seconds.
    fn duration(&self) -> f64;

    /// Move playback to `timestamp` seconds. Implementations return
    /// [`Error::SeekTimeout`] when the seek did not settle within `timeout`.
    fn seek(&mut self, timestamp: f64, timeout: Duration) -> Result<(), Error>;

    /// Grab the frame at the current position, scaled to `width` x `height`.
    fn capture(&mut self, width: u32, height: u32) -> Result<Raster, Error>;
}

/// Shared stop flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

const DEFAULT_FPS: f64 = 12.0;
const DEFAULT_WIDTH: u32 = 320;
const DEFAULT_HEIGHT: u32 = 240;
const DEFAULT_SEEK_TIMEOUT_MS: u64 = 1000;
const DEFAULT_MAX_CONSECUTIVE_SKIPS: usize = 5;

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SamplerConfig {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub seek_timeout_ms: u64,
    /// Abort once more than this many seeks in a row have timed out.
    pub max_consecutive_skips: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            fps: DEFAULT_FPS,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            seek_timeout_ms: DEFAULT_SEEK_TIMEOUT_MS,
            max_consecutive_skips: DEFAULT_MAX_CONSECUTIVE_SKIPS,
        }
    }
}

impl SamplerConfig {
    pub fn seek_timeout(&self) -> Duration {
        Duration::from_millis(self.seek_timeout_ms)
    }

    /// Number of frames sampled from a clip of `duration` seconds.
    pub fn frame_count(&self, duration: f64) -> usize {
        if !duration.is_finite() || duration <= 0.0 {
            return 0;
        }
        (duration * self.fps).ceil().to_usize().unwrap_or(0)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !self.fps.is_finite() || self.fps <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "sampler fps must be positive, got {}",
                self.fps
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidConfig(format!(
                "sampler raster must be non-empty, got {}x{}",
                self.width, self.height
            )));
        }
        if self.seek_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "sampler seek timeout must be positive".into(),
            ));
        }
        if self.max_consecutive_skips == 0 {
            return Err(Error::InvalidConfig(
                "sampler must tolerate at least one skipped frame".into(),
            ));
        }
        Ok(())
    }
}

/// Lazily seeks through a clip at a fixed rate, yielding one frame per step.
///
/// The sequence is finite and cannot be restarted: it ends when the clip is
/// exhausted, when the token is cancelled, or after the first hard error.
/// Seeks that time out are skipped; too many of them in a row end the
/// sequence with [`Error::TooManySkippedFrames`].
pub struct FrameSampler<'a, S: ?Sized> {
    source: &'a mut S,
    config: SamplerConfig,
    cancel: CancellationToken,
    next_index: usize,
    total: usize,
    skipped: usize,
    consecutive_skips: usize,
    done: bool,
}

impl<'a, S> FrameSampler<'a, S>
where
    S: VideoSource + ?Sized,
{
    pub fn new(source: &'a mut S, config: &SamplerConfig, cancel: CancellationToken) -> Self {
        let total = config.frame_count(source.duration());
        Self {
            source,
            config: config.clone(),
            cancel,
            next_index: 0,
            total,
            skipped: 0,
            consecutive_skips: 0,
            done: false,
        }
    }

    /// Frames this sampler will attempt, skipped ones included.
    pub fn estimated_total(&self) -> usize {
        self.total
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Frames dropped so far because their seek timed out.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn timestamp(&self, index: usize) -> f64 {
        index.to_f64().unwrap_or(f64::MAX) / self.config.fps
    }
}

impl<'a, S> Iterator for FrameSampler<'a, S>
where
    S: VideoSource + ?Sized,
{
    type Item = Result<Frame, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if self.cancel.is_cancelled() {
                debug!(next_index = self.next_index, "frame sampling cancelled");
                self.done = true;
                return None;
            }
            if self.next_index >= self.total {
                self.done = true;
                return None;
            }

            let timestamp = self.timestamp(self.next_index);
            self.next_index += 1;

            match self.source.seek(timestamp, self.config.seek_timeout()) {
                Ok(()) => self.consecutive_skips = 0,
                Err(Error::SeekTimeout { .. }) => {
                    self.skipped += 1;
                    self.consecutive_skips += 1;
                    warn!(
                        timestamp,
                        consecutive = self.consecutive_skips,
                        "seek timed out, skipping frame"
                    );
                    if self.consecutive_skips > self.config.max_consecutive_skips {
                        self.done = true;
                        return Some(Err(Error::TooManySkippedFrames(self.consecutive_skips)));
                    }
                    continue;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }

            let (width, height) = (self.config.width, self.config.height);
            return match self.source.capture(width, height) {
                Ok(image) => Some(Ok(Frame { timestamp, image })),
                Err(e) => {
                    self.done = true;
                    Some(Err(e))
                }
            };
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            (0, Some(0))
        } else {
            (0, Some(self.total.saturating_sub(self.next_index)))
        }
    }
}

impl<'a, S> FusedIterator for FrameSampler<'a, S> where S: VideoSource + ?Sized {}
