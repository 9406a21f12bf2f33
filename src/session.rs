//! One clip's analysis, from the first sampled frame to the final score.
//!
//! ```text
//! Idle -> Sampling -> Aggregating -> Finalizing -> Complete
//!            \______________\______________\-----> Errored
//! ```
//!
//! Any state can be reset to `Idle`, discarding whatever was collected.

use crate::{
    benchmark::BenchmarkStore,
    config::AnalysisConfig,
    error::{Error, ErrorKind},
    features,
    pattern::{MotionPattern, PatternBuilder},
    pose::Pose,
    provider::PoseProvider,
    sampler::{CancellationToken, Frame, FrameSampler, VideoSource},
    similarity::{MetricBreakdown, SimilarityEngine, SimilarityResult},
    speed::{SpeedClass, SpeedConfig},
};
use num_traits::ToPrimitive;
use std::{fmt, str::FromStr};
use tracing::{debug, info, instrument, trace, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisMode {
    /// Score the whole motion pattern against the benchmark.
    BenchmarkComparison,
    /// Score the bowling arm's elbow angle profile against the benchmark's.
    PoseSimilarity,
}

impl Default for AnalysisMode {
    fn default() -> Self {
        AnalysisMode::BenchmarkComparison
    }
}

impl fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AnalysisMode::BenchmarkComparison => "benchmark-comparison",
            AnalysisMode::PoseSimilarity => "pose-similarity",
        })
    }
}

impl FromStr for AnalysisMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "benchmark" | "benchmark-comparison" => Ok(AnalysisMode::BenchmarkComparison),
            "pose" | "pose-similarity" => Ok(AnalysisMode::PoseSimilarity),
            other => Err(format!(
                "unknown analysis mode {:?}, expected benchmark-comparison or pose-similarity",
                other
            )),
        }
    }
}

/// One sampled frame after pose detection.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct FrameSample {
    pub timestamp: f64,
    /// The primary pose, if anyone was detected.
    pub pose: Option<Pose>,
}

#[derive(Debug, Copy, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub frames_processed: usize,
    pub estimated_total: usize,
    /// In `[0, 100]`.
    pub percent: f64,
}

impl Progress {
    fn new(frames_processed: usize, estimated_total: usize) -> Self {
        let percent = match (frames_processed.to_f64(), estimated_total.to_f64()) {
            (Some(done), Some(total)) if total > 0.0 => (done / total * 100.0).min(100.0),
            _ => 100.0,
        };
        Self {
            frames_processed,
            estimated_total,
            percent,
        }
    }
}

/// What the presentation layer receives for a completed clip.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub mode: AnalysisMode,
    /// Overall similarity scaled to `[0, 100]`.
    pub final_intensity_similarity: f64,
    pub speed_class: SpeedClass,
    pub confidence_percent: f64,
    pub kmh: f64,
    pub message: String,
    pub per_metric_breakdown: MetricBreakdown,
    pub recommendations: Vec<String>,
    pub eligible: bool,
}

impl AnalysisResult {
    /// Scale a similarity result to `[0, 100]` and classify it.
    pub fn new(mode: AnalysisMode, similarity: SimilarityResult, speed: &SpeedConfig) -> Self {
        let score = similarity.overall_similarity * 100.0;
        let classification = speed.classify(score);
        Self {
            mode,
            final_intensity_similarity: score,
            speed_class: classification.speed_class,
            confidence_percent: classification.confidence * 100.0,
            kmh: speed.to_kmh(score),
            message: classification.message.to_owned(),
            per_metric_breakdown: similarity.per_metric,
            recommendations: similarity.recommendations,
            eligible: speed.is_eligible(score),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFailure {
    pub kind: ErrorKind,
    /// Text meant for the person who recorded the clip.
    pub message: String,
    pub detail: String,
    pub retryable: bool,
}

impl SessionFailure {
    fn new(error: &Error) -> Self {
        Self {
            kind: error.kind(),
            message: error.user_message().to_owned(),
            detail: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Idle,
    Sampling,
    Aggregating,
    Finalizing,
    Complete(Box<AnalysisResult>),
    Errored(SessionFailure),
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Sampling => "sampling",
            SessionState::Aggregating => "aggregating",
            SessionState::Finalizing => "finalizing",
            SessionState::Complete(_) => "complete",
            SessionState::Errored(_) => "errored",
        }
    }
}

pub struct AnalysisSession {
    config: AnalysisConfig,
    mode: AnalysisMode,
    engine: SimilarityEngine,
    state: SessionState,
    builder: PatternBuilder,
    previous: Option<(f64, Pose)>,
    frames_processed: usize,
    provider_failures: usize,
    pattern: Option<MotionPattern>,
}

impl AnalysisSession {
    pub fn new(config: AnalysisConfig, mode: AnalysisMode) -> Self {
        let engine = SimilarityEngine::new(config.similarity.clone(), config.min_samples);
        let builder = PatternBuilder::new(config.segmentation.clone(), config.min_samples);
        Self {
            config,
            mode,
            engine,
            state: SessionState::Idle,
            builder,
            previous: None,
            frames_processed: 0,
            provider_failures: 0,
            pattern: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn mode(&self) -> AnalysisMode {
        self.mode
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn frames_processed(&self) -> usize {
        self.frames_processed
    }

    /// Motion samples collected so far for the current clip.
    pub fn pending_samples(&self) -> usize {
        self.builder.len()
    }

    /// The finalized pattern, once sampling has ended successfully.
    pub fn pattern(&self) -> Option<&MotionPattern> {
        self.pattern.as_ref()
    }

    pub fn result(&self) -> Option<&AnalysisResult> {
        match &self.state {
            SessionState::Complete(result) => Some(&**result),
            _ => None,
        }
    }

    fn transition_error(&self, action: &'static str) -> Error {
        Error::InvalidTransition {
            action,
            state: self.state.name(),
        }
    }

    fn require_sampling(&self, action: &'static str) -> Result<(), Error> {
        match self.state {
            SessionState::Sampling => Ok(()),
            _ => Err(self.transition_error(action)),
        }
    }

    /// Move to `Errored`, or back to `Idle` on cancellation, and hand the
    /// error back for propagation.
    fn fail(&mut self, error: Error) -> Error {
        if let Error::Cancelled = error {
            self.reset();
            return error;
        }
        warn!(state = self.state.name(), error = %error, "analysis failed");
        self.state = SessionState::Errored(SessionFailure::new(&error));
        error
    }

    /// Drop everything collected for the current clip and return to `Idle`.
    pub fn reset(&mut self) {
        debug!(state = self.state.name(), "session reset");
        self.builder = PatternBuilder::new(self.config.segmentation.clone(), self.config.min_samples);
        self.previous = None;
        self.frames_processed = 0;
        self.provider_failures = 0;
        self.pattern = None;
        self.state = SessionState::Idle;
    }

    pub fn start(&mut self) -> Result<(), Error> {
        match self.state {
            SessionState::Idle => {
                self.state = SessionState::Sampling;
                Ok(())
            }
            _ => Err(self.transition_error("start")),
        }
    }

    /// Feed one frame's detection result. A frame without a pose yields no
    /// motion sample and the next pose starts a fresh pair.
    pub fn push_frame(&mut self, sample: FrameSample) -> Result<(), Error> {
        self.require_sampling("push a frame")?;
        self.frames_processed += 1;
        let pose = match sample.pose {
            Some(pose) => pose,
            None => {
                trace!(timestamp = sample.timestamp, "no pose detected");
                self.previous = None;
                return Ok(());
            }
        };
        if let Some((previous_timestamp, previous)) = self.previous.take() {
            let dt = sample.timestamp - previous_timestamp;
            match features::extract(&previous, &pose, dt, &self.config.features) {
                Some(motion) => self.builder.add(&motion),
                None => debug!(dt, "non-positive frame interval, pair skipped"),
            }
        }
        self.previous = Some((sample.timestamp, pose));
        Ok(())
    }

    /// Run pose detection on `frame` and feed the primary pose.
    ///
    /// A failed detection drops the frame like one where nobody was found.
    /// The session fails once `max_provider_failures` frames in a row have
    /// failed, or as soon as the provider reports it is exhausted.
    pub fn process_frame(
        &mut self,
        frame: &Frame,
        provider: &mut dyn PoseProvider,
    ) -> Result<(), Error> {
        self.require_sampling("process a frame")?;
        let poses = match provider.detect(frame) {
            Ok(poses) => {
                self.provider_failures = 0;
                poses
            }
            Err(Error::Cancelled) => return Err(self.fail(Error::Cancelled)),
            Err(e) => {
                self.provider_failures += 1;
                if provider.is_exhausted()
                    || self.provider_failures >= self.config.max_provider_failures
                {
                    let e = match e {
                        e @ Error::PoseProviderUnavailable { .. } => e,
                        other => Error::PoseProviderUnavailable {
                            failures: vec![format!("{}: {}", provider.name(), other)],
                        },
                    };
                    return Err(self.fail(e));
                }
                warn!(
                    provider = provider.name(),
                    timestamp = frame.timestamp,
                    failures = self.provider_failures,
                    error = %e,
                    "pose detection failed, frame dropped"
                );
                Vec::new()
            }
        };
        if poses.len() > 1 {
            trace!(count = poses.len(), "several poses detected, using the first");
        }
        self.push_frame(FrameSample {
            timestamp: frame.timestamp,
            pose: poses.into_iter().next(),
        })
    }

    /// Drain `sampler` through `provider`, reporting progress after every
    /// frame. Cancellation resets the session and fails with
    /// [`Error::Cancelled`].
    pub fn sample<S>(
        &mut self,
        mut sampler: FrameSampler<'_, S>,
        provider: &mut dyn PoseProvider,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<(), Error>
    where
        S: VideoSource + ?Sized,
    {
        self.require_sampling("sample")?;
        let total = sampler.estimated_total();
        let cancel = sampler.cancellation().clone();
        for item in sampler.by_ref() {
            let frame = item.map_err(|e| self.fail(e))?;
            if cancel.is_cancelled() {
                break;
            }
            self.process_frame(&frame, provider)?;
            progress(Progress::new(self.frames_processed, total));
        }
        if cancel.is_cancelled() {
            info!(frames = self.frames_processed, "analysis cancelled");
            return Err(self.fail(Error::Cancelled));
        }
        debug!(
            frames = self.frames_processed,
            skipped = sampler.skipped(),
            samples = self.builder.len(),
            "sampling finished"
        );
        Ok(())
    }

    /// Close the clip: finalize the pattern and check it has enough data.
    pub fn finalize_pattern(&mut self) -> Result<MotionPattern, Error> {
        self.require_sampling("finalize")?;
        self.state = SessionState::Aggregating;
        let fresh = PatternBuilder::new(self.config.segmentation.clone(), self.config.min_samples);
        let builder = std::mem::replace(&mut self.builder, fresh);
        self.previous = None;
        self.provider_failures = 0;

        let pattern = builder.finalize();
        if let Err(e) = pattern.validate(self.config.min_samples) {
            return Err(self.fail(e));
        }
        info!(
            samples = pattern.len(),
            release = pattern.release_point_frame,
            "motion pattern finalized"
        );
        self.state = SessionState::Finalizing;
        self.pattern = Some(pattern.clone());
        Ok(pattern)
    }

    /// Score the finalized pattern against `benchmark`.
    pub fn finish(&mut self, benchmark: &MotionPattern) -> Result<AnalysisResult, Error> {
        match self.state {
            SessionState::Finalizing => {}
            _ => return Err(self.transition_error("finish")),
        }
        let compared = match &self.pattern {
            Some(pattern) => match self.mode {
                AnalysisMode::BenchmarkComparison => self.engine.compare(pattern, benchmark),
                AnalysisMode::PoseSimilarity => self.engine.compare_pose_profiles(pattern, benchmark),
            },
            None => Err(Error::InvalidPattern("no finalized pattern".into())),
        };
        let similarity = compared.map_err(|e| self.fail(e))?;
        let result = AnalysisResult::new(self.mode, similarity, &self.config.speed);
        info!(
            similarity = result.final_intensity_similarity,
            speed_class = %result.speed_class,
            kmh = result.kmh,
            eligible = result.eligible,
            "analysis complete"
        );
        self.state = SessionState::Complete(Box::new(result.clone()));
        Ok(result)
    }

    /// Sample a whole clip and finalize its pattern, leaving the session in
    /// `Finalizing`.
    #[instrument(name = "AnalysisSession::capture_pattern", skip_all, fields(mode = %self.mode))]
    pub fn capture_pattern<S>(
        &mut self,
        source: &mut S,
        provider: &mut dyn PoseProvider,
        cancel: CancellationToken,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<MotionPattern, Error>
    where
        S: VideoSource + ?Sized,
    {
        self.start()?;
        let sampler = FrameSampler::new(source, &self.config.sampler, cancel);
        self.sample(sampler, provider, progress)?;
        self.finalize_pattern()
    }

    /// The whole pipeline for one clip.
    #[instrument(name = "AnalysisSession::run", skip_all, fields(mode = %self.mode))]
    pub fn run<S>(
        &mut self,
        source: &mut S,
        provider: &mut dyn PoseProvider,
        benchmark: &BenchmarkStore,
        cancel: CancellationToken,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<AnalysisResult, Error>
    where
        S: VideoSource + ?Sized,
    {
        self.capture_pattern(source, provider, cancel, progress)?;
        let benchmark = benchmark.get().map_err(|e| self.fail(e))?;
        self.finish(&benchmark)
    }
}
