//! Bowling action analysis: sample a clip, turn detected poses into motion
//! curves, and score them against a benchmark action.

pub mod benchmark;
pub mod config;
pub mod error;
pub mod features;
pub mod pattern;
pub mod pose;
pub mod provider;
pub mod sampler;
pub mod session;
pub mod similarity;
pub mod speed;
#[cfg(feature = "opencv")]
pub mod video;

pub use crate::{
    benchmark::BenchmarkStore,
    config::AnalysisConfig,
    error::{Error, ErrorKind},
    pattern::{MotionPattern, PatternBuilder},
    provider::{PoseProvider, ProviderChain},
    sampler::{CancellationToken, FrameSampler, VideoSource},
    session::{AnalysisMode, AnalysisResult, AnalysisSession, SessionState},
    similarity::{SimilarityEngine, SimilarityResult},
    speed::SpeedClass,
};
