//! Loading and saving of the reference pattern every clip is compared
//! against.
//!
//! A benchmark document is a [`MotionPattern`] with a `version` field:
//!
//! ```json
//! { "version": 1, "armSwingVelocities": [...], "bodyMovementVelocities": [...],
//!   "overallIntensities": [...], "releasePointFrame": 26,
//!   "actionPhases": { "runUp": {...}, "delivery": {...}, "followThrough": {...} } }
//! ```

use crate::{
    config::{AnalysisConfig, MIN_PATTERN_SAMPLES},
    error::Error,
    pattern::MotionPattern,
};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{debug, info, warn};

pub const SUPPORTED_VERSION: u32 = 1;

const BUNDLED_BENCHMARK: &str = include_str!("../data/benchmark.json");

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct BenchmarkDocument {
    pub version: u32,
    #[serde(flatten)]
    pub pattern: MotionPattern,
}

impl BenchmarkDocument {
    pub fn new(pattern: MotionPattern) -> Self {
        Self {
            version: SUPPORTED_VERSION,
            pattern,
        }
    }
}

/// Check a pattern before it is used as the reference. Every failure is
/// reported as [`Error::InvalidBenchmark`] so callers can offer a reload.
pub fn validate(pattern: &MotionPattern, min_samples: usize) -> Result<(), Error> {
    pattern
        .validate(min_samples)
        .map_err(|e| Error::InvalidBenchmark(e.to_string()))
}

/// Parse and validate a benchmark document.
pub fn parse(text: &str, min_samples: usize) -> Result<MotionPattern, Error> {
    let document: BenchmarkDocument = serde_json::from_str(text).map_err(Error::ParseBenchmark)?;
    if document.version != SUPPORTED_VERSION {
        return Err(Error::UnsupportedBenchmarkVersion(document.version));
    }
    validate(&document.pattern, min_samples)?;
    Ok(document.pattern)
}

/// Write `pattern` as a benchmark document at `path`.
pub fn save<P>(pattern: &MotionPattern, path: P) -> Result<(), Error>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let document = BenchmarkDocument::new(pattern.clone());
    let text = serde_json::to_string_pretty(&document).map_err(Error::SerializeBenchmark)?;
    std::fs::write(path, text).map_err(|e| Error::WriteBenchmark(e, path.to_owned()))?;
    info!(?path, samples = pattern.len(), "benchmark written");
    Ok(())
}

#[derive(Debug, Clone)]
enum Origin {
    Bundled,
    File(PathBuf),
    Pattern(Arc<MotionPattern>),
}

/// Read-only, lazily loaded benchmark pattern.
///
/// The first successful [`BenchmarkStore::get`] caches the pattern for the
/// lifetime of the store. Failures are not cached, so calling `get` again
/// retries the load.
#[derive(Debug)]
pub struct BenchmarkStore {
    origin: Origin,
    min_samples: usize,
    cached: Mutex<Option<Arc<MotionPattern>>>,
}

impl BenchmarkStore {
    fn with_origin(origin: Origin, min_samples: usize) -> Self {
        Self {
            origin,
            min_samples,
            cached: Mutex::new(None),
        }
    }

    /// The benchmark shipped with the crate.
    pub fn bundled() -> Self {
        Self::with_origin(Origin::Bundled, MIN_PATTERN_SAMPLES)
    }

    pub fn from_path<P>(path: P, min_samples: usize) -> Self
    where
        P: Into<PathBuf>,
    {
        Self::with_origin(Origin::File(path.into()), min_samples)
    }

    /// Use an already built pattern. It is validated on first use like any
    /// other origin.
    pub fn from_pattern(pattern: MotionPattern, min_samples: usize) -> Self {
        Self::with_origin(Origin::Pattern(Arc::new(pattern)), min_samples)
    }

    /// The configured benchmark file, or the bundled one.
    pub fn from_config(config: &AnalysisConfig) -> Self {
        match &config.benchmark_path {
            Some(path) => Self::from_path(path.clone(), config.min_samples),
            None => Self::with_origin(Origin::Bundled, config.min_samples),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn load(&self) -> Result<Arc<MotionPattern>, Error> {
        match &self.origin {
            Origin::Bundled => parse(BUNDLED_BENCHMARK, self.min_samples).map(Arc::new),
            Origin::File(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| Error::ReadBenchmark(e, path.clone()))?;
                parse(&text, self.min_samples).map(Arc::new)
            }
            Origin::Pattern(pattern) => {
                validate(pattern, self.min_samples)?;
                Ok(Arc::clone(pattern))
            }
        }
    }

    pub fn get(&self) -> Result<Arc<MotionPattern>, Error> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pattern) = cached.as_ref() {
            return Ok(Arc::clone(pattern));
        }
        match self.load() {
            Ok(pattern) => {
                debug!(origin = ?self.origin_name(), samples = pattern.len(), "benchmark loaded");
                *cached = Some(Arc::clone(&pattern));
                Ok(pattern)
            }
            Err(e) => {
                warn!(origin = ?self.origin_name(), error = %e, "failed to load benchmark");
                Err(e)
            }
        }
    }

    fn origin_name(&self) -> &str {
        match &self.origin {
            Origin::Bundled => "bundled",
            Origin::File(path) => path.to_str().unwrap_or("file"),
            Origin::Pattern(_) => "in-memory",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::tests::{bowling_pattern, reference_pattern};
    use crate::{error::ErrorKind, pattern::PhaseRange};

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("bowling-pose-{}-{}", std::process::id(), name))
    }

    #[test]
    fn bundled_benchmark_is_valid() {
        let store = BenchmarkStore::bundled();
        assert!(!store.is_loaded());
        let pattern = store.get().unwrap();
        assert_eq!(pattern.len(), 40);
        assert_eq!(pattern.release_point_frame, 26);
        assert!(pattern.has_angle_profile());
        let delivery = pattern.action_phases.delivery;
        assert!(delivery.start <= 26 && 26 <= delivery.end);
        assert!(store.is_loaded());
    }

    #[test]
    fn cached_pattern_is_shared() {
        let store = BenchmarkStore::bundled();
        let a = store.get().unwrap();
        let b = store.get().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn rejects_unknown_version() {
        let text = BUNDLED_BENCHMARK.replacen("\"version\": 1", "\"version\": 7", 1);
        let err = parse(&text, 10).unwrap_err();
        assert!(matches!(err, Error::UnsupportedBenchmarkVersion(7)));
        assert_eq!(err.kind(), ErrorKind::BenchmarkUnavailable);
    }

    #[test]
    fn rejects_missing_arrays() {
        let err = parse(r#"{ "version": 1, "releasePointFrame": 0 }"#, 10).unwrap_err();
        assert!(matches!(err, Error::ParseBenchmark(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn rejects_inconsistent_lengths() {
        let mut pattern = bowling_pattern(20);
        pattern.overall_intensities.pop();
        let err = validate(&pattern, 10).unwrap_err();
        assert!(matches!(err, Error::InvalidBenchmark(_)));
    }

    #[test]
    fn short_benchmark_is_unavailable() {
        let store = BenchmarkStore::from_pattern(reference_pattern(), 10);
        let err = store.get().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BenchmarkUnavailable);
        assert!(!store.is_loaded());
        assert!(BenchmarkStore::from_pattern(reference_pattern(), 5).get().is_ok());
    }

    #[test]
    fn missing_file_is_retryable() {
        let path = temp_path("missing.json");
        let store = BenchmarkStore::from_path(&path, 10);
        let err = store.get().unwrap_err();
        assert!(matches!(err, Error::ReadBenchmark(..)));
        assert!(err.is_retryable());

        save(&bowling_pattern(24), &path).unwrap();
        assert_eq!(store.get().unwrap().len(), 24);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn saved_document_loads_back() {
        let path = temp_path("saved.json");
        let mut pattern = bowling_pattern(30);
        pattern.action_phases.run_up = PhaseRange::new(0, 4);
        save(&pattern, &path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["version"], SUPPORTED_VERSION);
        assert_eq!(json["actionPhases"]["runUp"]["end"], 4);

        let loaded = BenchmarkStore::from_path(&path, 10).get().unwrap();
        assert_eq!(loaded.len(), pattern.len());
        assert_eq!(loaded.release_point_frame, pattern.release_point_frame);
        assert_eq!(loaded.action_phases, pattern.action_phases);
        std::fs::remove_file(&path).unwrap();
    }
}
