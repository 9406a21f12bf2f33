//! Tunable parameters for a whole analysis run.
//!
//! Every section deserializes with defaults, so a JSON file only needs to
//! name the values it overrides:
//!
//! ```json
//! { "sampler": { "fps": 15.0 }, "similarity": { "weights": { "armSwing": 0.5 } } }
//! ```

use crate::{
    error::Error, features::FeatureConfig, pattern::SegmentationConfig,
    provider::DEFAULT_MAX_CONSECUTIVE_FAILURES, sampler::SamplerConfig,
    similarity::SimilarityConfig, speed::SpeedConfig,
};
use std::path::{Path, PathBuf};

/// Clips with fewer motion samples than this cannot be compared.
pub const MIN_PATTERN_SAMPLES: usize = 10;

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AnalysisConfig {
    pub sampler: SamplerConfig,
    pub features: FeatureConfig,
    pub segmentation: SegmentationConfig,
    pub similarity: SimilarityConfig,
    pub speed: SpeedConfig,
    pub min_samples: usize,
    /// Consecutive frames pose detection may fail on before the session
    /// gives up. Fewer failures just drop those frames.
    pub max_provider_failures: usize,
    /// Benchmark document to compare against; the bundled benchmark is used
    /// when unset.
    pub benchmark_path: Option<PathBuf>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            sampler: Default::default(),
            features: Default::default(),
            segmentation: Default::default(),
            similarity: Default::default(),
            speed: Default::default(),
            min_samples: MIN_PATTERN_SAMPLES,
            max_provider_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            benchmark_path: None,
        }
    }
}

impl AnalysisConfig {
    pub fn from_path<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).map_err(|e| Error::ReadConfig(e, path.to_owned()))?;
        let config = Self::from_json(&text)?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(text).map_err(Error::ParseConfig)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.min_samples < 2 {
            return Err(Error::InvalidConfig(format!(
                "minSamples must be at least 2, got {}",
                self.min_samples
            )));
        }
        if self.max_provider_failures == 0 {
            return Err(Error::InvalidConfig(
                "maxProviderFailures must be at least 1".into(),
            ));
        }
        self.sampler.validate()?;
        self.features.validate()?;
        self.segmentation.validate()?;
        self.similarity.validate()?;
        self.speed.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::{AnalysisConfig, MIN_PATTERN_SAMPLES};
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn empty_document_gives_defaults() {
        let config = AnalysisConfig::from_json("{}").unwrap();
        assert_eq!(config, AnalysisConfig::default());
        assert_eq!(config.min_samples, MIN_PATTERN_SAMPLES);
    }

    #[test]
    fn partial_override() {
        let config = AnalysisConfig::from_json(
            r#"{ "sampler": { "fps": 15.0 }, "similarity": { "weights": { "armSwing": 0.5 } } }"#,
        )
        .unwrap();
        assert_approx_eq!(config.sampler.fps, 15.0);
        assert_approx_eq!(config.similarity.weights.arm_swing, 0.5);
        assert_approx_eq!(config.similarity.weights.release_point, 0.25);
        assert_eq!(config.sampler.width, 320);
    }

    #[test]
    fn rejects_non_positive_fps() {
        assert!(AnalysisConfig::from_json(r#"{ "sampler": { "fps": 0.0 } }"#).is_err());
    }

    #[test]
    fn rejects_tiny_min_samples() {
        assert!(AnalysisConfig::from_json(r#"{ "minSamples": 1 }"#).is_err());
    }

    #[test]
    fn rejects_zero_provider_failures() {
        assert!(AnalysisConfig::from_json(r#"{ "maxProviderFailures": 0 }"#).is_err());
        assert_eq!(AnalysisConfig::default().max_provider_failures, 3);
    }

    #[test]
    fn rejects_unparseable_document() {
        assert!(AnalysisConfig::from_json("not json").is_err());
    }
}
