//! Comparison of an input motion pattern against a benchmark.
//!
//! Every series comparison goes through [`SimilarityConfig::compare_arrays`]:
//! non-finite values are dropped, both series are resampled to a common
//! length by index position, and the Pearson correlation is mapped from
//! `[-1, 1]` onto `[0, 1]`. Component scores are then combined with fixed
//! weights. Indeterminate values never reach the final score: they are
//! replaced with [`NEUTRAL_SIMILARITY`].

use crate::{
    config::MIN_PATTERN_SAMPLES,
    error::Error,
    pattern::{MotionPattern, Phase},
};
use ndarray::{Array1, ArrayView1};
use num_traits::ToPrimitive;
use tracing::{debug, instrument};

/// Score used where a comparison is indeterminate: neither a reward nor a
/// penalty.
pub const NEUTRAL_SIMILARITY: f64 = 0.5;

const DEFAULT_RECOMMENDATION_THRESHOLD: f64 = 0.6;
const DEFAULT_NEAR_IDENTICAL_TOLERANCE: f64 = 0.001;
const DEFAULT_NEAR_IDENTICAL_RATIO: f64 = 0.8;
const DEFAULT_NEAR_IDENTICAL_SCORE: f64 = 0.95;
const DEFAULT_MAX_RESAMPLE_LEN: usize = 30;
const ZERO_VARIANCE: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimilarityWeights {
    pub arm_swing: f64,
    pub release_point: f64,
    pub rhythm: f64,
    pub follow_through: f64,
    pub run_up: f64,
    pub delivery: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            arm_swing: 0.40,
            release_point: 0.25,
            rhythm: 0.15,
            follow_through: 0.15,
            run_up: 0.10,
            delivery: 0.05,
        }
    }
}

impl SimilarityWeights {
    fn pairs(&self) -> [(Metric, f64); 6] {
        [
            (Metric::ArmSwing, self.arm_swing),
            (Metric::ReleasePoint, self.release_point),
            (Metric::Rhythm, self.rhythm),
            (Metric::RunUp, self.run_up),
            (Metric::Delivery, self.delivery),
            (Metric::FollowThrough, self.follow_through),
        ]
    }

    pub fn total(&self) -> f64 {
        self.pairs().iter().map(|(_, w)| w).sum()
    }

    pub fn validate(&self) -> Result<(), Error> {
        if let Some((metric, w)) = self
            .pairs()
            .iter()
            .find(|(_, w)| !w.is_finite() || *w < 0.0)
        {
            return Err(Error::InvalidConfig(format!(
                "weight for {} must be a non-negative number, got {}",
                metric.name(),
                w
            )));
        }
        if self.total() <= 0.0 {
            return Err(Error::InvalidConfig("similarity weights sum to zero".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimilarityConfig {
    pub weights: SimilarityWeights,
    /// Metrics scoring below this produce a recommendation.
    pub recommendation_threshold: f64,
    /// Element pairs closer than this count as identical.
    pub near_identical_tolerance: f64,
    /// Fraction of identical pairs above which two series short-circuit to
    /// `near_identical_score`.
    pub near_identical_ratio: f64,
    pub near_identical_score: f64,
    /// Upper bound on the common length series are resampled to.
    pub max_resample_len: usize,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            weights: Default::default(),
            recommendation_threshold: DEFAULT_RECOMMENDATION_THRESHOLD,
            near_identical_tolerance: DEFAULT_NEAR_IDENTICAL_TOLERANCE,
            near_identical_ratio: DEFAULT_NEAR_IDENTICAL_RATIO,
            near_identical_score: DEFAULT_NEAR_IDENTICAL_SCORE,
            max_resample_len: DEFAULT_MAX_RESAMPLE_LEN,
        }
    }
}

/// Linearly interpolate `values` onto `target` evenly spaced index positions,
/// keeping the first and last samples.
pub fn resample(values: &[f64], target: usize) -> Vec<f64> {
    match (values.len(), target) {
        (_, 0) | (0, _) => Vec::new(),
        (n, t) if n == t => values.to_vec(),
        (_, 1) => vec![values[0]],
        (1, t) => vec![values[0]; t],
        (n, t) => {
            let last = (n - 1) as f64;
            let step = last / (t - 1) as f64;
            (0..t)
                .map(|i| {
                    let position = (i as f64 * step).min(last);
                    let lower = position.floor();
                    let frac = position - lower;
                    let lower = lower.to_usize().unwrap_or(0).min(n - 1);
                    let upper = (lower + 1).min(n - 1);
                    values[lower] + (values[upper] - values[lower]) * frac
                })
                .collect()
        }
    }
}

enum Correlation {
    Coefficient(f64),
    BothFlat { mean_gap: f64 },
    OneFlat,
}

fn correlation(a: ArrayView1<f64>, b: ArrayView1<f64>) -> Correlation {
    let (mean_a, mean_b) = match (a.mean(), b.mean()) {
        (Some(mean_a), Some(mean_b)) => (mean_a, mean_b),
        _ => return Correlation::Coefficient(0.0),
    };
    let da = &a - mean_a;
    let db = &b - mean_b;
    let var_a = da.dot(&da);
    let var_b = db.dot(&db);

    match (var_a < ZERO_VARIANCE, var_b < ZERO_VARIANCE) {
        (true, true) => {
            return Correlation::BothFlat {
                mean_gap: (mean_a - mean_b).abs(),
            }
        }
        (true, false) | (false, true) => return Correlation::OneFlat,
        (false, false) => {}
    }

    let denominator = (var_a * var_b).sqrt();
    if !denominator.is_finite() || denominator == 0.0 {
        return Correlation::Coefficient(0.0);
    }
    Correlation::Coefficient(da.dot(&db) / denominator)
}

/// Replace an indeterminate score with the neutral one.
fn neutral_if_non_finite(value: f64, what: &'static str) -> f64 {
    if value.is_finite() {
        value
    } else {
        debug!(
            target: "bowling_pose::anomaly",
            what,
            value,
            "non-finite similarity replaced with neutral score"
        );
        NEUTRAL_SIMILARITY
    }
}

impl SimilarityConfig {
    pub fn validate(&self) -> Result<(), Error> {
        self.weights.validate()?;
        if self.max_resample_len < 2 {
            return Err(Error::InvalidConfig(format!(
                "maxResampleLen must be at least 2, got {}",
                self.max_resample_len
            )));
        }
        for (name, value) in [
            ("recommendationThreshold", self.recommendation_threshold),
            ("nearIdenticalRatio", self.near_identical_ratio),
            ("nearIdenticalScore", self.near_identical_score),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidConfig(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if !(self.near_identical_tolerance >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "nearIdenticalTolerance must be non-negative, got {}",
                self.near_identical_tolerance
            )));
        }
        Ok(())
    }

    /// Shape similarity of two series in `[0, 1]`.
    pub fn compare_arrays(&self, a: &[f64], b: &[f64]) -> f64 {
        let finite = |values: &[f64]| {
            values
                .iter()
                .copied()
                .filter(|v| v.is_finite())
                .collect::<Vec<_>>()
        };
        let (a, b) = (finite(a), finite(b));
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }

        let target = a.len().min(b.len()).min(self.max_resample_len);
        let a = Array1::from(resample(&a, target));
        let b = Array1::from(resample(&b, target));

        let close = a
            .iter()
            .zip(b.iter())
            .filter(|(x, y)| (*x - *y).abs() < self.near_identical_tolerance)
            .count();
        if close as f64 >= self.near_identical_ratio * target as f64 {
            return self.near_identical_score;
        }

        let similarity = match correlation(a.view(), b.view()) {
            Correlation::Coefficient(r) => (r.clamp(-1.0, 1.0) + 1.0) / 2.0,
            Correlation::BothFlat { mean_gap } if mean_gap < self.near_identical_tolerance => 1.0,
            Correlation::BothFlat { .. } | Correlation::OneFlat => 0.0,
        };
        neutral_if_non_finite(similarity, "compare_arrays")
    }
}

/// [`SimilarityConfig::compare_arrays`] with the default tuning.
pub fn compare_arrays(a: &[f64], b: &[f64]) -> f64 {
    SimilarityConfig::default().compare_arrays(a, b)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Metric {
    ArmSwing,
    ReleasePoint,
    Rhythm,
    RunUp,
    Delivery,
    FollowThrough,
}

impl Metric {
    pub fn name(self) -> &'static str {
        match self {
            Metric::ArmSwing => "armSwing",
            Metric::ReleasePoint => "releasePoint",
            Metric::Rhythm => "rhythm",
            Metric::RunUp => "runUp",
            Metric::Delivery => "delivery",
            Metric::FollowThrough => "followThrough",
        }
    }

    fn tip(self) -> &'static str {
        match self {
            Metric::ArmSwing => {
                "Work on arm speed: rotate the bowling arm faster and fuller through the crease."
            }
            Metric::ReleasePoint => {
                "Your release timing differs from the benchmark: let the ball go at the top of the arm arc."
            }
            Metric::Rhythm => "Keep a steady rhythm from the start of the run-up to the finish.",
            Metric::RunUp => "Build momentum gradually through the run-up instead of rushing or stalling.",
            Metric::Delivery => "Drive through the delivery stride with a braced front leg.",
            Metric::FollowThrough => {
                "Finish the follow-through: let the bowling arm carry across the body."
            }
        }
    }
}

const ALL_GOOD: &str = "Great action! Your bowling closely matches the benchmark.";

/// Per-metric similarities, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricBreakdown {
    pub arm_swing: f64,
    pub release_point: f64,
    pub rhythm: f64,
    pub run_up: f64,
    pub delivery: f64,
    pub follow_through: f64,
}

impl MetricBreakdown {
    pub fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::ArmSwing => self.arm_swing,
            Metric::ReleasePoint => self.release_point,
            Metric::Rhythm => self.rhythm,
            Metric::RunUp => self.run_up,
            Metric::Delivery => self.delivery,
            Metric::FollowThrough => self.follow_through,
        }
    }

    fn phase_mut(&mut self, phase: Phase) -> &mut f64 {
        match phase {
            Phase::RunUp => &mut self.run_up,
            Phase::Delivery => &mut self.delivery,
            Phase::FollowThrough => &mut self.follow_through,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarityResult {
    /// Weighted overall similarity in `[0, 1]`.
    pub overall_similarity: f64,
    pub per_metric: MetricBreakdown,
    pub recommendations: Vec<String>,
}

/// Scores input patterns against a benchmark.
#[derive(Debug, Clone)]
pub struct SimilarityEngine {
    config: SimilarityConfig,
    min_samples: usize,
}

impl Default for SimilarityEngine {
    fn default() -> Self {
        Self::new(SimilarityConfig::default(), MIN_PATTERN_SAMPLES)
    }
}

impl SimilarityEngine {
    pub fn new(config: SimilarityConfig, min_samples: usize) -> Self {
        Self {
            config,
            min_samples,
        }
    }

    pub fn config(&self) -> &SimilarityConfig {
        &self.config
    }

    fn check(&self, input: &MotionPattern, benchmark: &MotionPattern) -> Result<(), Error> {
        benchmark
            .validate(self.min_samples)
            .map_err(|e| Error::InvalidBenchmark(e.to_string()))?;
        input.validate(self.min_samples)
    }

    /// Release timing similarity: how close the two releases sit as a
    /// fraction of their own timelines. A pattern without any arm movement
    /// has no release and cannot match one that does.
    pub fn release_point_similarity(&self, input: &MotionPattern, benchmark: &MotionPattern) -> f64 {
        if input.has_release() != benchmark.has_release() {
            return 0.0;
        }
        let gap = (input.release_fraction() - benchmark.release_fraction()).abs();
        neutral_if_non_finite((1.0 - gap).clamp(0.0, 1.0), "release_point")
    }

    /// Similarity of the intensity curves within one phase, neutral when
    /// either range does not describe a slice of its own pattern.
    pub fn phase_similarity(&self, input: &MotionPattern, benchmark: &MotionPattern, phase: Phase) -> f64 {
        let slice = |pattern: &MotionPattern| {
            pattern
                .action_phases
                .get(phase)
                .slice(&pattern.overall_intensities)
                .map(<[f64]>::to_vec)
        };
        match (slice(input), slice(benchmark)) {
            (Some(a), Some(b)) => self.config.compare_arrays(&a, &b),
            _ => {
                debug!(?phase, "phase range unusable, scoring neutrally");
                NEUTRAL_SIMILARITY
            }
        }
    }

    fn breakdown(&self, input: &MotionPattern, benchmark: &MotionPattern) -> MetricBreakdown {
        let compare = |a: &[f64], b: &[f64]| self.config.compare_arrays(a, b);
        let mut breakdown = MetricBreakdown {
            arm_swing: compare(&input.arm_swing_velocities, &benchmark.arm_swing_velocities),
            release_point: self.release_point_similarity(input, benchmark),
            rhythm: compare(&input.overall_intensities, &benchmark.overall_intensities),
            ..Default::default()
        };
        for &phase in Phase::ALL.iter() {
            *breakdown.phase_mut(phase) = self.phase_similarity(input, benchmark, phase);
        }
        breakdown
    }

    /// Weighted mean of the metric scores, normalized by the weight total.
    pub fn weighted_score(&self, breakdown: &MetricBreakdown) -> f64 {
        let weights = &self.config.weights;
        let total = weights.total();
        if total <= 0.0 {
            return NEUTRAL_SIMILARITY;
        }
        let sum = weights
            .pairs()
            .iter()
            .map(|&(metric, w)| w * neutral_if_non_finite(breakdown.get(metric), metric.name()))
            .sum::<f64>();
        neutral_if_non_finite(sum / total, "overall").clamp(0.0, 1.0)
    }

    pub fn recommendations(&self, breakdown: &MetricBreakdown) -> Vec<String> {
        let tips = self
            .config
            .weights
            .pairs()
            .iter()
            .map(|&(metric, _)| metric)
            .filter(|&metric| breakdown.get(metric) < self.config.recommendation_threshold)
            .map(|metric| metric.tip().to_owned())
            .collect::<Vec<_>>();
        if tips.is_empty() {
            vec![ALL_GOOD.to_owned()]
        } else {
            tips
        }
    }

    /// Score `input` against `benchmark`. Both must be finalized patterns
    /// with enough samples; otherwise nothing is scored.
    #[instrument(name = "SimilarityEngine::compare", skip_all, fields(input_len = input.len(), benchmark_len = benchmark.len()))]
    pub fn compare(&self, input: &MotionPattern, benchmark: &MotionPattern) -> Result<SimilarityResult, Error> {
        self.check(input, benchmark)?;
        let per_metric = self.breakdown(input, benchmark);
        let overall_similarity = self.weighted_score(&per_metric);
        debug!(overall_similarity, ?per_metric, "patterns compared");
        Ok(SimilarityResult {
            overall_similarity,
            recommendations: self.recommendations(&per_metric),
            per_metric,
        })
    }

    /// Like [`SimilarityEngine::compare`], but the overall score is the
    /// similarity of the two elbow angle profiles.
    #[instrument(name = "SimilarityEngine::compare_pose_profiles", skip_all)]
    pub fn compare_pose_profiles(
        &self,
        input: &MotionPattern,
        benchmark: &MotionPattern,
    ) -> Result<SimilarityResult, Error> {
        let mut result = self.compare(input, benchmark)?;
        if !benchmark.has_angle_profile() {
            return Err(Error::MissingAngleProfile("benchmark"));
        }
        if !input.has_angle_profile() {
            return Err(Error::MissingAngleProfile("input"));
        }
        let profile = self
            .config
            .compare_arrays(&input.elbow_angles, &benchmark.elbow_angles);
        result.overall_similarity = neutral_if_non_finite(profile, "pose_profile").clamp(0.0, 1.0);
        Ok(result)
    }
}
