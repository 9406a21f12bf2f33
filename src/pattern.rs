use crate::{config::MIN_PATTERN_SAMPLES, error::Error, features::MotionSample};
use num_traits::ToPrimitive;
use tracing::{debug, warn};

/// Inclusive index range over a pattern's timeline.
///
/// Indices are signed so that malformed documents still load and are
/// scored neutrally instead of being rejected outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
pub struct PhaseRange {
    pub start: i64,
    pub end: i64,
}

impl PhaseRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    fn from_indices(start: usize, end: usize) -> Self {
        Self {
            start: start.to_i64().unwrap_or(i64::MAX),
            end: end.to_i64().unwrap_or(i64::MAX),
        }
    }

    /// The part of `values` covered by this range, or `None` when the range
    /// is negative, reversed or runs past the end.
    pub fn slice<'a>(&self, values: &'a [f64]) -> Option<&'a [f64]> {
        let start = self.start.to_usize()?;
        let end = self.end.to_usize()?;
        if start > end || end >= values.len() {
            return None;
        }
        Some(&values[start..=end])
    }

    pub fn len(&self) -> usize {
        self.end
            .saturating_sub(self.start)
            .saturating_add(1)
            .to_usize()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    RunUp,
    Delivery,
    FollowThrough,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::RunUp, Phase::Delivery, Phase::FollowThrough];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionPhases {
    pub run_up: PhaseRange,
    pub delivery: PhaseRange,
    pub follow_through: PhaseRange,
}

impl ActionPhases {
    pub fn get(&self, phase: Phase) -> PhaseRange {
        match phase {
            Phase::RunUp => self.run_up,
            Phase::Delivery => self.delivery,
            Phase::FollowThrough => self.follow_through,
        }
    }
}

/// Time series description of one bowling action.
#[derive(Debug, Clone, PartialEq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MotionPattern {
    pub arm_swing_velocities: Vec<f64>,
    pub body_movement_velocities: Vec<f64>,
    pub overall_intensities: Vec<f64>,
    pub release_point_frame: usize,
    pub action_phases: ActionPhases,
    /// Elbow angle of the bowling arm per sample, in degrees. Empty when the
    /// arm was never fully visible.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub elbow_angles: Vec<f64>,
}

impl MotionPattern {
    /// Build a pattern from arm and body series, deriving intensities,
    /// release point and phases.
    pub fn from_velocities(arm_swing: &[f64], body_movement: &[f64], config: &SegmentationConfig) -> Self {
        let mut builder = PatternBuilder::new(config.clone(), MIN_PATTERN_SAMPLES);
        arm_swing
            .iter()
            .zip(body_movement)
            .for_each(|(&arm, &body)| builder.add_sample(arm, body));
        builder.finalize()
    }

    pub fn len(&self) -> usize {
        self.overall_intensities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overall_intensities.is_empty()
    }

    /// Check the structural invariants and that there is enough data to
    /// compare. Phase ranges are deliberately not checked: bad ranges are
    /// scored neutrally by the similarity engine.
    pub fn validate(&self, min_samples: usize) -> Result<(), Error> {
        let len = self.len();
        if self.arm_swing_velocities.len() != len || self.body_movement_velocities.len() != len {
            return Err(Error::InvalidPattern(format!(
                "series lengths differ: armSwing {}, bodyMovement {}, overallIntensities {}",
                self.arm_swing_velocities.len(),
                self.body_movement_velocities.len(),
                len
            )));
        }
        if !self.elbow_angles.is_empty() && self.elbow_angles.len() != len {
            return Err(Error::InvalidPattern(format!(
                "elbowAngles has {} samples, expected {}",
                self.elbow_angles.len(),
                len
            )));
        }
        if len < min_samples {
            return Err(Error::InsufficientData {
                samples: len,
                required: min_samples,
            });
        }
        if self.release_point_frame >= len {
            return Err(Error::InvalidPattern(format!(
                "releasePointFrame {} is outside a timeline of {} samples",
                self.release_point_frame, len
            )));
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate(MIN_PATTERN_SAMPLES).is_ok()
    }

    /// Release position as a fraction of the timeline, in `[0, 1)`.
    pub fn release_fraction(&self) -> f64 {
        match (self.release_point_frame.to_f64(), self.len().to_f64()) {
            (Some(release), Some(len)) if len > 0.0 => release / len,
            _ => 0.0,
        }
    }

    /// Whether the arm moved at all, i.e. whether the release point marks a
    /// real peak rather than defaulting to the first sample.
    pub fn has_release(&self) -> bool {
        self.arm_swing_velocities
            .get(self.release_point_frame)
            .map_or(false, |&v| v.is_finite() && v > 0.0)
    }

    pub fn has_angle_profile(&self) -> bool {
        !self.elbow_angles.is_empty() && self.elbow_angles.len() == self.len()
    }
}

const DEFAULT_DELIVERY_THRESHOLD_RATIO: f64 = 0.5;
const DEFAULT_MAX_DELIVERY_FRACTION: f64 = 0.6;

/// Phase segmentation parameters.
///
/// The delivery phase grows outwards from the release point while intensity
/// stays at or above `delivery_threshold_ratio` times the intensity at
/// release, and never spans more than `max_delivery_fraction` of the
/// timeline. Everything before it is run-up, everything after it is
/// follow-through.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SegmentationConfig {
    pub delivery_threshold_ratio: f64,
    pub max_delivery_fraction: f64,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            delivery_threshold_ratio: DEFAULT_DELIVERY_THRESHOLD_RATIO,
            max_delivery_fraction: DEFAULT_MAX_DELIVERY_FRACTION,
        }
    }
}

impl SegmentationConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&self.delivery_threshold_ratio) {
            return Err(Error::InvalidConfig(format!(
                "deliveryThresholdRatio must be within [0, 1], got {}",
                self.delivery_threshold_ratio
            )));
        }
        if !(self.max_delivery_fraction > 0.0 && self.max_delivery_fraction <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "maxDeliveryFraction must be within (0, 1], got {}",
                self.max_delivery_fraction
            )));
        }
        Ok(())
    }
}

/// Index of the largest finite value, first occurrence on ties. Zero for an
/// empty or entirely non-finite series.
pub fn release_point(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, best_v)) if best_v >= v => best,
            _ => Some((i, v)),
        })
        .map_or(0, |(i, _)| i)
}

/// Split `intensities` into run-up, delivery and follow-through around
/// `release`. The ranges are contiguous, ordered and cover the timeline, and
/// delivery always contains `release`. A release on the first or last sample
/// leaves the run-up or follow-through empty.
pub fn segment_phases(intensities: &[f64], release: usize, config: &SegmentationConfig) -> ActionPhases {
    let len = intensities.len();
    let len_i64 = len.to_i64().unwrap_or(0);
    if len < 3 {
        return ActionPhases {
            run_up: PhaseRange::new(0, -1),
            delivery: PhaseRange::from_indices(0, len.saturating_sub(1)),
            follow_through: PhaseRange::new(len_i64, len_i64 - 1),
        };
    }

    let last = len - 1;
    let value = |i: usize| {
        let v = intensities[i];
        if v.is_finite() {
            v
        } else {
            0.0
        }
    };
    let release = release.min(last);
    let peak = value(release);
    let threshold = peak * config.delivery_threshold_ratio;

    // Interior releases keep a sample on either side for the outer phases.
    let lo = if release == 0 { 0 } else { 1 };
    let hi = if release == last { last } else { last - 1 };
    let mut start = release.saturating_sub(1).max(lo);
    let mut end = (release + 1).min(hi);
    if peak > 0.0 {
        while start > lo && value(start - 1) >= threshold {
            start -= 1;
        }
        while end < hi && value(end + 1) >= threshold {
            end += 1;
        }
    }

    let max_width = (len.to_f64().unwrap_or(0.0) * config.max_delivery_fraction)
        .floor()
        .to_usize()
        .unwrap_or(1)
        .max(1);
    while end - start + 1 > max_width {
        if release - start > end - release {
            start += 1;
        } else if end > release {
            end -= 1;
        } else {
            start += 1;
        }
    }

    let start_i64 = start.to_i64().unwrap_or(0);
    let end_i64 = end.to_i64().unwrap_or(0);
    ActionPhases {
        run_up: PhaseRange::new(0, start_i64 - 1),
        delivery: PhaseRange::new(start_i64, end_i64),
        follow_through: PhaseRange::new(end_i64 + 1, len_i64 - 1),
    }
}

/// Accumulates motion samples for one clip.
#[derive(Debug, Clone)]
pub struct PatternBuilder {
    segmentation: SegmentationConfig,
    min_samples: usize,
    arm_swing: Vec<f64>,
    body_movement: Vec<f64>,
    intensities: Vec<f64>,
    elbow_angles: Vec<Option<f64>>,
}

impl Default for PatternBuilder {
    fn default() -> Self {
        Self::new(SegmentationConfig::default(), MIN_PATTERN_SAMPLES)
    }
}

fn sanitize(value: f64, series: &'static str) -> f64 {
    if value.is_finite() && value >= 0.0 {
        value
    } else {
        debug!(
            target: "bowling_pose::anomaly",
            series,
            value,
            "invalid velocity replaced with 0"
        );
        0.0
    }
}

impl PatternBuilder {
    pub fn new(segmentation: SegmentationConfig, min_samples: usize) -> Self {
        Self {
            segmentation,
            min_samples,
            arm_swing: Vec::new(),
            body_movement: Vec::new(),
            intensities: Vec::new(),
            elbow_angles: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.intensities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intensities.is_empty()
    }

    pub fn add_sample(&mut self, arm_swing: f64, body_movement: f64) {
        let arm = sanitize(arm_swing, "arm_swing");
        let body = sanitize(body_movement, "body_movement");
        self.arm_swing.push(arm);
        self.body_movement.push(body);
        self.intensities.push(arm + body);
        self.elbow_angles.push(None);
    }

    pub fn add(&mut self, sample: &MotionSample) {
        self.add_sample(sample.arm_swing, sample.body_movement);
        if let Some(slot) = self.elbow_angles.last_mut() {
            *slot = sample.elbow_angle.filter(|a| a.is_finite());
        }
    }

    /// Gaps take the previous known angle; leading gaps take the first one.
    fn angle_profile(&self) -> Vec<f64> {
        let first = match self.elbow_angles.iter().flatten().next() {
            Some(&first) => first,
            None => return Vec::new(),
        };
        self.elbow_angles
            .iter()
            .scan(first, |last, angle| {
                if let Some(angle) = angle {
                    *last = *angle;
                }
                Some(*last)
            })
            .collect()
    }

    /// Detect the release point and segment the phases. With fewer than the
    /// minimum number of samples no segmentation is attempted and the result
    /// fails [`MotionPattern::validate`].
    pub fn finalize(self) -> MotionPattern {
        let elbow_angles = self.angle_profile();
        let len = self.len();
        let (release_point_frame, action_phases) = if len < self.min_samples {
            warn!(
                samples = len,
                required = self.min_samples,
                "too few motion samples, pattern left unsegmented"
            );
            (0, ActionPhases::default())
        } else {
            let release = release_point(&self.arm_swing);
            let phases = segment_phases(&self.intensities, release, &self.segmentation);
            debug!(samples = len, release, ?phases, "pattern finalized");
            (release, phases)
        };

        MotionPattern {
            arm_swing_velocities: self.arm_swing,
            body_movement_velocities: self.body_movement,
            overall_intensities: self.intensities,
            release_point_frame,
            action_phases,
            elbow_angles,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// The small hand-built benchmark used across the similarity tests.
    pub(crate) fn reference_pattern() -> MotionPattern {
        let arm = vec![0.0, 1.0, 2.0, 8.0, 3.0, 1.0, 0.0];
        MotionPattern {
            overall_intensities: arm.iter().map(|v| v * 2.0).collect(),
            body_movement_velocities: arm.clone(),
            arm_swing_velocities: arm,
            release_point_frame: 3,
            action_phases: ActionPhases {
                run_up: PhaseRange::new(0, 1),
                delivery: PhaseRange::new(2, 4),
                follow_through: PhaseRange::new(5, 6),
            },
            elbow_angles: Vec::new(),
        }
    }

    /// A bell-shaped action of `len` samples peaking two thirds of the way in.
    pub(crate) fn bowling_pattern(len: usize) -> MotionPattern {
        let peak = len as f64 * 2.0 / 3.0;
        let width = len as f64 / 8.0;
        let arm = (0..len)
            .map(|i| 10.0 * (-((i as f64 - peak) / width).powi(2)).exp() + 0.1 * i as f64 / len as f64)
            .collect::<Vec<_>>();
        let body = (0..len)
            .map(|i| 1.0 + (i as f64 / len as f64) * 2.0)
            .collect::<Vec<_>>();
        let mut builder = PatternBuilder::default();
        for (i, (&a, &b)) in arm.iter().zip(&body).enumerate() {
            builder.add(&MotionSample {
                arm_swing: a,
                body_movement: b,
                elbow_angle: Some(170.0 - 60.0 * (i as f64 / len as f64)),
            });
        }
        builder.finalize()
    }

    fn assert_phases_well_formed(phases: &ActionPhases, len: usize) {
        let ActionPhases {
            run_up,
            delivery,
            follow_through,
        } = *phases;
        let len = len as i64;
        assert_eq!(run_up.start, 0);
        assert!(run_up.end < delivery.start);
        assert!(delivery.start <= delivery.end);
        assert!(delivery.end < follow_through.start);
        assert_eq!(follow_through.end, len - 1);
        assert_eq!(run_up.len() + delivery.len() + follow_through.len(), len as usize);
    }

    mod release_point_tests {
        use super::release_point;

        #[test]
        fn first_maximum_wins() {
            assert_eq!(release_point(&[0.0, 3.0, 1.0, 3.0]), 1);
        }

        #[test]
        fn non_finite_values_are_ignored() {
            assert_eq!(release_point(&[1.0, f64::INFINITY, f64::NAN, 2.0]), 3);
        }

        #[test]
        fn flat_or_empty_series_release_at_zero() {
            assert_eq!(release_point(&[]), 0);
            assert_eq!(release_point(&[0.0; 12]), 0);
        }
    }

    mod segment_phases_tests {
        use super::*;

        #[test]
        fn delivery_surrounds_peak() {
            let intensities = [0.1, 0.2, 0.3, 0.5, 2.0, 4.0, 8.0, 5.0, 3.0, 0.4, 0.2, 0.1];
            let phases = segment_phases(&intensities, 6, &SegmentationConfig::default());
            assert_eq!(phases.delivery, PhaseRange::new(5, 7));
            assert_eq!(phases.run_up, PhaseRange::new(0, 4));
            assert_eq!(phases.follow_through, PhaseRange::new(8, 11));
        }

        #[test]
        fn release_at_edges_is_inside_delivery() {
            let intensities = [9.0, 8.0, 7.0, 6.0, 5.0, 4.0, 3.0, 2.0, 1.0, 0.5];
            for &release in &[0, 9] {
                let phases = segment_phases(&intensities, release, &SegmentationConfig::default());
                assert_phases_well_formed(&phases, intensities.len());
                assert!(phases.delivery.start <= release as i64);
                assert!(release as i64 <= phases.delivery.end);
            }
            let phases = segment_phases(&intensities, 0, &SegmentationConfig::default());
            assert!(phases.run_up.is_empty());
            assert_eq!(phases.delivery, PhaseRange::new(0, 4));
        }

        #[test]
        fn isolated_spike_at_either_end() {
            for &peak in &[0, 11] {
                let mut builder = PatternBuilder::default();
                for i in 0..12 {
                    builder.add_sample(if i == peak { 9.0 } else { 0.5 }, 0.5);
                }
                let pattern = builder.finalize();
                let phases = pattern.action_phases;
                assert_eq!(pattern.release_point_frame, peak);
                assert_phases_well_formed(&phases, 12);
                assert!(phases.delivery.start <= peak as i64);
                assert!(peak as i64 <= phases.delivery.end);
                assert!(phases.delivery.len() <= 2, "{:?}", phases);
            }
        }

        #[test]
        fn wide_plateau_is_capped() {
            let intensities = [5.0; 20];
            let phases = segment_phases(&intensities, 10, &SegmentationConfig::default());
            assert_phases_well_formed(&phases, 20);
            assert!(phases.delivery.len() <= 12);
        }

        #[test]
        fn flat_zero_series() {
            let phases = segment_phases(&[0.0; 10], 0, &SegmentationConfig::default());
            assert_phases_well_formed(&phases, 10);
        }

        #[test]
        fn tiny_series_do_not_panic() {
            for len in 0..3 {
                let phases = segment_phases(&vec![1.0; len], 0, &SegmentationConfig::default());
                assert!(phases.run_up.is_empty());
            }
        }
    }

    mod builder_tests {
        use super::*;

        #[test]
        fn intensities_are_sums() {
            let mut builder = PatternBuilder::default();
            builder.add_sample(1.0, 2.0);
            builder.add_sample(f64::NAN, 1.0);
            builder.add_sample(f64::INFINITY, -3.0);
            let pattern = builder.finalize();
            assert_eq!(pattern.overall_intensities, vec![3.0, 1.0, 0.0]);
            assert_eq!(pattern.arm_swing_velocities, vec![1.0, 0.0, 0.0]);
        }

        #[test]
        fn short_clips_are_invalid() {
            let mut builder = PatternBuilder::default();
            for i in 0..9 {
                builder.add_sample(i as f64, 1.0);
            }
            let pattern = builder.finalize();
            assert!(!pattern.is_valid());
            assert!(matches!(
                pattern.validate(MIN_PATTERN_SAMPLES),
                Err(Error::InsufficientData {
                    samples: 9,
                    required: 10
                })
            ));
        }

        #[test]
        fn finalize_detects_release_and_phases() {
            let pattern = bowling_pattern(30);
            assert!(pattern.is_valid());
            assert_eq!(pattern.release_point_frame, 20);
            assert_phases_well_formed(&pattern.action_phases, 30);
            assert!(pattern.action_phases.delivery.start <= 20);
            assert!(pattern.action_phases.delivery.end >= 20);
            assert!(pattern.has_release());
            assert!(pattern.has_angle_profile());
        }

        #[test]
        fn angle_gaps_are_filled() {
            let mut builder = PatternBuilder::default();
            let angles = [None, Some(150.0), None, Some(120.0), None];
            for angle in &angles {
                builder.add(&MotionSample {
                    arm_swing: 1.0,
                    body_movement: 0.0,
                    elbow_angle: *angle,
                });
            }
            let pattern = builder.finalize();
            assert_eq!(pattern.elbow_angles, vec![150.0, 150.0, 150.0, 120.0, 120.0]);
        }

        #[test]
        fn no_angles_means_no_profile() {
            let mut builder = PatternBuilder::default();
            builder.add_sample(1.0, 1.0);
            assert!(builder.finalize().elbow_angles.is_empty());
        }
    }

    mod pattern_tests {
        use super::*;

        #[test]
        fn mismatched_lengths_are_rejected() {
            let mut pattern = bowling_pattern(20);
            pattern.body_movement_velocities.pop();
            assert!(matches!(pattern.validate(10), Err(Error::InvalidPattern(_))));
        }

        #[test]
        fn release_out_of_range_is_rejected() {
            let mut pattern = bowling_pattern(20);
            pattern.release_point_frame = 20;
            assert!(matches!(pattern.validate(10), Err(Error::InvalidPattern(_))));
        }

        #[test]
        fn phase_slices() {
            let values = [0.0, 1.0, 2.0, 3.0];
            assert_eq!(PhaseRange::new(1, 2).slice(&values), Some(&values[1..3]));
            assert_eq!(PhaseRange::new(-1, 2).slice(&values), None);
            assert_eq!(PhaseRange::new(2, 1).slice(&values), None);
            assert_eq!(PhaseRange::new(2, 4).slice(&values), None);
        }

        #[test]
        fn json_shape() {
            let pattern = reference_pattern();
            let json = serde_json::to_value(&pattern).unwrap();
            assert_eq!(json["releasePointFrame"], 3);
            assert_eq!(json["actionPhases"]["followThrough"]["start"], 5);
            assert!(json.get("elbowAngles").is_none());
            let back: MotionPattern = serde_json::from_value(json).unwrap();
            assert_eq!(back, pattern);
        }

        #[test]
        fn release_fraction() {
            let pattern = reference_pattern();
            assert!((pattern.release_fraction() - 3.0 / 7.0).abs() < 1e-12);
            assert_eq!(MotionPattern::default().release_fraction(), 0.0);
        }

        #[test]
        fn from_velocities_derives_everything() {
            let arm = [0.0, 0.5, 1.0, 2.0, 4.0, 9.0, 4.0, 2.0, 1.0, 0.5, 0.2, 0.1];
            let body = [0.5; 12];
            let pattern = MotionPattern::from_velocities(&arm, &body, &SegmentationConfig::default());
            assert_eq!(pattern.release_point_frame, 5);
            assert_eq!(pattern.overall_intensities[5], 9.5);
            assert!(pattern.is_valid());
        }
    }
}
