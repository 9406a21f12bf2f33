//! Per-frame-pair motion features.
//!
//! Velocities are expressed in body lengths per second: keypoint
//! displacement divided by the elapsed time and by the shoulder-to-hip
//! distance, so the numbers do not depend on how far the bowler stands
//! from the camera or on the raster resolution.

use crate::{
    error::Error,
    pose::{KeypointKind, Point, Pose},
};
use tracing::debug;

const DEFAULT_MIN_CONFIDENCE: f32 = 0.3;
const DEFAULT_MIN_BODY_SCALE: f32 = 1e-3;

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FeatureConfig {
    /// Keypoints scored below this are treated as missing.
    pub min_confidence: f32,
    /// Torso lengths shorter than this (in image units) are treated as
    /// missing rather than blowing up the normalization.
    pub min_body_scale: f32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            min_body_scale: DEFAULT_MIN_BODY_SCALE,
        }
    }
}

impl FeatureConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(Error::InvalidConfig(format!(
                "feature minConfidence must be within [0, 1], got {}",
                self.min_confidence
            )));
        }
        if !self.min_body_scale.is_finite() || self.min_body_scale <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "feature minBodyScale must be positive, got {}",
                self.min_body_scale
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

impl Side {
    const BOTH: [Side; 2] = [Side::Left, Side::Right];

    fn shoulder(self) -> KeypointKind {
        match self {
            Side::Left => KeypointKind::LeftShoulder,
            Side::Right => KeypointKind::RightShoulder,
        }
    }

    fn elbow(self) -> KeypointKind {
        match self {
            Side::Left => KeypointKind::LeftElbow,
            Side::Right => KeypointKind::RightElbow,
        }
    }

    fn wrist(self) -> KeypointKind {
        match self {
            Side::Left => KeypointKind::LeftWrist,
            Side::Right => KeypointKind::RightWrist,
        }
    }

    fn hip(self) -> KeypointKind {
        match self {
            Side::Left => KeypointKind::LeftHip,
            Side::Right => KeypointKind::RightHip,
        }
    }
}

/// Features computed from one pair of consecutive poses.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct MotionSample {
    pub arm_swing: f64,
    pub body_movement: f64,
    /// Elbow angle in degrees of the arm that moved most, if visible.
    pub elbow_angle: Option<f64>,
}

/// Mean shoulder-to-hip distance over the sides visible in `pose`.
pub fn body_scale(pose: &Pose, config: &FeatureConfig) -> Option<f32> {
    let (sum, count) = Side::BOTH
        .iter()
        .filter_map(|side| {
            let shoulder = pose.confident(side.shoulder(), config.min_confidence)?;
            let hip = pose.confident(side.hip(), config.min_confidence)?;
            Some(shoulder.distance(hip))
        })
        .fold((0.0, 0_u8), |(sum, count), d| (sum + d, count + 1));
    if count == 0 {
        return None;
    }
    let scale = sum / f32::from(count);
    (scale.is_finite() && scale >= config.min_body_scale).then(|| scale)
}

fn pair_scale(prev: &Pose, curr: &Pose, config: &FeatureConfig) -> Option<f64> {
    body_scale(curr, config)
        .or_else(|| body_scale(prev, config))
        .map(f64::from)
}

fn displacement(prev: &Pose, curr: &Pose, kind: KeypointKind, config: &FeatureConfig) -> Option<f32> {
    let a = prev.confident(kind, config.min_confidence)?;
    let b = curr.confident(kind, config.min_confidence)?;
    Some(a.distance(b))
}

/// Mean wrist and elbow displacement of one arm, if both joints are visible
/// in both poses.
fn arm_displacement(prev: &Pose, curr: &Pose, side: Side, config: &FeatureConfig) -> Option<f32> {
    let wrist = displacement(prev, curr, side.wrist(), config)?;
    let elbow = displacement(prev, curr, side.elbow(), config)?;
    Some((wrist + elbow) / 2.0)
}

fn swinging_arm(prev: &Pose, curr: &Pose, config: &FeatureConfig) -> Option<(Side, f32)> {
    Side::BOTH
        .iter()
        .filter_map(|&side| arm_displacement(prev, curr, side, config).map(|d| (side, d)))
        .fold(None, |best: Option<(Side, f32)>, (side, d)| match best {
            Some((_, best_d)) if best_d >= d => best,
            _ => Some((side, d)),
        })
}

fn normalize(displacement: f32, dt: f64, scale: f64, feature: &'static str) -> f64 {
    let velocity = f64::from(displacement) / dt / scale;
    if velocity.is_finite() {
        velocity
    } else {
        debug!(
            target: "bowling_pose::anomaly",
            feature,
            displacement,
            dt,
            scale,
            "non-finite velocity replaced with 0"
        );
        0.0
    }
}

/// Speed of the faster arm (wrist and elbow), in body lengths per second.
///
/// Returns 0 when `dt` is not positive or the arm or torso is not visible
/// in both poses.
pub fn arm_swing_velocity(prev: &Pose, curr: &Pose, dt: f64, config: &FeatureConfig) -> f64 {
    if dt <= 0.0 || !dt.is_finite() {
        return 0.0;
    }
    match (swinging_arm(prev, curr, config), pair_scale(prev, curr, config)) {
        (Some((_, d)), Some(scale)) => normalize(d, dt, scale, "arm_swing"),
        _ => 0.0,
    }
}

/// Speed of the shoulder/hip centroid, in body lengths per second.
///
/// Only joints visible in both poses contribute to the centroid, and at least
/// one shoulder and one hip must be among them.
pub fn body_movement_velocity(prev: &Pose, curr: &Pose, dt: f64, config: &FeatureConfig) -> f64 {
    if dt <= 0.0 || !dt.is_finite() {
        return 0.0;
    }
    let joints = Side::BOTH
        .iter()
        .flat_map(|side| [side.shoulder(), side.hip()])
        .filter_map(|kind| {
            let a = prev.confident(kind, config.min_confidence)?;
            let b = curr.confident(kind, config.min_confidence)?;
            Some((kind, a, b))
        })
        .collect::<Vec<_>>();

    let has = |wanted: [KeypointKind; 2]| joints.iter().any(|(kind, ..)| wanted.contains(kind));
    if !has([KeypointKind::LeftShoulder, KeypointKind::RightShoulder])
        || !has([KeypointKind::LeftHip, KeypointKind::RightHip])
    {
        return 0.0;
    }

    let before = Point::centroid(joints.iter().map(|&(_, a, _)| a));
    let after = Point::centroid(joints.iter().map(|&(_, _, b)| b));
    match (before, after, pair_scale(prev, curr, config)) {
        (Some(before), Some(after), Some(scale)) => {
            normalize(before.distance(after), dt, scale, "body_movement")
        }
        _ => 0.0,
    }
}

/// Angle at the elbow between upper arm and forearm, in degrees. 180 is a
/// straight arm.
pub fn elbow_angle(shoulder: Point, elbow: Point, wrist: Point) -> f64 {
    let upper = shoulder - elbow;
    let fore = wrist - elbow;
    let magnitudes = f64::from(upper.dot(upper).sqrt()) * f64::from(fore.dot(fore).sqrt());
    if magnitudes < 1e-8 {
        return 180.0;
    }
    let cos = (f64::from(upper.dot(fore)) / magnitudes).clamp(-1.0, 1.0);
    cos.acos().to_degrees()
}

fn side_elbow_angle(pose: &Pose, side: Side, config: &FeatureConfig) -> Option<f64> {
    Some(elbow_angle(
        pose.confident(side.shoulder(), config.min_confidence)?,
        pose.confident(side.elbow(), config.min_confidence)?,
        pose.confident(side.wrist(), config.min_confidence)?,
    ))
}

/// All features for one pose pair, or `None` when `dt` is not positive and
/// the pair must be skipped.
pub fn extract(prev: &Pose, curr: &Pose, dt: f64, config: &FeatureConfig) -> Option<MotionSample> {
    if dt <= 0.0 || !dt.is_finite() {
        return None;
    }
    let elbow_angle =
        swinging_arm(prev, curr, config).and_then(|(side, _)| side_elbow_angle(curr, side, config));
    Some(MotionSample {
        arm_swing: arm_swing_velocity(prev, curr, dt, config),
        body_movement: body_movement_velocity(prev, curr, dt, config),
        elbow_angle,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pose::Keypoint;
    use assert_approx_eq::assert_approx_eq;

    /// A standing figure with a torso of length 1, offset by `(dx, dy)`,
    /// with the right wrist and elbow additionally shifted by `arm`.
    pub(crate) fn figure(dx: f32, dy: f32, arm: f32) -> Pose {
        let parts = [
            (KeypointKind::LeftShoulder, 0.0, 0.0),
            (KeypointKind::RightShoulder, 0.4, 0.0),
            (KeypointKind::LeftHip, 0.0, 1.0),
            (KeypointKind::RightHip, 0.4, 1.0),
            (KeypointKind::LeftElbow, -0.2, 0.5),
            (KeypointKind::LeftWrist, -0.2, 1.0),
            (KeypointKind::RightElbow, 0.6 + arm, 0.5),
            (KeypointKind::RightWrist, 0.6 + arm, 1.0),
        ];
        Pose::from_keypoints(
            parts.iter().map(|&(kind, x, y)| Keypoint {
                kind: Some(kind),
                point: Point::new(x + dx, y + dy).unwrap(),
                score: 0.9,
            }),
            0.9,
        )
        .unwrap()
    }

    fn without(pose: &Pose, kind: KeypointKind) -> Pose {
        let mut pose = *pose;
        pose.keypoints[kind.idx().unwrap()].score = 0.0;
        pose
    }

    #[test]
    fn body_scale_is_torso_length() {
        assert_approx_eq!(body_scale(&figure(0.0, 0.0, 0.0), &FeatureConfig::default()).unwrap(), 1.0);
    }

    #[test]
    fn body_scale_needs_a_shoulder_hip_pair() {
        let config = FeatureConfig::default();
        let pose = without(&without(&figure(0.0, 0.0, 0.0), KeypointKind::LeftHip), KeypointKind::RightHip);
        assert!(body_scale(&pose, &config).is_none());
    }

    #[test]
    fn arm_swing_is_normalized_by_dt() {
        let config = FeatureConfig::default();
        let prev = figure(0.0, 0.0, 0.0);
        let curr = figure(0.0, 0.0, 0.5);
        assert_approx_eq!(arm_swing_velocity(&prev, &curr, 0.5, &config), 1.0);
        assert_approx_eq!(arm_swing_velocity(&prev, &curr, 0.25, &config), 2.0);
        assert_approx_eq!(body_movement_velocity(&prev, &curr, 0.5, &config), 0.0);
    }

    #[test]
    fn velocities_are_resolution_independent() {
        let config = FeatureConfig::default();
        let scale = |pose: &Pose, k: f32| {
            let mut pose = *pose;
            for keypoint in pose.keypoints.iter_mut() {
                keypoint.point = Point::new(keypoint.point.x() * k, keypoint.point.y() * k).unwrap();
            }
            pose
        };
        let prev = figure(0.0, 0.0, 0.0);
        let curr = figure(0.3, 0.1, 0.5);
        let small = arm_swing_velocity(&prev, &curr, 0.1, &config);
        let large = arm_swing_velocity(&scale(&prev, 4.0), &scale(&curr, 4.0), 0.1, &config);
        assert_approx_eq!(small, large, 1e-4);
    }

    #[test]
    fn body_movement_tracks_centroid() {
        let config = FeatureConfig::default();
        let prev = figure(0.0, 0.0, 0.0);
        let curr = figure(0.3, 0.4, 0.0);
        assert_approx_eq!(body_movement_velocity(&prev, &curr, 1.0, &config), 0.5, 1e-6);
    }

    #[test]
    fn missing_joints_give_zero() {
        let config = FeatureConfig::default();
        let prev = figure(0.0, 0.0, 0.0);
        let curr = figure(0.0, 0.0, 0.5);
        let blind = without(&without(&curr, KeypointKind::RightWrist), KeypointKind::LeftWrist);
        assert_eq!(arm_swing_velocity(&prev, &blind, 0.1, &config), 0.0);

        let no_hips = without(&without(&curr, KeypointKind::LeftHip), KeypointKind::RightHip);
        assert_eq!(body_movement_velocity(&prev, &no_hips, 0.1, &config), 0.0);
    }

    #[test]
    fn non_positive_dt_is_skipped() {
        let config = FeatureConfig::default();
        let prev = figure(0.0, 0.0, 0.0);
        let curr = figure(0.0, 0.0, 0.5);
        assert_eq!(arm_swing_velocity(&prev, &curr, 0.0, &config), 0.0);
        assert_eq!(body_movement_velocity(&prev, &curr, -1.0, &config), 0.0);
        assert!(extract(&prev, &curr, 0.0, &config).is_none());
    }

    #[test]
    fn extract_reports_swinging_elbow() {
        let config = FeatureConfig::default();
        let sample = extract(&figure(0.0, 0.0, 0.0), &figure(0.0, 0.0, 0.5), 0.5, &config).unwrap();
        assert_approx_eq!(sample.arm_swing, 1.0);
        // right elbow at (1.1, 0.5), shoulder (0.4, 0), wrist (1.1, 1.0)
        let expected = elbow_angle(
            Point::new(0.4, 0.0).unwrap(),
            Point::new(1.1, 0.5).unwrap(),
            Point::new(1.1, 1.0).unwrap(),
        );
        assert_approx_eq!(sample.elbow_angle.unwrap(), expected);
    }

    mod elbow_angle_tests {
        use super::*;

        #[test]
        fn straight_arm() {
            let angle = elbow_angle(
                Point::new(0.0, 0.0).unwrap(),
                Point::new(0.5, 0.0).unwrap(),
                Point::new(1.0, 0.0).unwrap(),
            );
            assert_approx_eq!(angle, 180.0, 1e-3);
        }

        #[test]
        fn right_angle() {
            let angle = elbow_angle(
                Point::new(0.0, 0.0).unwrap(),
                Point::new(0.5, 0.0).unwrap(),
                Point::new(0.5, 0.5).unwrap(),
            );
            assert_approx_eq!(angle, 90.0, 1e-3);
        }

        #[test]
        fn collapsed_arm_counts_as_straight() {
            let p = Point::new(0.5, 0.5).unwrap();
            assert_approx_eq!(elbow_angle(p, p, p), 180.0);
        }
    }
}
