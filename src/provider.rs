//! Pose detection capabilities.
//!
//! The pipeline never looks inside a detector: anything that turns a frame
//! into zero or more [`Pose`]s can be plugged in as a [`PoseProvider`].
//! [`ProviderChain`] tries several of them in priority order, and
//! [`TrackPoseProvider`] replays poses recorded ahead of time.

use crate::{
    error::Error,
    pose::{Keypoint, KeypointKind, Point, Pose},
    sampler::{Frame, Raster, VideoSource},
};
use num_traits::ToPrimitive;
use std::{path::Path, time::Duration};
use tracing::{debug, warn};

pub trait PoseProvider {
    /// Short name used in logs and failure reports.
    fn name(&self) -> &str;

    /// Detect poses in `frame`. An empty list means nobody was found, which
    /// is not a failure.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Pose>, Error>;

    /// Whether no further frame can succeed, so callers can stop early.
    fn is_exhausted(&self) -> bool {
        false
    }
}

impl<P> PoseProvider for Box<P>
where
    P: PoseProvider + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Pose>, Error> {
        (**self).detect(frame)
    }

    fn is_exhausted(&self) -> bool {
        (**self).is_exhausted()
    }
}

pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: usize = 3;

struct Slot {
    provider: Box<dyn PoseProvider>,
    consecutive_failures: usize,
    disabled: bool,
}

/// Prioritized fallback over several providers.
///
/// Each frame goes to the first enabled provider; on failure the next one is
/// tried. A provider that fails `max_consecutive_failures` frames in a row is
/// disabled for the rest of the chain's life. When no provider can handle a
/// frame the chain fails with [`Error::PoseProviderUnavailable`], listing
/// every reason.
pub struct ProviderChain {
    slots: Vec<Slot>,
    max_consecutive_failures: usize,
}

impl ProviderChain {
    pub fn new(providers: Vec<Box<dyn PoseProvider>>) -> Result<Self, Error> {
        Self::with_max_failures(providers, DEFAULT_MAX_CONSECUTIVE_FAILURES)
    }

    pub fn with_max_failures(
        providers: Vec<Box<dyn PoseProvider>>,
        max_consecutive_failures: usize,
    ) -> Result<Self, Error> {
        if providers.is_empty() {
            return Err(Error::NoPoseProviders);
        }
        Ok(Self {
            slots: providers
                .into_iter()
                .map(|provider| Slot {
                    provider,
                    consecutive_failures: 0,
                    disabled: false,
                })
                .collect(),
            max_consecutive_failures: max_consecutive_failures.max(1),
        })
    }

    /// Names of the providers still in rotation, highest priority first.
    pub fn enabled(&self) -> Vec<&str> {
        self.slots
            .iter()
            .filter(|slot| !slot.disabled)
            .map(|slot| slot.provider.name())
            .collect()
    }
}

impl PoseProvider for ProviderChain {
    fn name(&self) -> &str {
        "chain"
    }

    fn is_exhausted(&self) -> bool {
        self.slots.iter().all(|slot| slot.disabled)
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Pose>, Error> {
        let mut failures = Vec::new();
        for slot in self.slots.iter_mut() {
            if slot.disabled {
                failures.push(format!(
                    "{}: disabled after {} consecutive failures",
                    slot.provider.name(),
                    slot.consecutive_failures
                ));
                continue;
            }
            match slot.provider.detect(frame) {
                Ok(poses) => {
                    slot.consecutive_failures = 0;
                    return Ok(poses);
                }
                Err(e) => {
                    slot.consecutive_failures += 1;
                    warn!(
                        provider = slot.provider.name(),
                        timestamp = frame.timestamp,
                        error = %e,
                        "pose provider failed"
                    );
                    if slot.consecutive_failures >= self.max_consecutive_failures {
                        warn!(provider = slot.provider.name(), "disabling pose provider");
                        slot.disabled = true;
                    }
                    failures.push(format!("{}: {}", slot.provider.name(), e));
                }
            }
        }
        Err(Error::PoseProviderUnavailable { failures })
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct TrackKeypoint {
    pub part: KeypointKind,
    pub x: f32,
    pub y: f32,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct TrackPose {
    pub score: f32,
    pub keypoints: Vec<TrackKeypoint>,
}

impl TrackPose {
    pub fn to_pose(&self) -> Result<Pose, Error> {
        let keypoints = self
            .keypoints
            .iter()
            .map(|k| -> Result<Keypoint, Error> {
                Ok(Keypoint {
                    kind: Some(k.part),
                    point: Point::new(k.x, k.y)?,
                    score: k.score,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Pose::from_keypoints(keypoints, self.score)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct TrackFrame {
    /// Seconds from the start of the clip.
    pub timestamp: f64,
    #[serde(default)]
    pub poses: Vec<TrackPose>,
}

/// Poses recorded for a clip, one entry per analysed frame.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PoseTrack {
    pub frames: Vec<TrackFrame>,
}

impl PoseTrack {
    pub fn from_path<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).map_err(|e| Error::ReadPoseTrack(e, path.to_owned()))?;
        Self::from_json(&text)
    }

    /// Parse a track, dropping frames with unusable timestamps and sorting
    /// the rest by time.
    pub fn from_json(text: &str) -> Result<Self, Error> {
        let mut track: Self = serde_json::from_str(text).map_err(Error::ParsePoseTrack)?;
        let before = track.frames.len();
        track
            .frames
            .retain(|frame| frame.timestamp.is_finite() && frame.timestamp >= 0.0);
        if track.frames.len() != before {
            debug!(
                dropped = before - track.frames.len(),
                "dropped pose track frames with invalid timestamps"
            );
        }
        track
            .frames
            .sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        Ok(track)
    }

    /// Timestamp of the last recorded frame.
    pub fn last_timestamp(&self) -> f64 {
        self.frames.last().map_or(0.0, |frame| frame.timestamp)
    }

    /// The recorded frame closest to `timestamp`, if any lies within
    /// `tolerance` seconds.
    pub fn nearest(&self, timestamp: f64, tolerance: f64) -> Option<&TrackFrame> {
        let after = self
            .frames
            .partition_point(|frame| frame.timestamp < timestamp);
        let before = after.checked_sub(1).and_then(|i| self.frames.get(i));
        let candidates = before.into_iter().chain(self.frames.get(after));
        candidates
            .map(|frame| ((frame.timestamp - timestamp).abs(), frame))
            .filter(|(gap, _)| *gap <= tolerance)
            .min_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(_, frame)| frame)
    }
}

/// Replays a [`PoseTrack`], matching each sampled frame to the recorded
/// frame nearest in time.
#[derive(Debug, Clone)]
pub struct TrackPoseProvider {
    track: PoseTrack,
    tolerance: f64,
}

impl TrackPoseProvider {
    /// Frames further than half a sampling interval from every recorded
    /// frame get no poses.
    pub fn new(track: PoseTrack, fps: f64) -> Self {
        Self {
            track,
            tolerance: 0.5 / fps,
        }
    }
}

impl PoseProvider for TrackPoseProvider {
    fn name(&self) -> &str {
        "track"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Pose>, Error> {
        match self.track.nearest(frame.timestamp, self.tolerance) {
            Some(recorded) => recorded.poses.iter().map(TrackPose::to_pose).collect(),
            None => Ok(Vec::new()),
        }
    }
}

/// A clip with no pixels, as long as a recorded track. Used to drive the
/// sampler when poses come from a [`TrackPoseProvider`].
#[derive(Debug, Clone)]
pub struct TrackSource {
    duration: f64,
    position: f64,
}

impl TrackSource {
    /// Covers the track up to and including its last frame at `fps`.
    pub fn new(track: &PoseTrack, fps: f64) -> Self {
        let duration = if track.frames.is_empty() {
            0.0
        } else {
            track.last_timestamp() + 1.0 / fps
        };
        Self {
            duration,
            position: 0.0,
        }
    }

    pub fn position(&self) -> f64 {
        self.position
    }
}

impl VideoSource for TrackSource {
    fn duration(&self) -> f64 {
        self.duration
    }

    fn seek(&mut self, timestamp: f64, _timeout: Duration) -> Result<(), Error> {
        self.position = timestamp.clamp(0.0, self.duration);
        Ok(())
    }

    fn capture(&mut self, width: u32, height: u32) -> Result<Raster, Error> {
        let width = width.to_usize().unwrap_or(0);
        let height = height.to_usize().unwrap_or(0);
        Ok(Raster::zeros((height, width, 3)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::features::tests::figure;

    pub(crate) fn blank_frame(timestamp: f64) -> Frame {
        Frame {
            timestamp,
            image: Raster::zeros((2, 2, 3)),
        }
    }

    /// Returns whatever `script` yields for each frame timestamp.
    pub(crate) struct ScriptedProvider<F> {
        pub(crate) name: &'static str,
        pub(crate) script: F,
        pub(crate) calls: usize,
    }

    impl<F> ScriptedProvider<F>
    where
        F: FnMut(f64) -> Result<Vec<Pose>, Error>,
    {
        pub(crate) fn new(name: &'static str, script: F) -> Self {
            Self {
                name,
                script,
                calls: 0,
            }
        }
    }

    impl<F> PoseProvider for ScriptedProvider<F>
    where
        F: FnMut(f64) -> Result<Vec<Pose>, Error>,
    {
        fn name(&self) -> &str {
            self.name
        }

        fn detect(&mut self, frame: &Frame) -> Result<Vec<Pose>, Error> {
            self.calls += 1;
            (self.script)(frame.timestamp)
        }
    }

    fn broken(name: &'static str) -> Box<dyn PoseProvider> {
        Box::new(ScriptedProvider::new(name, |_| {
            Err(Error::InvalidConfig("model missing".into()))
        }))
    }

    fn working(name: &'static str) -> Box<dyn PoseProvider> {
        Box::new(ScriptedProvider::new(name, |_| Ok(vec![figure(0.0, 0.0, 0.0)])))
    }

    mod chain_tests {
        use super::*;

        #[test]
        fn empty_chain_is_rejected() {
            assert!(matches!(
                ProviderChain::new(Vec::new()),
                Err(Error::NoPoseProviders)
            ));
        }

        #[test]
        fn falls_back_to_next_provider() {
            let mut chain = ProviderChain::new(vec![broken("gpu"), working("cpu")]).unwrap();
            let poses = chain.detect(&blank_frame(0.0)).unwrap();
            assert_eq!(poses.len(), 1);
        }

        #[test]
        fn repeated_failures_disable_a_provider() {
            let mut chain =
                ProviderChain::with_max_failures(vec![broken("gpu"), working("cpu")], 2).unwrap();
            for i in 0..2 {
                chain.detect(&blank_frame(f64::from(i))).unwrap();
            }
            assert_eq!(chain.enabled(), vec!["cpu"]);
            assert!(!chain.is_exhausted());
        }

        #[test]
        fn exhausted_once_every_provider_is_disabled() {
            let mut chain = ProviderChain::with_max_failures(vec![broken("gpu")], 2).unwrap();
            assert!(chain.detect(&blank_frame(0.0)).is_err());
            assert!(!chain.is_exhausted());
            assert!(chain.detect(&blank_frame(1.0)).is_err());
            assert!(chain.is_exhausted());
            assert!(chain.enabled().is_empty());
        }

        #[test]
        fn all_failing_reports_every_reason() {
            let mut chain = ProviderChain::new(vec![broken("gpu"), broken("cpu")]).unwrap();
            match chain.detect(&blank_frame(0.0)) {
                Err(Error::PoseProviderUnavailable { failures }) => {
                    assert_eq!(failures.len(), 2);
                    assert!(failures[0].starts_with("gpu"));
                    assert!(failures[1].starts_with("cpu"));
                }
                other => panic!("unexpected result: {:?}", other),
            }
        }

        #[test]
        fn empty_detections_are_not_failures() {
            let nobody: Box<dyn PoseProvider> =
                Box::new(ScriptedProvider::new("empty", |_| Ok(Vec::new())));
            let mut chain = ProviderChain::with_max_failures(vec![nobody], 1).unwrap();
            for i in 0..3 {
                assert!(chain.detect(&blank_frame(f64::from(i))).unwrap().is_empty());
            }
            assert_eq!(chain.enabled(), vec!["empty"]);
        }
    }

    mod track_tests {
        use super::*;

        const TRACK: &str = r#"{
            "frames": [
                { "timestamp": 0.5, "poses": [] },
                { "timestamp": 0.0, "poses": [
                    { "score": 0.9, "keypoints": [
                        { "part": "rightWrist", "x": 10.0, "y": 20.0, "score": 0.8 },
                        { "part": "leftShoulder", "x": 5.0, "y": 6.0, "score": 0.7 }
                    ] }
                ] },
                { "timestamp": -1.0 }
            ]
        }"#;

        #[test]
        fn frames_are_sorted_and_filtered() {
            let track = PoseTrack::from_json(TRACK).unwrap();
            assert_eq!(track.frames.len(), 2);
            assert_eq!(track.frames[0].timestamp, 0.0);
            assert_eq!(track.last_timestamp(), 0.5);
        }

        #[test]
        fn nearest_respects_tolerance() {
            let track = PoseTrack::from_json(TRACK).unwrap();
            assert_eq!(track.nearest(0.04, 0.05).map(|f| f.timestamp), Some(0.0));
            assert_eq!(track.nearest(0.46, 0.05).map(|f| f.timestamp), Some(0.5));
            assert!(track.nearest(0.25, 0.05).is_none());
        }

        #[test]
        fn provider_replays_poses() {
            let track = PoseTrack::from_json(TRACK).unwrap();
            let mut provider = TrackPoseProvider::new(track, 12.0);
            let poses = provider.detect(&blank_frame(0.01)).unwrap();
            assert_eq!(poses.len(), 1);
            let wrist = poses[0].confident(KeypointKind::RightWrist, 0.5).unwrap();
            assert_eq!((wrist.x(), wrist.y()), (10.0, 20.0));
            assert!(provider.detect(&blank_frame(0.25)).unwrap().is_empty());
        }

        #[test]
        fn source_spans_the_track() {
            let track = PoseTrack::from_json(TRACK).unwrap();
            let mut source = TrackSource::new(&track, 10.0);
            assert!((source.duration() - 0.6).abs() < 1e-9);
            source.seek(0.3, Duration::from_millis(10)).unwrap();
            assert_eq!(source.position(), 0.3);
            assert_eq!(source.capture(4, 3).unwrap().dim(), (3, 4, 3));
        }

        #[test]
        fn unknown_keypoint_is_a_parse_error() {
            let text = r#"{ "frames": [ { "timestamp": 0.0, "poses": [ { "score": 1.0,
                "keypoints": [ { "part": "tail", "x": 0.0, "y": 0.0, "score": 1.0 } ] } ] } ] }"#;
            assert!(matches!(
                PoseTrack::from_json(text),
                Err(Error::ParsePoseTrack(_))
            ));
        }
    }
}
