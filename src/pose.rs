use crate::error::Error;
use num_traits::{FromPrimitive, ToPrimitive};
use ordered_float::NotNan;
use std::ops::{Add, Sub};

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    num_derive::FromPrimitive,
    num_derive::ToPrimitive,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum KeypointKind {
    Nose,
    LeftEye,
    RightEye,
    LeftEar,
    RightEar,
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftWrist,
    RightWrist,
    LeftHip,
    RightHip,
    LeftKnee,
    RightKnee,
    LeftAnkle,
    RightAnkle,
}

pub const NUM_KEYPOINTS: usize = 17;

impl KeypointKind {
    pub fn idx(self) -> Result<usize, Error> {
        self.to_usize().ok_or(Error::KeypointVariantToUSize(self))
    }
}

/// A 2D image position. Construction rejects NaN coordinates.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct Point {
    x: f32,
    y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Result<Self, Error> {
        Ok(Self {
            x: NotNan::new(x)
                .map_err(|e| Error::ConstructNotNan(e, x))?
                .into_inner(),
            y: NotNan::new(y)
                .map_err(|e| Error::ConstructNotNan(e, y))?
                .into_inner(),
        })
    }

    pub fn distance(self, other: Self) -> f32 {
        let delta = other - self;
        delta.dot(delta).sqrt()
    }

    #[inline]
    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y
    }

    #[inline]
    pub fn x(self) -> f32 {
        self.x
    }

    #[inline]
    pub fn y(self) -> f32 {
        self.y
    }

    /// Mean of a non-empty set of points.
    pub fn centroid<I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = Self>,
    {
        let (sum, count) = points
            .into_iter()
            .fold((Self::default(), 0_u16), |(sum, count), p| {
                (sum + p, count + 1)
            });
        let count = f32::from(count);
        (count > 0.0).then(|| Self {
            x: sum.x / count,
            y: sum.y / count,
        })
    }
}

impl Sub for Point {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self::Output {
            x: self.x - rhs.x,
            y: self.y - rhs.y,
        }
    }
}

impl Add for Point {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self::Output {
            x: self.x + rhs.x,
            y: self.y + rhs.y,
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct Keypoint {
    pub kind: Option<KeypointKind>,
    pub point: Point,
    pub score: f32,
}

pub type Keypoints = [Keypoint; NUM_KEYPOINTS];

/// One detected person in one frame.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Pose {
    pub keypoints: Keypoints,
    pub score: f32,
}

impl Pose {
    /// Build a pose from whichever keypoints were detected; the rest stay
    /// unset and are reported as missing by [`Pose::confident`].
    pub fn from_keypoints<I>(keypoints: I, score: f32) -> Result<Self, Error>
    where
        I: IntoIterator<Item = Keypoint>,
    {
        let mut slots: Keypoints = Default::default();
        for keypoint in keypoints {
            if let Some(kind) = keypoint.kind {
                slots[kind.idx()?] = keypoint;
            }
        }
        Ok(Self {
            keypoints: slots,
            score,
        })
    }

    pub fn get(&self, kind: KeypointKind) -> Option<&Keypoint> {
        let keypoint = self.keypoints.get(kind.to_usize()?)?;
        keypoint.kind.map(|_| keypoint)
    }

    /// Position of `kind` if it was detected with at least `min_score`.
    pub fn confident(&self, kind: KeypointKind, min_score: f32) -> Option<Point> {
        self.get(kind)
            .filter(|keypoint| keypoint.score >= min_score)
            .map(|keypoint| keypoint.point)
    }

    /// Iterate over the detected keypoints in canonical order.
    pub fn detected(&self) -> impl Iterator<Item = (KeypointKind, &Keypoint)> + '_ {
        self.keypoints.iter().enumerate().filter_map(|(i, keypoint)| {
            keypoint
                .kind
                .and_then(|_| KeypointKind::from_usize(i))
                .map(|kind| (kind, keypoint))
        })
    }
}
