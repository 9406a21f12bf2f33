//! Mapping from a 0–100 similarity/intensity score to a speed class and an
//! estimated ball speed. Both mappings are monotonic and deterministic.

use crate::error::Error;
use std::fmt;

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum SpeedClass {
    Slow,
    Fast,
    Zooooom,
}

impl SpeedClass {
    fn message(self) -> &'static str {
        match self {
            SpeedClass::Slow => "A steady start. Keep practising to add pace to your action.",
            SpeedClass::Fast => "Quick! Your action is generating real pace.",
            SpeedClass::Zooooom => "Zooooom! That is express pace, right up with the benchmark.",
        }
    }
}

impl fmt::Display for SpeedClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpeedClass::Slow => "Slow",
            SpeedClass::Fast => "Fast",
            SpeedClass::Zooooom => "Zooooom",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub speed_class: SpeedClass,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub message: &'static str,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SpeedConfig {
    /// Scores at or above this are `Fast`.
    pub fast_threshold: f64,
    /// Scores at or above this are `Zooooom`.
    pub zoom_threshold: f64,
    /// Scores at or above this make a result eligible for the leaderboard.
    pub eligibility_threshold: f64,
    /// `[score, km/h]` control points, interpolated linearly.
    pub kmh_table: Vec<[f64; 2]>,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            fast_threshold: 60.0,
            zoom_threshold: 85.0,
            eligibility_threshold: 85.0,
            kmh_table: vec![
                [0.0, 50.0],
                [40.0, 80.0],
                [60.0, 100.0],
                [85.0, 125.0],
                [100.0, 145.0],
            ],
        }
    }
}

/// Clamp a score into `[0, 100]`, treating NaN as 0.
fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 100.0)
    }
}

impl SpeedConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.fast_threshold <= self.zoom_threshold) {
            return Err(Error::InvalidConfig(format!(
                "fastThreshold {} must not exceed zoomThreshold {}",
                self.fast_threshold, self.zoom_threshold
            )));
        }
        if self.kmh_table.is_empty() {
            return Err(Error::InvalidConfig("kmhTable must not be empty".into()));
        }
        if self.kmh_table.iter().flatten().any(|v| !v.is_finite()) {
            return Err(Error::InvalidConfig("kmhTable must be finite".into()));
        }
        let increasing = self
            .kmh_table
            .windows(2)
            .all(|w| w[0][0] < w[1][0] && w[0][1] <= w[1][1]);
        if !increasing {
            return Err(Error::InvalidConfig(
                "kmhTable must be strictly increasing in score and non-decreasing in km/h".into(),
            ));
        }
        Ok(())
    }

    pub fn classify(&self, similarity: f64) -> Classification {
        let similarity = clamp_score(similarity);
        let speed_class = if similarity >= self.zoom_threshold {
            SpeedClass::Zooooom
        } else if similarity >= self.fast_threshold {
            SpeedClass::Fast
        } else {
            SpeedClass::Slow
        };
        Classification {
            speed_class,
            confidence: similarity / 100.0,
            message: speed_class.message(),
        }
    }

    /// Estimated ball speed for a 0–100 intensity. Inputs outside the table
    /// are held at the nearest end point.
    pub fn to_kmh(&self, intensity: f64) -> f64 {
        let intensity = clamp_score(intensity);
        let table = &self.kmh_table;
        let (first, last) = match (table.first(), table.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return 0.0,
        };
        if intensity <= first[0] {
            return first[1];
        }
        if intensity >= last[0] {
            return last[1];
        }
        table
            .windows(2)
            .find(|w| intensity <= w[1][0])
            .map(|w| {
                let [x0, y0] = w[0];
                let [x1, y1] = w[1];
                y0 + (y1 - y0) * (intensity - x0) / (x1 - x0)
            })
            .unwrap_or(last[1])
    }

    pub fn is_eligible(&self, similarity: f64) -> bool {
        clamp_score(similarity) >= self.eligibility_threshold
    }
}

/// [`SpeedConfig::classify`] with the default thresholds.
pub fn classify(similarity: f64) -> Classification {
    SpeedConfig::default().classify(similarity)
}

/// [`SpeedConfig::to_kmh`] with the default table.
pub fn to_kmh(intensity: f64) -> f64 {
    SpeedConfig::default().to_kmh(intensity)
}
