use serde::Deserialize;

use crate::geo;
use crate::types::TrackStatus;

/// Thresholds deciding whether a fix is a significant change.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Distance from the last accepted fix that counts as movement [m]
    pub max_dist: f64,
    /// Time since the last accepted fix after which a point is kept anyway [s]
    pub max_pause: f64,
    /// Pressure change that counts as a vertical move [Pa]
    pub pressure_jump: f64,
    /// Lowest status code that is published and persisted
    pub status_threshold: u8,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            max_dist: 8.0,
            max_pause: 30.0,
            pressure_jump: 10.0,
            status_threshold: 1,
        }
    }
}

/// The part of a fix the classifier looks at.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FixSummary {
    pub utc: f64,
    pub location: (f64, f64),
    pub pressure: Option<f64>,
}

/// Decides per fix whether it is worth keeping, relative to the last accepted fix.
///
/// The previous-fix state belongs to one instance; only accepted fixes move it.
#[derive(Clone, Debug, Default)]
pub struct TrackQualityClassifier {
    config: ClassifierConfig,
    previous: Option<FixSummary>,
}

impl TrackQualityClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            config,
            previous: None,
        }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Last accepted fix
    pub fn previous(&self) -> Option<&FixSummary> {
        self.previous.as_ref()
    }

    /// Classify `fix` and, when the status passes the threshold, make it the new reference.
    pub fn evaluate(&mut self, fix: &FixSummary) -> (TrackStatus, bool) {
        let status = classify(&self.config, fix, self.previous.as_ref());
        let accepted = status.code() >= self.config.status_threshold;
        if accepted {
            self.previous = Some(*fix);
        }
        (status, accepted)
    }
}

/// Status of `current` relative to `previous`; checks run in priority order.
pub fn classify(
    config: &ClassifierConfig,
    current: &FixSummary,
    previous: Option<&FixSummary>,
) -> TrackStatus {
    let Some(previous) = previous else {
        return TrackStatus::ColdStart;
    };

    let mut distance = geo::distance(previous.location, current.location);
    if distance.is_nan() {
        // indeterminate, e.g. non-finite coordinates
        distance = 0.0;
    }

    if distance > config.max_dist {
        TrackStatus::DistanceJump
    } else if current.utc - previous.utc > config.max_pause {
        TrackStatus::TimeGap
    } else if matches!(
        (current.pressure, previous.pressure),
        (Some(now), Some(before)) if (now - before).abs() > config.pressure_jump
    ) {
        TrackStatus::PressureJump
    } else {
        TrackStatus::Unchanged
    }
}
