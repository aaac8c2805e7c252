pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Output topic carrying accepted, fully merged track points.
pub const TRANSFER_DATA: &str = "transfer_data";
/// Output topic carrying the latest barometer sample joined with the latest IMU sample.
pub const IMU_PRESSURE: &str = "imu_pressure";

/// Input topics consumed by the stream merger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    Gps,
    Barometer,
    Imu,
    ImuBarometer,
}

impl Topic {
    pub const INPUTS: [Topic; 4] = [Topic::Gps, Topic::Barometer, Topic::Imu, Topic::ImuBarometer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Gps => "gps",
            Topic::Barometer => "barometer",
            Topic::Imu => "imu",
            Topic::ImuBarometer => "imu_barometer",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::INPUTS.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position fix as published by the GPS poller (gpsd TPV plus `utc`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GpsSample {
    /// Fix time [unix seconds]; optional at parse time so a missing value can be reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utc: Option<f64>,
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hdop: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdop: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vdop: Option<f64>,
    #[serde(default)]
    pub mode: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_sats: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BarometricSample {
    pub p_utc: f64,
    /// Static pressure [Pa]
    pub pressure: f64,
    /// Sensor temperature [°C]
    pub temperature: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Kalman altitude estimate [m], attached by the merger
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fused_altitude: Option<f64>,
    /// Kalman vertical speed estimate [m/s], attached by the merger
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertical_speed: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InertialSample {
    pub i_utc: f64,
    /// Roll [deg]
    #[serde(default)]
    pub roll: f64,
    /// Pitch [deg]
    #[serde(default)]
    pub pitch: f64,
    /// Yaw [deg], only with a magnetometer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yaw: Option<f64>,
    /// Angular rate [rad/s]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gyro: Option<[f64; 3]>,
    /// Specific force [m/s²], sensor frame
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_acceleration: Option<[f64; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_magnetometer: Option<[f64; 3]>,
    /// Specific force along the local vertical [m/s²], gravity included
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertical_acceleration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Inertial and barometric readings taken together at the source.
///
/// Buffered on its own so the merger never re-joins it from the separate
/// `imu` and `barometer` histories.
#[derive(Clone, Debug)]
pub struct CombinedInertialBarometric {
    pub inertial: InertialSample,
    pub barometric: BarometricSample,
}

impl CombinedInertialBarometric {
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        let mut inertial = InertialSample::deserialize(value)?;
        let mut barometric = BarometricSample::deserialize(value)?;
        // Unknown fields are carried once, by the barometric half; fields the
        // inertial half declares never ride along as raw extras.
        barometric
            .extra
            .retain(|key, _| inertial.extra.contains_key(key));
        inertial.extra.clear();
        Ok(Self {
            inertial,
            barometric,
        })
    }
}

#[derive(Clone, Debug)]
pub enum SensorSample {
    Gps(GpsSample),
    Barometric(BarometricSample),
    Inertial(InertialSample),
    Combined(CombinedInertialBarometric),
}

impl SensorSample {
    pub fn parse(topic: Topic, payload: &str) -> Result<Self, serde_json::Error> {
        let sample = match topic {
            Topic::Gps => SensorSample::Gps(serde_json::from_str(payload)?),
            Topic::Barometer => SensorSample::Barometric(serde_json::from_str(payload)?),
            Topic::Imu => SensorSample::Inertial(serde_json::from_str(payload)?),
            Topic::ImuBarometer => {
                let value: Value = serde_json::from_str(payload)?;
                SensorSample::Combined(CombinedInertialBarometric::from_value(&value)?)
            }
        };
        Ok(sample)
    }
}

/// Samples that carry their own acquisition time.
pub trait Timestamped {
    fn timestamp(&self) -> f64;
}

impl Timestamped for BarometricSample {
    fn timestamp(&self) -> f64 {
        self.p_utc
    }
}

impl Timestamped for InertialSample {
    fn timestamp(&self) -> f64 {
        self.i_utc
    }
}

impl Timestamped for CombinedInertialBarometric {
    fn timestamp(&self) -> f64 {
        self.inertial.i_utc
    }
}

/// Writes a sample's fields onto a track point, last write wins.
pub trait Overlay {
    fn overlay_onto(&self, point: &mut TrackPoint) -> Result<(), serde_json::Error>;
}

impl Overlay for BarometricSample {
    fn overlay_onto(&self, point: &mut TrackPoint) -> Result<(), serde_json::Error> {
        point.overlay(self)
    }
}

impl Overlay for InertialSample {
    fn overlay_onto(&self, point: &mut TrackPoint) -> Result<(), serde_json::Error> {
        point.overlay(self)
    }
}

impl Overlay for CombinedInertialBarometric {
    fn overlay_onto(&self, point: &mut TrackPoint) -> Result<(), serde_json::Error> {
        point.overlay(&self.barometric)?;
        point.overlay(&self.inertial)
    }
}

/// Classifier verdict for one fix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TrackStatus {
    Unchanged = 0,
    TimeGap = 1,
    DistanceJump = 2,
    ColdStart = 3,
    PressureJump = 4,
}

impl TrackStatus {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// One merged, classified record: the GPS fix overlaid with the matched
/// barometric and inertial samples plus derived fields.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TrackPoint {
    fields: Map<String, Value>,
}

impl TrackPoint {
    pub fn from_gps(sample: &GpsSample) -> Result<Self, serde_json::Error> {
        let mut point = Self::default();
        point.overlay(sample)?;
        Ok(point)
    }

    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn overlay<T: Serialize>(&mut self, sample: &T) -> Result<(), serde_json::Error> {
        if let Value::Object(map) = serde_json::to_value(sample)? {
            self.fields.extend(map);
        }
        Ok(())
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(Value::as_f64)
    }

    pub fn hostname(&self) -> Option<&str> {
        self.fields.get("hostname").and_then(Value::as_str)
    }

    pub fn status(&self) -> Option<u8> {
        self.fields
            .get("my_status")
            .and_then(Value::as_u64)
            .and_then(|s| u8::try_from(s).ok())
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Copy without the fields for which `drop` returns true.
    pub fn without(&self, drop: impl Fn(&str) -> bool) -> TrackPoint {
        let fields = self
            .fields
            .iter()
            .filter(|(k, _)| !drop(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        TrackPoint { fields }
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.fields.clone()).to_string()
    }
}
