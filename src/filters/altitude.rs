use log::debug;
use serde::{Deserialize, Serialize};

use crate::types::{BaroJacobian, BaroNoise, KalmanGainBaro, VerticalCov, VerticalState};

/// Standard sea-level pressure [Pa]
pub const SEA_LEVEL_PRESSURE: f64 = 101_325.0;
/// Standard gravity [m/s²]
pub const STANDARD_GRAVITY: f64 = 9.806_65;

const FEET_TO_METERS: f64 = 0.3048;
const PRESSURE_ALTITUDE_SCALE_FT: f64 = 145_366.45;
const PRESSURE_ALTITUDE_EXPONENT: f64 = 0.190_284;

/// Pressure altitude [m] for static pressure `pressure` relative to `p0` (both Pa).
pub fn pressure_to_altitude(pressure: f64, p0: f64) -> f64 {
    FEET_TO_METERS * PRESSURE_ALTITUDE_SCALE_FT * (1.0 - (pressure / p0).powf(PRESSURE_ALTITUDE_EXPONENT))
}

/// Inverse of [`pressure_to_altitude`].
pub fn altitude_to_pressure(altitude: f64, p0: f64) -> f64 {
    let ratio = 1.0 - altitude / (FEET_TO_METERS * PRESSURE_ALTITUDE_SCALE_FT);
    p0 * ratio.powf(1.0 / PRESSURE_ALTITUDE_EXPONENT)
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AltitudeConfig {
    /// Scales acceleration excess into process noise std
    pub process_noise_gain: f64,
    /// Barometric altitude noise std [m]
    pub altitude_error: f64,
    /// Vertical acceleration noise floor [m/s²]
    pub acceleration_error: f64,
    /// Reference pressure for the barometric formula [Pa]
    pub reference_pressure: f64,
}

impl Default for AltitudeConfig {
    fn default() -> Self {
        Self {
            process_noise_gain: 0.05,
            altitude_error: 0.06,
            acceleration_error: 0.05,
            reference_pressure: SEA_LEVEL_PRESSURE,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AltitudeEstimate {
    pub altitude: f64,
    pub vertical_speed: f64,
    pub vertical_acceleration: f64,
}

/// Vertical-channel Kalman filter over `[altitude, vertical speed, vertical acceleration]`.
///
/// Only barometric altitude is a measurement. Vertical acceleration drives the
/// process noise: the filter follows its prediction while the vehicle is quiet
/// and leans on the barometer while it manoeuvres.
pub struct AltitudeKalmanFilter {
    config: AltitudeConfig,
    state: VerticalState,
    covariance: VerticalCov,
    last_utc: Option<f64>,
}

impl AltitudeKalmanFilter {
    pub fn new(config: AltitudeConfig) -> Self {
        Self {
            config,
            state: VerticalState::zeros(),
            covariance: Self::default_covariance(),
            last_utc: None,
        }
    }

    fn default_covariance() -> VerticalCov {
        VerticalCov::from_diagonal(&VerticalState::new(100.0, 10.0, 1.0))
    }

    pub fn config(&self) -> &AltitudeConfig {
        &self.config
    }

    pub fn state(&self) -> &VerticalState {
        &self.state
    }

    pub fn covariance(&self) -> &VerticalCov {
        &self.covariance
    }

    pub fn last_utc(&self) -> Option<f64> {
        self.last_utc
    }

    /// Barometric altitude [m] of a static pressure reading [Pa]
    pub fn altitude_of(&self, pressure: f64) -> f64 {
        pressure_to_altitude(pressure, self.config.reference_pressure)
    }

    /// Advance to `utc` and fuse one barometric altitude.
    ///
    /// `vertical_acceleration` is gravity-free [m/s²]. The first call only
    /// records `utc`; non-increasing timestamps are ignored.
    pub fn step(&mut self, utc: f64, altitude: f64, vertical_acceleration: f64) -> Option<AltitudeEstimate> {
        let Some(last_utc) = self.last_utc else {
            self.last_utc = Some(utc);
            return None;
        };
        let dt = utc - last_utc;
        if !(dt > 0.0) {
            debug!("altitude filter: ignoring step with dt={:.3}s", dt);
            return None;
        }
        self.last_utc = Some(utc);

        let f = Self::transition(dt);
        let q = Self::process_noise(dt, self.process_noise_sigma(vertical_acceleration));
        self.state = f * self.state;
        self.covariance = f * self.covariance * f.transpose() + q;

        self.update_altitude(altitude);

        Some(self.estimate())
    }

    pub fn estimate(&self) -> AltitudeEstimate {
        AltitudeEstimate {
            altitude: self.state[0],
            vertical_speed: self.state[1],
            vertical_acceleration: self.state[2],
        }
    }

    /// Process noise std from the acceleration in excess of its noise floor
    pub fn process_noise_sigma(&self, vertical_acceleration: f64) -> f64 {
        (vertical_acceleration.abs() - self.config.acceleration_error).max(0.0) * self.config.process_noise_gain
    }

    fn transition(dt: f64) -> VerticalCov {
        VerticalCov::new(
            1.0, dt, 0.5 * dt * dt,
            0.0, 1.0, dt,
            0.0, 0.0, 1.0,
        )
    }

    fn process_noise(dt: f64, sigma: f64) -> VerticalCov {
        let dt2 = dt * dt;
        let dt3 = dt2 * dt;
        let dt4 = dt3 * dt;
        VerticalCov::new(
            dt4 / 4.0, dt3 / 2.0, dt2 / 2.0,
            dt3 / 2.0, dt2, dt,
            dt2 / 2.0, dt, 1.0,
        ) * (sigma * sigma)
    }

    fn update_altitude(&mut self, altitude: f64) {
        let h = BaroJacobian::new(1.0, 0.0, 0.0);
        let r = BaroNoise::new(self.config.altitude_error * self.config.altitude_error);

        let s = h * self.covariance * h.transpose() + r;
        let Some(s_inv) = s.try_inverse() else {
            debug!("altitude filter: singular innovation covariance, skipping update");
            return;
        };
        let k: KalmanGainBaro = self.covariance * h.transpose() * s_inv;
        let residual = altitude - (h * self.state)[0];
        self.state += k * residual;

        // Joseph form keeps P symmetric
        let i_kh = VerticalCov::identity() - k * h;
        self.covariance = i_kh * self.covariance * i_kh.transpose() + k * r * k.transpose();
    }
}
