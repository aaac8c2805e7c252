use std::f64::consts::SQRT_2;

use serde::Deserialize;

use crate::types::{Attitude, Vec3};

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AttitudeConfig {
    /// Weight of the accelerometer/magnetometer attitude in each blend
    pub gain: f64,
}

impl Default for AttitudeConfig {
    fn default() -> Self {
        Self { gain: 0.02 }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AttitudeEstimate {
    /// Roll [rad]
    pub roll: f64,
    /// Pitch [rad]
    pub pitch: f64,
    /// Yaw [rad], only when a magnetometer reading was supplied
    pub yaw: Option<f64>,
    /// Specific force along the estimated vertical [m/s²], gravity included
    pub vertical_acceleration: f64,
    pub quaternion: Attitude,
}

/// Complementary filter: gyro-propagated attitude pulled towards the
/// accelerometer (and magnetometer) tilt-compass attitude.
pub struct AttitudeEstimator {
    config: AttitudeConfig,
    quaternion: Option<Attitude>,
    last_utc: Option<f64>,
}

impl AttitudeEstimator {
    pub fn new(config: AttitudeConfig) -> Self {
        Self {
            config,
            quaternion: None,
            last_utc: None,
        }
    }

    pub fn quaternion(&self) -> Option<&Attitude> {
        self.quaternion.as_ref()
    }

    /// Fuse one IMU reading taken at `utc`.
    ///
    /// `accel` in m/s², `gyro` in rad/s (body rates), `mag` in any unit.
    /// Returns `None` when the accelerometer vector is degenerate.
    pub fn update(
        &mut self,
        utc: f64,
        accel: Vec3,
        gyro: Option<Vec3>,
        mag: Option<Vec3>,
    ) -> Option<AttitudeEstimate> {
        let q_am = tilt_compass(&accel, mag.as_ref())?;

        let q = match (self.quaternion, self.last_utc, gyro) {
            (Some(previous), Some(last_utc), Some(rate)) => {
                // repeated or late samples do not rotate the state
                let dt = (utc - last_utc).max(0.0);
                let q_omega = previous * Attitude::from_scaled_axis(rate * dt);
                blend(&q_omega, &q_am, self.config.gain)
            }
            _ => q_am,
        };

        self.quaternion = Some(q);
        self.last_utc = Some(self.last_utc.map_or(utc, |last| last.max(utc)));

        let (roll, pitch, yaw) = q.euler_angles();
        let vertical = Vec3::new(-pitch.sin(), pitch.cos() * roll.sin(), pitch.cos() * roll.cos());

        Some(AttitudeEstimate {
            roll,
            pitch,
            yaw: mag.map(|_| yaw),
            vertical_acceleration: vertical.dot(&accel),
            quaternion: q,
        })
    }
}

/// Attitude from the gravity direction, with heading from the magnetometer if present.
fn tilt_compass(accel: &Vec3, mag: Option<&Vec3>) -> Option<Attitude> {
    let a = accel.try_normalize(1e-9)?;
    let roll = a.y.atan2(a.z);
    let pitch = (-a.x).atan2((a.y * a.y + a.z * a.z).sqrt());

    let yaw = mag
        .and_then(|m| m.try_normalize(1e-9))
        .map(|m| {
            let (sin_r, cos_r) = roll.sin_cos();
            let (sin_p, cos_p) = pitch.sin_cos();
            let bx = m.x * cos_p + (m.y * sin_r + m.z * cos_r) * sin_p;
            let by = m.y * cos_r - m.z * sin_r;
            (-by).atan2(bx)
        })
        .unwrap_or(0.0);

    Some(Attitude::from_euler_angles(roll, pitch, yaw))
}

/// Weighted blend of two attitudes that may sit on opposite sides of the double cover.
fn blend(q_omega: &Attitude, q_am: &Attitude, gain: f64) -> Attitude {
    let w = q_omega.into_inner();
    let a = q_am.into_inner();
    let mixed = if (w + a).norm() < SQRT_2 {
        w * (1.0 - gain) - a * gain
    } else {
        w * (1.0 - gain) + a * gain
    };
    Attitude::new_normalize(mixed)
}
