//! Linear algebra type system for the fusion filters
//!
//! Compile-time dimension checking and clean type aliases for the
//! vertical-channel Kalman filter and the attitude estimator.

use nalgebra::{SMatrix, SVector, UnitQuaternion};

// ===== State Dimensions =====
pub const STATE_DIM_VERTICAL: usize = 3; // (altitude, vertical speed, vertical acceleration)

// ===== Measurement Dimensions =====
pub const MEASURE_DIM_BARO: usize = 1; // altitude

// ===== Vertical Channel Types =====
pub type VerticalState = SVector<f64, STATE_DIM_VERTICAL>;
pub type VerticalCov = SMatrix<f64, STATE_DIM_VERTICAL, STATE_DIM_VERTICAL>;

// Barometric measurement model
pub type BaroJacobian = SMatrix<f64, MEASURE_DIM_BARO, STATE_DIM_VERTICAL>; // 1×3
pub type BaroNoise = SMatrix<f64, MEASURE_DIM_BARO, MEASURE_DIM_BARO>; // 1×1
pub type KalmanGainBaro = SMatrix<f64, STATE_DIM_VERTICAL, MEASURE_DIM_BARO>; // 3×1

// ===== Attitude Types =====
pub type Vec3 = SVector<f64, 3>;
pub type Attitude = UnitQuaternion<f64>;
