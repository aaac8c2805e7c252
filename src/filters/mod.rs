pub mod altitude;
pub mod attitude;

pub use altitude::{AltitudeConfig, AltitudeEstimate, AltitudeKalmanFilter};
pub use attitude::{AttitudeConfig, AttitudeEstimate, AttitudeEstimator};
