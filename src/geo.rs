/// Mean Earth radius used for track distances [m]
pub const EARTH_RADIUS_M: f64 = 6_370_000.0;

/// Great-circle distance between two (lat, lon) points in degrees, spherical law of cosines.
///
/// The cosine argument is clamped to [-1, 1]; for near-identical points rounding
/// can push it just above 1, which would make `acos` return NaN.
pub fn distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    // acos is ill-conditioned next to 1: sin² + cos² may land one ulp below it.
    if a == b {
        return 0.0;
    }
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let cos_angle = lat1.sin() * lat2.sin() + lat1.cos() * lat2.cos() * (lon2 - lon1).cos();
    EARTH_RADIUS_M * cos_angle.clamp(-1.0, 1.0).acos()
}
