//! UTM and MGRS grid references on WGS84, for display alongside each fix.

use std::fmt;

const WGS84_A: f64 = 6_378_137.0;
const WGS84_F: f64 = 1.0 / 298.257_223_563;
const UTM_K0: f64 = 0.9996;
const FALSE_EASTING: f64 = 500_000.0;
const FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

const LATITUDE_BANDS: &[u8] = b"CDEFGHJKLMNPQRSTUVWXX";
const MGRS_COLUMN_SETS: [&[u8]; 3] = [b"ABCDEFGH", b"JKLMNPQR", b"STUVWXYZ"];
const MGRS_ROW_LETTERS: &[u8] = b"ABCDEFGHJKLMNPQRSTUV";

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Utm {
    pub zone: u8,
    pub band: char,
    pub easting: f64,
    pub northing: f64,
}

impl Utm {
    pub fn is_northern(&self) -> bool {
        self.band >= 'N'
    }

    pub fn to_mgrs(&self) -> Mgrs {
        let column_set = MGRS_COLUMN_SETS[(self.zone as usize - 1) % 3];
        let column = ((self.easting / 100_000.0).floor() as i64 - 1).clamp(0, 7) as usize;
        let row_offset = if self.zone % 2 == 0 { 5 } else { 0 };
        let row = ((self.northing / 100_000.0).floor() as i64 + row_offset).rem_euclid(20) as usize;
        Mgrs {
            zone: self.zone,
            band: self.band,
            square: [column_set[column] as char, MGRS_ROW_LETTERS[row] as char],
            easting: (self.easting.floor() as i64).rem_euclid(100_000) as u32,
            northing: (self.northing.floor() as i64).rem_euclid(100_000) as u32,
        }
    }
}

impl fmt::Display for Utm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hemisphere = if self.is_northern() { 'N' } else { 'S' };
        write!(f, "{:02} {} {:.0} {:.0}", self.zone, hemisphere, self.easting, self.northing)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mgrs {
    pub zone: u8,
    pub band: char,
    pub square: [char; 2],
    pub easting: u32,
    pub northing: u32,
}

impl fmt::Display for Mgrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}{} {}{} {:05} {:05}",
            self.zone, self.band, self.square[0], self.square[1], self.easting, self.northing
        )
    }
}

fn utm_zone(lat: f64, lon: f64) -> u8 {
    let zone = (((lon + 180.0) / 6.0).floor() as i64 + 1).clamp(1, 60) as u8;
    if (56.0..64.0).contains(&lat) && (3.0..12.0).contains(&lon) {
        return 32;
    }
    if (72.0..84.0).contains(&lat) && lon >= 0.0 {
        if lon < 9.0 {
            return 31;
        } else if lon < 21.0 {
            return 33;
        } else if lon < 33.0 {
            return 35;
        } else if lon < 42.0 {
            return 37;
        }
    }
    zone
}

/// Transverse Mercator projection of a WGS84 position.
///
/// `None` outside the UTM latitude range [-80°, 84°] or for non-finite input.
pub fn to_utm(lat: f64, lon: f64) -> Option<Utm> {
    if !lat.is_finite() || !lon.is_finite() || !(-80.0..=84.0).contains(&lat) {
        return None;
    }
    let lon = (lon + 180.0).rem_euclid(360.0) - 180.0;
    let zone = utm_zone(lat, lon);
    let band = LATITUDE_BANDS[(((lat + 80.0) / 8.0).floor() as usize).min(LATITUDE_BANDS.len() - 1)] as char;
    let central_meridian = (zone as f64 - 1.0) * 6.0 - 180.0 + 3.0;

    let e2 = WGS84_F * (2.0 - WGS84_F);
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    let ep2 = e2 / (1.0 - e2);

    let phi = lat.to_radians();
    let (sin_phi, cos_phi) = phi.sin_cos();
    let tan_phi = phi.tan();

    let n = WGS84_A / (1.0 - e2 * sin_phi * sin_phi).sqrt();
    let t = tan_phi * tan_phi;
    let c = ep2 * cos_phi * cos_phi;
    let a = cos_phi * (lon - central_meridian).to_radians();

    let m = WGS84_A
        * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * phi
            - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * phi).sin()
            + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * phi).sin()
            - (35.0 * e6 / 3072.0) * (6.0 * phi).sin());

    let easting = UTM_K0
        * n
        * (a + (1.0 - t + c) * a.powi(3) / 6.0
            + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * a.powi(5) / 120.0)
        + FALSE_EASTING;
    let mut northing = UTM_K0
        * (m + n
            * tan_phi
            * (a * a / 2.0
                + (5.0 - t + 9.0 * c + 4.0 * c * c) * a.powi(4) / 24.0
                + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * a.powi(6) / 720.0));
    if lat < 0.0 {
        northing += FALSE_NORTHING_SOUTH;
    }

    Some(Utm {
        zone,
        band,
        easting,
        northing,
    })
}
