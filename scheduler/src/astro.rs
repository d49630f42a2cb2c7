//! Astronomical helper functions
//!
//! Low-precision solar and lunar ephemerides, good to a fraction of a degree,
//! which is plenty for scheduling decisions made at minute resolution.

use crate::config::GeoLocation;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Sun altitude marking astronomical twilight
pub const ASTRONOMICAL_TWILIGHT_DEG: f64 = -18.0;

/// Ratio of a sidereal day to a solar day
const SIDEREAL_RATIO: f64 = 0.997_269_566_3;

/// Equatorial coordinates (RA in hours, Dec in degrees)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyPoint {
    pub ra_hours: f64,
    pub dec_degrees: f64,
}

impl SkyPoint {
    pub fn new(ra_hours: f64, dec_degrees: f64) -> Self {
        Self { ra_hours, dec_degrees }
    }

    pub fn from_degrees(ra_degrees: f64, dec_degrees: f64) -> Self {
        Self::new(ra_degrees / 15.0, dec_degrees)
    }

    pub fn ra_degrees(&self) -> f64 {
        self.ra_hours * 15.0
    }
}

/// Calculate Julian Day from a chrono DateTime
pub fn julian_day(dt: &DateTime<Utc>) -> f64 {
    let year = dt.year();
    let month = dt.month();
    let day = dt.day();

    let (y, m) = if month <= 2 {
        (year - 1, month + 12)
    } else {
        (year, month)
    };

    let a = y / 100;
    let b = 2 - a + a / 4;

    let jd = (365.25 * (y as f64 + 4716.0)).floor()
        + (30.6001 * (m as f64 + 1.0)).floor()
        + day as f64
        + b as f64
        - 1524.5;

    let seconds = dt.num_seconds_from_midnight() as f64 + dt.nanosecond() as f64 / 1e9;
    jd + seconds / 86400.0
}

/// Local mean sidereal time in hours, longitude in degrees east
pub fn local_sidereal_time(jd: f64, longitude: f64) -> f64 {
    let t = (jd - 2451545.0) / 36525.0;

    // Greenwich Mean Sidereal Time in degrees
    let gmst = 280.46061837 + 360.98564736629 * (jd - 2451545.0) + 0.000387933 * t * t
        - t * t * t / 38710000.0;

    (gmst + longitude).rem_euclid(360.0) / 15.0
}

/// Apparent position of the Sun
pub fn sun_position(jd: f64) -> SkyPoint {
    let d = jd - 2451545.0;
    let mean_longitude = (280.46 + 0.9856474 * d).rem_euclid(360.0);
    let mean_anomaly = (357.528 + 0.9856003 * d).rem_euclid(360.0).to_radians();

    let ecl_lon = (mean_longitude + 1.915 * mean_anomaly.sin() + 0.020 * (2.0 * mean_anomaly).sin())
        .to_radians();
    let obliquity = (23.439 - 0.0000004 * d).to_radians();

    let ra = (obliquity.cos() * ecl_lon.sin()).atan2(ecl_lon.cos());
    let dec = (obliquity.sin() * ecl_lon.sin()).asin();

    SkyPoint::new(ra.to_degrees().rem_euclid(360.0) / 15.0, dec.to_degrees())
}

/// Approximate position of the Moon
pub fn moon_position(jd: f64) -> SkyPoint {
    let d = jd - 2451545.0;

    let moon_longitude = (218.32 + 13.176396 * d).rem_euclid(360.0);
    let moon_anomaly = (134.9 + 13.064993 * d).rem_euclid(360.0).to_radians();
    let moon_node = (93.3 + 13.229350 * d).rem_euclid(360.0).to_radians();

    let ecl_lon = (moon_longitude + 6.29 * moon_anomaly.sin()
        - 1.27 * (2.0 * moon_node - moon_anomaly).sin())
    .to_radians();
    let ecl_lat = (5.13 * moon_node.sin()).to_radians();
    let obl = 23.439f64.to_radians();

    let ra = (ecl_lon.sin() * obl.cos() - ecl_lat.tan() * obl.sin()).atan2(ecl_lon.cos());
    let dec = (ecl_lat.sin() * obl.cos() + ecl_lat.cos() * obl.sin() * ecl_lon.sin()).asin();

    SkyPoint::new(ra.to_degrees().rem_euclid(360.0) / 15.0, dec.to_degrees())
}

/// Illuminated fraction of the Moon's disc, 0 (new) to 1 (full)
pub fn moon_illumination(jd: f64) -> f64 {
    let elongation = angular_separation(&sun_position(jd), &moon_position(jd));
    (1.0 - elongation.to_radians().cos()) / 2.0
}

/// Angular separation between two points, degrees
pub fn angular_separation(a: &SkyPoint, b: &SkyPoint) -> f64 {
    let ra1 = a.ra_degrees().to_radians();
    let ra2 = b.ra_degrees().to_radians();
    let dec1 = a.dec_degrees.to_radians();
    let dec2 = b.dec_degrees.to_radians();

    let cos_sep = dec1.sin() * dec2.sin() + dec1.cos() * dec2.cos() * (ra1 - ra2).cos();
    cos_sep.clamp(-1.0, 1.0).acos().to_degrees()
}

/// Altitude of a point above the horizon, degrees
pub fn altitude(point: &SkyPoint, location: &GeoLocation, t: &DateTime<Utc>) -> f64 {
    let lst = local_sidereal_time(julian_day(t), location.longitude);
    let ha_rad = ((lst - point.ra_hours) * 15.0).to_radians();
    let dec_rad = point.dec_degrees.to_radians();
    let lat_rad = location.latitude.to_radians();

    let sin_alt = lat_rad.sin() * dec_rad.sin() + lat_rad.cos() * dec_rad.cos() * ha_rad.cos();
    sin_alt.clamp(-1.0, 1.0).asin().to_degrees()
}

/// Hour angle in hours, normalized to [-12, 12)
pub fn hour_angle(point: &SkyPoint, location: &GeoLocation, t: &DateTime<Utc>) -> f64 {
    let lst = local_sidereal_time(julian_day(t), location.longitude);
    (lst - point.ra_hours + 12.0).rem_euclid(24.0) - 12.0
}

/// Altitude of the Sun, degrees
pub fn sun_altitude(location: &GeoLocation, t: &DateTime<Utc>) -> f64 {
    altitude(&sun_position(julian_day(t)), location, t)
}

/// Altitude of the Moon, degrees
pub fn moon_altitude(location: &GeoLocation, t: &DateTime<Utc>) -> f64 {
    altitude(&moon_position(julian_day(t)), location, t)
}

/// Next meridian transit of `point` at or after `from`
pub fn next_transit(point: &SkyPoint, location: &GeoLocation, from: &DateTime<Utc>) -> DateTime<Utc> {
    let lst = local_sidereal_time(julian_day(from), location.longitude);
    let sidereal_hours = (point.ra_hours - lst).rem_euclid(24.0);
    let solar_secs = sidereal_hours * SIDEREAL_RATIO * 3600.0;
    *from + Duration::milliseconds((solar_secs * 1000.0).round() as i64)
}

/// Fraction of the local civil day, 0 at local midnight
pub fn local_day_fraction(location: &GeoLocation, t: &DateTime<Utc>) -> f64 {
    let local = local_naive(location, t);
    local.num_seconds_from_midnight() as f64 / 86400.0
}

fn local_naive(location: &GeoLocation, t: &DateTime<Utc>) -> chrono::NaiveDateTime {
    let offset_ms = (location.utc_offset_hours * 3_600_000.0) as i64;
    (*t + Duration::milliseconds(offset_ms)).naive_utc()
}

/// UTC instant of a local-time day fraction on the given local date
pub fn local_time_on(location: &GeoLocation, date: NaiveDate, fraction: f64) -> DateTime<Utc> {
    let offset_ms = (location.utc_offset_hours * 3_600_000.0) as i64;
    let midnight = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default());
    midnight + Duration::milliseconds((fraction * 86_400_000.0).round() as i64 - offset_ms)
}

/// Local calendar date at `t`
pub fn local_date(location: &GeoLocation, t: &DateTime<Utc>) -> NaiveDate {
    local_naive(location, t).date()
}

/// Astronomical twilight for one local day
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Twilight {
    /// Morning end of darkness and evening start of darkness, as local day fractions
    Normal { dawn: f64, dusk: f64 },
    /// The Sun stays below -18 degrees all day
    AlwaysDark,
    /// The Sun never gets below -18 degrees
    NeverDark,
}

impl Twilight {
    /// Compute dawn and dusk for the local day containing `t`
    pub fn for_day(location: &GeoLocation, t: &DateTime<Utc>) -> Self {
        let date = local_date(location, t);
        let start = local_time_on(location, date, 0.0);
        let step_mins = 10;
        let samples = 24 * 60 / step_mins;

        let alt_at = |i: i64| sun_altitude(location, &(start + Duration::minutes(i * step_mins)));

        let mut dawn = None;
        let mut dusk = None;
        let mut any_dark = false;
        let mut any_light = false;
        let mut prev = alt_at(0);
        for i in 1..=samples {
            let cur = alt_at(i);
            any_dark |= prev < ASTRONOMICAL_TWILIGHT_DEG;
            any_light |= prev >= ASTRONOMICAL_TWILIGHT_DEG;
            let lo = start + Duration::minutes((i - 1) * step_mins);
            let hi = start + Duration::minutes(i * step_mins);
            if prev < ASTRONOMICAL_TWILIGHT_DEG && cur >= ASTRONOMICAL_TWILIGHT_DEG && dawn.is_none() {
                dawn = Some(refine_crossing(location, lo, hi, true));
            } else if prev >= ASTRONOMICAL_TWILIGHT_DEG && cur < ASTRONOMICAL_TWILIGHT_DEG {
                dusk = Some(refine_crossing(location, lo, hi, false));
            }
            prev = cur;
        }

        let fraction = |x: DateTime<Utc>| (x - start).num_milliseconds() as f64 / 86_400_000.0;
        match (dawn, dusk) {
            (Some(dawn), Some(dusk)) => Twilight::Normal {
                dawn: fraction(dawn),
                dusk: fraction(dusk),
            },
            // One crossing only: the other falls just outside this local day
            (Some(dawn), None) => Twilight::Normal { dawn: fraction(dawn), dusk: 1.0 },
            (None, Some(dusk)) => Twilight::Normal { dawn: 0.0, dusk: fraction(dusk) },
            (None, None) if any_dark && !any_light => Twilight::AlwaysDark,
            _ => Twilight::NeverDark,
        }
    }

    /// Whether a local day fraction lies in the dark-sky window
    pub fn is_dark_at(&self, fraction: f64) -> bool {
        match self {
            Twilight::Normal { dawn, dusk } => fraction <= *dawn || fraction >= *dusk,
            Twilight::AlwaysDark => true,
            Twilight::NeverDark => false,
        }
    }

    /// Next start of darkness at or after `t`, if the sky gets dark at all
    pub fn next_dusk(&self, location: &GeoLocation, t: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Twilight::Normal { dusk, .. } => {
                let date = local_date(location, t);
                let today = local_time_on(location, date, *dusk);
                if today >= *t {
                    Some(today)
                } else {
                    date.succ_opt().map(|d| local_time_on(location, d, *dusk))
                }
            }
            Twilight::AlwaysDark => Some(*t),
            Twilight::NeverDark => None,
        }
    }
}

fn refine_crossing(
    location: &GeoLocation,
    mut lo: DateTime<Utc>,
    mut hi: DateTime<Utc>,
    rising: bool,
) -> DateTime<Utc> {
    while (hi - lo).num_seconds() > 1 {
        let mid = lo + (hi - lo) / 2;
        let above = sun_altitude(location, &mid) >= ASTRONOMICAL_TWILIGHT_DEG;
        if above == rising {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    hi
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silicon_valley() -> GeoLocation {
        GeoLocation {
            latitude: 37.0 + 26.0 / 60.0 + 30.0 / 3600.0,
            longitude: -(122.0 + 10.0 / 60.0),
            utc_offset_hours: -7.0,
        }
    }

    #[test]
    fn test_julian_day_calculation() {
        let dt = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        assert!((julian_day(&dt) - 2451545.0).abs() < 0.001);

        let dt = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!((julian_day(&dt) - 2460310.5).abs() < 0.001);
    }

    #[test]
    fn test_local_sidereal_time() {
        let lst = local_sidereal_time(2451545.0, 0.0);
        assert!((lst - 18.697).abs() < 0.01);

        let east = local_sidereal_time(2451545.0, 15.0);
        assert!(((east - lst).rem_euclid(24.0) - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_sun_position_equinox() {
        // Near the March equinox the Sun sits close to RA 0h, Dec 0
        let dt = Utc.with_ymd_and_hms(2021, 3, 20, 9, 37, 0).unwrap();
        let sun = sun_position(julian_day(&dt));
        assert!(sun.dec_degrees.abs() < 0.5);
        assert!(sun.ra_hours < 0.1 || sun.ra_hours > 23.9);
    }

    #[test]
    fn test_sun_position_keeps_quadrant() {
        // Mid-November: RA around 15h, which an acos-based formula would fold back
        let dt = Utc.with_ymd_and_hms(2021, 11, 15, 0, 0, 0).unwrap();
        let sun = sun_position(julian_day(&dt));
        assert!(sun.ra_hours > 14.5 && sun.ra_hours < 16.0);
        assert!(sun.dec_degrees < -15.0);
    }

    #[test]
    fn test_star_near_zenith() {
        let loc = silicon_valley();
        let t = Utc.with_ymd_and_hms(2021, 4, 17, 7, 0, 1).unwrap();
        let star = SkyPoint::from_degrees(188.2, 37.56);
        assert!(altitude(&star, &loc, &t) > 85.0);
        assert!(hour_angle(&star, &loc, &t).abs() < 0.3);
    }

    #[test]
    fn test_angular_separation() {
        let a = SkyPoint::new(0.0, 0.0);
        let b = SkyPoint::new(6.0, 0.0);
        assert!((angular_separation(&a, &b) - 90.0).abs() < 1e-9);
        let pole = SkyPoint::new(3.0, 90.0);
        assert!((angular_separation(&a, &pole) - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_next_transit() {
        let loc = silicon_valley();
        let from = Utc.with_ymd_and_hms(2021, 4, 17, 7, 0, 1).unwrap();
        let star = SkyPoint::from_degrees(188.2, 37.56);
        let transit = next_transit(&star, &loc, &from);
        assert!(transit >= from);
        assert!(transit - from < Duration::hours(24));
        assert!(hour_angle(&star, &loc, &transit).abs() < 0.01);
    }

    #[test]
    fn test_twilight_mid_latitude() {
        let loc = silicon_valley();
        let t = Utc.with_ymd_and_hms(2021, 4, 17, 19, 0, 0).unwrap();
        match Twilight::for_day(&loc, &t) {
            Twilight::Normal { dawn, dusk } => {
                // Astronomical dawn around 05:00 local, dusk around 21:20 local
                assert!(dawn > 4.5 / 24.0 && dawn < 5.5 / 24.0, "dawn {}", dawn);
                assert!(dusk > 20.8 / 24.0 && dusk < 21.8 / 24.0, "dusk {}", dusk);
            }
            other => panic!("unexpected twilight {:?}", other),
        }
    }

    #[test]
    fn test_twilight_polar_summer() {
        let loc = GeoLocation {
            latitude: 78.0,
            longitude: 15.0,
            utc_offset_hours: 1.0,
        };
        let t = Utc.with_ymd_and_hms(2021, 6, 21, 12, 0, 0).unwrap();
        assert_eq!(Twilight::for_day(&loc, &t), Twilight::NeverDark);
        assert!(Twilight::NeverDark.next_dusk(&loc, &t).is_none());
    }

    #[test]
    fn test_next_dusk_rolls_to_tomorrow() {
        let loc = silicon_valley();
        let twilight = Twilight::Normal { dawn: 0.2, dusk: 0.9 };
        // 23:00 local is past dusk, so next dusk is tomorrow
        let t = Utc.with_ymd_and_hms(2021, 4, 18, 6, 0, 0).unwrap();
        let next = twilight.next_dusk(&loc, &t).unwrap();
        assert!(next > t);
        assert!((local_day_fraction(&loc, &next) - 0.9).abs() < 1e-6);
        assert!(next - t < Duration::hours(24));
    }
}
