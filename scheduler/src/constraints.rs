//! Constraint scores
//!
//! Each function rates a job at a given instant. Positive means acceptable,
//! negative means the job must not run then. Totals use saturating
//! arithmetic on 16-bit values.

use crate::astro::{self, SkyPoint, Twilight};
use crate::config::GeoLocation;
use crate::device::WeatherStatus;
use crate::job::ObservationJob;
use chrono::{DateTime, Utc};

pub type Score = i16;

/// Score meaning "never"
pub const BAD_SCORE: Score = -1000;

/// Score of a job that captures no light frames
pub const CALIBRATION_SCORE: Score = 1000;

/// Site and night information used to score jobs during one evaluation pass
#[derive(Debug, Clone, Copy)]
pub struct Observatory {
    pub location: GeoLocation,
    pub twilight: Twilight,
    pub pre_dawn_mins: i64,
    /// Floor for setting targets that have no altitude constraint, degrees
    pub setting_cutoff_deg: f64,
}

impl Observatory {
    /// Build the context for the night around `now`
    pub fn for_night(location: GeoLocation, pre_dawn_mins: i64, now: &DateTime<Utc>) -> Self {
        Self {
            location,
            twilight: Twilight::for_day(&location, now),
            pre_dawn_mins,
            setting_cutoff_deg: 0.0,
        }
    }

    pub fn with_setting_cutoff(mut self, degrees: f64) -> Self {
        self.setting_cutoff_deg = degrees;
        self
    }

    pub fn altitude(&self, point: &SkyPoint, t: &DateTime<Utc>) -> f64 {
        astro::altitude(point, &self.location, t)
    }
}

/// Darkness score. The further from dawn or dusk, the better.
pub fn dark_sky_score(obs: &Observatory, t: &DateTime<Utc>) -> Score {
    let (dawn, dusk) = match obs.twilight {
        Twilight::Normal { dawn, dusk } => (dawn, dusk),
        Twilight::AlwaysDark => return 100,
        Twilight::NeverDark => return BAD_SCORE,
    };

    let fraction = astro::local_day_fraction(&obs.location, t);
    let early_dawn = dawn - obs.pre_dawn_mins as f64 / (24.0 * 60.0);

    if fraction >= early_dawn && fraction < dawn {
        BAD_SCORE / 50
    } else if fraction <= dawn {
        ((dawn - fraction) * 100.0) as Score
    } else if fraction >= dusk {
        ((fraction - dusk) * 100.0) as Score
    } else {
        BAD_SCORE
    }
}

/// Altitude score: grows with altitude, BAD below the job's minimum.
/// Unconstrained targets must be above the horizon, or above the setting
/// cutoff once past the meridian.
pub fn altitude_score(job: &ObservationJob, obs: &Observatory, t: &DateTime<Utc>) -> Score {
    let alt = obs.altitude(&job.target, t);
    let floor = match job.constraints.min_altitude {
        Some(min) => min,
        None if job.is_setting_at(&obs.location, t) => obs.setting_cutoff_deg,
        None => 0.0,
    };
    altitude_score_for(alt, Some(floor))
}

pub fn altitude_score_for(altitude: f64, min_altitude: Option<f64>) -> Score {
    if altitude < min_altitude.unwrap_or(0.0) {
        BAD_SCORE
    } else {
        (1.5 * 1.06f64.powf(altitude)).round() as Score
    }
}

/// Moon score: 0 without a separation constraint, heavily negative when too close
pub fn moon_separation_score(job: &ObservationJob, obs: &Observatory, t: &DateTime<Utc>) -> Score {
    let Some(min_separation) = job.constraints.min_moon_separation else {
        return 0;
    };

    let jd = astro::julian_day(t);
    let moon = astro::moon_position(jd);
    let separation = astro::angular_separation(&moon, &job.target);
    if separation < min_separation {
        return BAD_SCORE * 5;
    }

    let moon_alt = astro::altitude(&moon, &obs.location, t);
    let illumination = astro::moon_illumination(jd) * 100.0;
    let target_alt = obs.altitude(&job.target, t);
    moon_effect_score(separation, moon_alt, target_alt, illumination)
}

fn moon_effect_score(separation: f64, moon_alt: f64, target_alt: f64, illumination_pct: f64) -> Score {
    let effect = if moon_alt < 0.0 || illumination_pct <= 0.0 {
        100.0
    } else {
        let z_moon = 90.0 - moon_alt;
        let z_target = (90.0 - target_alt).max(1.0);
        let raw = separation.powf(1.7) * z_moon.powf(0.5) / (z_target.powf(1.1) * illumination_pct.powf(0.5));
        raw.clamp(0.0, 100.0)
    };
    (effect / 5.0).round() as Score
}

/// Combined score of a job at `t`
pub fn total_score(job: &ObservationJob, obs: &Observatory, t: &DateTime<Utc>) -> Score {
    if !job.light_frames_required {
        return CALIBRATION_SCORE;
    }

    let mut score: Score = 0;
    if job.constraints.enforce_twilight {
        score = score.saturating_add(dark_sky_score(obs, t));
    }
    score = score.saturating_add(altitude_score(job, obs, t));
    score.saturating_add(moon_separation_score(job, obs, t))
}

pub fn weather_score(enforce_weather: bool, status: WeatherStatus) -> Score {
    if !enforce_weather {
        return 0;
    }
    match status {
        WeatherStatus::Idle | WeatherStatus::Ok => 0,
        WeatherStatus::Warning => BAD_SCORE / 2,
        WeatherStatus::Alert => BAD_SCORE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::astro::{local_date, local_time_on};
    use crate::job::{JobConstraints, ObservationJob};
    use chrono::TimeZone;

    fn silicon_valley() -> GeoLocation {
        GeoLocation {
            latitude: 37.0 + 26.0 / 60.0 + 30.0 / 3600.0,
            longitude: -(122.0 + 10.0 / 60.0),
            utc_offset_hours: -7.0,
        }
    }

    fn observatory() -> Observatory {
        Observatory {
            location: silicon_valley(),
            twilight: Twilight::Normal { dawn: 0.2, dusk: 0.9 },
            pre_dawn_mins: 60,
            setting_cutoff_deg: 3.0,
        }
    }

    fn at_fraction(obs: &Observatory, fraction: f64) -> DateTime<Utc> {
        let base = Utc.with_ymd_and_hms(2021, 4, 17, 12, 0, 0).unwrap();
        local_time_on(&obs.location, local_date(&obs.location, &base), fraction)
    }

    fn zenith_job() -> ObservationJob {
        let mut job = ObservationJob::new("zenith", SkyPoint::from_degrees(188.2, 37.56));
        job.light_frames_required = true;
        job
    }

    #[test]
    fn test_dark_sky_boundaries() {
        let obs = observatory();
        assert_eq!(dark_sky_score(&obs, &at_fraction(&obs, 0.2)), 0);
        assert_eq!(dark_sky_score(&obs, &at_fraction(&obs, 0.9)), 0);
        assert_eq!(dark_sky_score(&obs, &at_fraction(&obs, 0.5)), BAD_SCORE);
    }

    #[test]
    fn test_dark_sky_pre_dawn_buffer() {
        let obs = observatory();
        // 30 minutes before dawn falls inside the 60 minute buffer
        let t = at_fraction(&obs, 0.2 - 30.0 / 1440.0);
        assert_eq!(dark_sky_score(&obs, &t), BAD_SCORE / 50);

        // Midnight is well before the buffer
        let t = at_fraction(&obs, 0.0);
        assert_eq!(dark_sky_score(&obs, &t), 20);
    }

    #[test]
    fn test_dark_sky_polar() {
        let mut obs = observatory();
        let t = at_fraction(&obs, 0.5);
        obs.twilight = Twilight::NeverDark;
        assert_eq!(dark_sky_score(&obs, &t), BAD_SCORE);
        obs.twilight = Twilight::AlwaysDark;
        assert!(dark_sky_score(&obs, &t) > 0);
    }

    #[test]
    fn test_altitude_score() {
        assert_eq!(altitude_score_for(10.0, Some(30.0)), BAD_SCORE);
        assert_eq!(altitude_score_for(-5.0, None), BAD_SCORE);
        assert_eq!(altitude_score_for(0.0, None), 2);
        assert!(altitude_score_for(80.0, Some(30.0)) > altitude_score_for(40.0, Some(30.0)));
        assert!(altitude_score_for(90.0, None) > 0);
    }

    #[test]
    fn test_setting_cutoff() {
        let obs = observatory();
        let t = Utc.with_ymd_and_hms(2021, 4, 17, 7, 0, 1).unwrap();
        // Find a setting target sitting between the horizon and the cutoff
        let lst_ra = astro::local_sidereal_time(astro::julian_day(&t), obs.location.longitude);
        let mut job = ObservationJob::new("low", SkyPoint::new((lst_ra - 6.0).rem_euclid(24.0), 1.0));
        job.light_frames_required = true;
        let alt = obs.altitude(&job.target, &t);
        assert!(alt > 0.0 && alt < 3.0, "altitude {}", alt);
        assert!(job.is_setting_at(&obs.location, &t));

        assert_eq!(altitude_score(&job, &obs, &t), BAD_SCORE);
        job.constraints.min_altitude = Some(0.0);
        assert!(altitude_score(&job, &obs, &t) > 0);
    }

    #[test]
    fn test_moon_effect_score() {
        assert_eq!(moon_effect_score(40.0, -10.0, 60.0, 50.0), 20);
        assert_eq!(moon_effect_score(40.0, 30.0, 60.0, 0.0), 20);
        let near = moon_effect_score(5.0, 30.0, 40.0, 100.0);
        let far = moon_effect_score(90.0, 30.0, 40.0, 100.0);
        assert!(near < far);
        assert!(near >= 0);
    }

    #[test]
    fn test_moon_separation_constraint() {
        let obs = observatory();
        let t = Utc.with_ymd_and_hms(2021, 4, 17, 7, 0, 1).unwrap();
        let mut job = zenith_job();
        assert_eq!(moon_separation_score(&job, &obs, &t), 0);

        job.constraints.min_moon_separation = Some(179.0);
        assert_eq!(moon_separation_score(&job, &obs, &t), BAD_SCORE * 5);
    }

    #[test]
    fn test_total_score() {
        let obs = observatory();
        let t = Utc.with_ymd_and_hms(2021, 4, 17, 7, 0, 1).unwrap();

        let mut job = zenith_job();
        job.constraints = JobConstraints {
            min_altitude: Some(30.0),
            min_moon_separation: None,
            enforce_twilight: true,
            enforce_weather: false,
        };
        assert!(total_score(&job, &obs, &t) > 0);

        job.constraints.min_altitude = Some(89.9);
        assert!(total_score(&job, &obs, &t) < 0);

        job.light_frames_required = false;
        assert_eq!(total_score(&job, &obs, &t), CALIBRATION_SCORE);
    }

    #[test]
    fn test_weather_score() {
        assert_eq!(weather_score(false, WeatherStatus::Alert), 0);
        assert_eq!(weather_score(true, WeatherStatus::Ok), 0);
        assert_eq!(weather_score(true, WeatherStatus::Warning), BAD_SCORE / 2);
        assert_eq!(weather_score(true, WeatherStatus::Alert), BAD_SCORE);
    }
}
