//! Time source
//!
//! The scheduler never reads the wall clock directly. Everything goes through
//! a [`Clock`], which also reports the simulation scale (time acceleration)
//! used to convert simulated waits into real timer intervals.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Source of "now" plus the simulation clock rate
pub trait Clock: Send + Sync {
    /// Current (possibly simulated) UTC time
    fn now(&self) -> DateTime<Utc>;

    /// Simulated seconds elapsed per real second
    fn scale(&self) -> f64;

    /// Change the acceleration factor
    fn set_scale(&self, scale: f64);
}

pub type SharedClock = Arc<dyn Clock>;

struct Anchor {
    wall: Instant,
    sim: DateTime<Utc>,
    scale: f64,
}

/// Wall clock with an adjustable acceleration factor.
///
/// Changing the scale re-anchors the clock so simulated time stays continuous.
pub struct SystemClock {
    anchor: Mutex<Anchor>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            anchor: Mutex::new(Anchor {
                wall: Instant::now(),
                sim: Utc::now(),
                scale: 1.0,
            }),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

fn simulated_now(anchor: &Anchor) -> DateTime<Utc> {
    let real_ms = anchor.wall.elapsed().as_secs_f64() * 1000.0;
    anchor.sim + ChronoDuration::milliseconds((real_ms * anchor.scale) as i64)
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        match self.anchor.lock() {
            Ok(a) => simulated_now(&a),
            Err(poisoned) => simulated_now(&poisoned.into_inner()),
        }
    }

    fn scale(&self) -> f64 {
        match self.anchor.lock() {
            Ok(a) => a.scale,
            Err(poisoned) => poisoned.into_inner().scale,
        }
    }

    fn set_scale(&self, scale: f64) {
        if !(scale.is_finite() && scale > 0.0) {
            tracing::warn!("Ignoring invalid clock scale {}", scale);
            return;
        }
        let mut anchor = match self.anchor.lock() {
            Ok(a) => a,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = simulated_now(&anchor);
        anchor.sim = now;
        anchor.wall = Instant::now();
        anchor.scale = scale;
    }
}

/// Manually driven clock for tests and dry runs
pub struct SimulatedClock {
    state: Mutex<(DateTime<Utc>, f64)>,
}

impl SimulatedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new((start, 1.0)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut s) = self.state.lock() {
            s.0 = now;
        }
    }

    pub fn advance(&self, by: ChronoDuration) {
        if let Ok(mut s) = self.state.lock() {
            s.0 += by;
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(ChronoDuration::seconds(secs));
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.state.lock() {
            Ok(s) => s.0,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    fn scale(&self) -> f64 {
        match self.state.lock() {
            Ok(s) => s.1,
            Err(poisoned) => poisoned.into_inner().1,
        }
    }

    fn set_scale(&self, scale: f64) {
        if let Ok(mut s) = self.state.lock() {
            s.1 = scale;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_simulated_clock_advance() {
        let start = Utc.with_ymd_and_hms(2021, 4, 17, 7, 0, 0).unwrap();
        let clock = SimulatedClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance_secs(90);
        assert_eq!(clock.now(), start + ChronoDuration::seconds(90));

        clock.set_scale(10.0);
        assert_eq!(clock.scale(), 10.0);
    }

    #[test]
    fn test_system_clock_scale() {
        let clock = SystemClock::new();
        assert_eq!(clock.scale(), 1.0);

        clock.set_scale(60.0);
        assert_eq!(clock.scale(), 60.0);

        // Invalid scales are ignored
        clock.set_scale(0.0);
        assert_eq!(clock.scale(), 60.0);
    }

    #[test]
    fn test_system_clock_monotonic_across_rescale() {
        let clock = SystemClock::new();
        let before = clock.now();
        clock.set_scale(100.0);
        let after = clock.now();
        assert!(after >= before);
    }
}
