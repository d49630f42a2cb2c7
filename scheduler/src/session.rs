//! Per-session state of the execution state machine
//!
//! Everything here is reset explicitly when the scheduler starts or stops.
//! Nothing lives in statics.

use crate::clock::Clock;
use crate::device::WeatherStatus;
use crate::MAX_FAILURE_ATTEMPTS;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// =========================================================================
// STATES
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerState {
    Idle,
    Running,
    Paused,
    Shutdown,
    Loading,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchedulerState::Idle => "Idle",
            SchedulerState::Running => "Running",
            SchedulerState::Paused => "Paused",
            SchedulerState::Shutdown => "Shutdown",
            SchedulerState::Loading => "Loading",
        };
        write!(f, "{}", s)
    }
}

/// What the next iteration of the scheduler loop does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerState {
    RunWakeup,
    RunScheduler,
    RunJobCheck,
    RunShutdown,
    RunNothing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EkosState {
    Idle,
    Starting,
    Stopping,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndiState {
    Idle,
    Connecting,
    Disconnecting,
    PropertyCheck,
    Ready,
}

/// Startup procedure. Ordering matters: phase 2 covers the unparking states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartupState {
    Idle,
    Script,
    UnparkDome,
    UnparkingDome,
    UnparkMount,
    UnparkingMount,
    UnparkCap,
    UnparkingCap,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShutdownState {
    Idle,
    ParkCap,
    ParkingCap,
    ParkMount,
    ParkingMount,
    ParkDome,
    ParkingDome,
    Script,
    ScriptRunning,
    Complete,
    Error,
}

/// Mount parking while waiting for the next job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParkWaitState {
    Idle,
    Park,
    Parking,
    Parked,
    Unpark,
    Unparking,
    Unparked,
    Error,
}

// =========================================================================
// FAILURE COUNTERS
// =========================================================================

/// Bounded retry counters, one per retried operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureCounters {
    pub ekos_connect: u8,
    pub indi_connect: u8,
    pub align: u8,
    pub guide: u8,
    pub focus: u8,
    pub capture: u8,
    pub parking_cap: u8,
    pub parking_mount: u8,
    pub parking_dome: u8,
}

impl FailureCounters {
    /// Count one more failure; true while another attempt is allowed
    pub fn increase(counter: &mut u8) -> bool {
        *counter = counter.saturating_add(1);
        *counter <= MAX_FAILURE_ATTEMPTS
    }

    /// Counters reset between jobs
    pub fn reset_job(&mut self) {
        self.align = 0;
        self.guide = 0;
        self.focus = 0;
        self.capture = 0;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// =========================================================================
// STOPWATCH
// =========================================================================

/// Measures elapsed real time from the scheduler clock
#[derive(Debug, Clone, Copy, Default)]
pub struct Stopwatch {
    started: Option<DateTime<Utc>>,
}

impl Stopwatch {
    pub fn start(&mut self, clock: &dyn Clock) {
        self.started = Some(clock.now());
    }

    pub fn stop(&mut self) {
        self.started = None;
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    /// Real time elapsed: clock time divided by the simulation scale
    pub fn elapsed(&self, clock: &dyn Clock) -> Duration {
        let Some(started) = self.started else {
            return Duration::ZERO;
        };
        let sim_ms = (clock.now() - started).num_milliseconds().max(0) as f64;
        let scale = clock.scale();
        let scale = if scale.is_finite() && scale > 0.0 { scale } else { 1.0 };
        Duration::from_millis((sim_ms / scale) as u64)
    }

    pub fn exceeded(&self, clock: &dyn Clock, limit: Duration) -> bool {
        self.is_running() && self.elapsed(clock) > limit
    }
}

// =========================================================================
// SESSION
// =========================================================================

/// Mutable state of one scheduler session
#[derive(Debug, Clone)]
pub struct SessionState {
    pub scheduler: SchedulerState,
    pub ekos: EkosState,
    pub indi: IndiState,
    pub startup: StartupState,
    pub shutdown: ShutdownState,
    pub park_wait: ParkWaitState,

    pub mount_ready: bool,
    pub dome_ready: bool,
    pub cap_ready: bool,
    pub capture_ready: bool,

    pub failures: FailureCounters,
    /// Timer for the operation currently in progress (bring-up, parking, stage)
    pub operation_timer: Stopwatch,
    /// Guiding restart deadline after a guiding failure
    pub guiding_restart_at: Option<DateTime<Utc>>,
    pub autofocus_completed: bool,
    pub capture_batch: u32,

    pub preemptive_shutdown: bool,
    pub preemptive_wakeup_time: Option<DateTime<Utc>>,
    /// Wake deadline of a plain sleep
    pub wakeup_time: Option<DateTime<Utc>>,

    pub sequence_iteration: u32,
    pub iteration: u64,
    pub weather: WeatherStatus,

    pub timer_state: TimerState,
    /// Milliseconds until the next iteration, negative to stop iterating
    pub timer_interval_ms: i64,
    pub iteration_setup: bool,

    /// Startup or shutdown procedure started by hand, outside of a run
    pub manual_startup: bool,
    pub manual_shutdown: bool,
    /// Last status seen per polled module, to detect changes
    pub last_polled_status: Option<serde_json::Value>,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            scheduler: SchedulerState::Idle,
            ekos: EkosState::Idle,
            indi: IndiState::Idle,
            startup: StartupState::Idle,
            shutdown: ShutdownState::Idle,
            park_wait: ParkWaitState::Idle,
            mount_ready: false,
            dome_ready: false,
            cap_ready: false,
            capture_ready: false,
            failures: FailureCounters::default(),
            operation_timer: Stopwatch::default(),
            guiding_restart_at: None,
            autofocus_completed: false,
            capture_batch: 0,
            preemptive_shutdown: false,
            preemptive_wakeup_time: None,
            wakeup_time: None,
            sequence_iteration: 0,
            iteration: 0,
            weather: WeatherStatus::Idle,
            timer_state: TimerState::RunNothing,
            timer_interval_ms: -1,
            iteration_setup: false,
            manual_startup: false,
            manual_shutdown: false,
            last_polled_status: None,
        }
    }

    /// Schedule the next iteration
    pub fn setup_next_iteration(&mut self, state: TimerState, interval_ms: i64) {
        self.timer_state = state;
        self.timer_interval_ms = if state == TimerState::RunNothing { -1 } else { interval_ms };
        self.iteration_setup = true;
    }

    pub fn enable_preemptive_shutdown(&mut self, wakeup: DateTime<Utc>) {
        self.preemptive_shutdown = true;
        self.preemptive_wakeup_time = Some(wakeup);
    }

    pub fn disable_preemptive_shutdown(&mut self) {
        self.preemptive_shutdown = false;
        self.preemptive_wakeup_time = None;
    }

    pub fn is_indi_connected(&self) -> bool {
        matches!(self.indi, IndiState::Ready | IndiState::PropertyCheck)
    }

    pub fn start_guiding_timer(&mut self, at: DateTime<Utc>) {
        self.guiding_restart_at = Some(at);
    }

    pub fn cancel_guiding_timer(&mut self) {
        self.guiding_restart_at = None;
    }

    pub fn is_guiding_timer_active(&self) -> bool {
        self.guiding_restart_at.is_some()
    }

    /// Device readiness is lost with the INDI connection
    pub fn clear_device_ready(&mut self) {
        self.mount_ready = false;
        self.dome_ready = false;
        self.cap_ready = false;
        self.capture_ready = false;
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use chrono::TimeZone;

    #[test]
    fn test_failure_counter_bound() {
        let mut counters = FailureCounters::default();
        for _ in 0..MAX_FAILURE_ATTEMPTS {
            assert!(FailureCounters::increase(&mut counters.align));
        }
        assert!(!FailureCounters::increase(&mut counters.align));

        counters.parking_dome = 3;
        counters.reset_job();
        assert_eq!(counters.align, 0);
        assert_eq!(counters.parking_dome, 3);
        counters.reset();
        assert_eq!(counters, FailureCounters::default());
    }

    #[test]
    fn test_stopwatch_follows_scale() {
        let clock = SimulatedClock::new(Utc.with_ymd_and_hms(2021, 4, 17, 7, 0, 0).unwrap());
        let mut watch = Stopwatch::default();
        assert_eq!(watch.elapsed(&clock), Duration::ZERO);
        assert!(!watch.exceeded(&clock, Duration::ZERO));

        watch.start(&clock);
        clock.advance_secs(60);
        assert_eq!(watch.elapsed(&clock), Duration::from_secs(60));

        clock.set_scale(10.0);
        assert_eq!(watch.elapsed(&clock), Duration::from_secs(6));
        assert!(watch.exceeded(&clock, Duration::from_secs(5)));

        watch.stop();
        assert!(!watch.is_running());
    }

    #[test]
    fn test_setup_next_iteration() {
        let mut session = SessionState::new();
        session.setup_next_iteration(TimerState::RunJobCheck, 1000);
        assert_eq!(session.timer_state, TimerState::RunJobCheck);
        assert_eq!(session.timer_interval_ms, 1000);
        assert!(session.iteration_setup);

        session.setup_next_iteration(TimerState::RunNothing, 1000);
        assert_eq!(session.timer_interval_ms, -1);
    }

    #[test]
    fn test_startup_phase_ordering() {
        assert!(StartupState::Script < StartupState::UnparkDome);
        assert!(StartupState::UnparkingCap < StartupState::Error);
        assert!(StartupState::Complete < StartupState::Error);
    }
}
