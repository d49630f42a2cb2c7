//! Observation job model
//!
//! A [`JobDefinition`] is what the user writes and what the schedule file
//! stores. An [`ObservationJob`] is the runtime form: the definition plus the
//! working fields the evaluation engine and the execution state machine
//! mutate.

use crate::astro::{self, SkyPoint};
use crate::config::GeoLocation;
use crate::constraints::{Observatory, Score, BAD_SCORE};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Duration not estimated yet
pub const ESTIMATE_UNKNOWN: i64 = -1;
/// Duration unbounded or impossible to estimate
pub const ESTIMATE_UNBOUNDED: i64 = -2;

/// Search horizon of the altitude/Moon constraint search, minutes
const ALTITUDE_SEARCH_MINS: i64 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Idle,
    Evaluation,
    Scheduled,
    Busy,
    Error,
    Aborted,
    Invalid,
    Complete,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Idle => "IDLE",
            JobState::Evaluation => "EVALUATION",
            JobState::Scheduled => "SCHEDULED",
            JobState::Busy => "BUSY",
            JobState::Error => "ERROR",
            JobState::Aborted => "ABORTED",
            JobState::Invalid => "INVALID",
            JobState::Complete => "COMPLETE",
        };
        f.write_str(s)
    }
}

/// Pipeline stage of the BUSY job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStage {
    Idle,
    Slewing,
    SlewComplete,
    Focusing,
    FocusComplete,
    Aligning,
    AlignComplete,
    Reslewing,
    ReslewingComplete,
    PostalignFocusing,
    PostalignFocusingComplete,
    Guiding,
    GuidingComplete,
    Capturing,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartupCondition {
    Asap,
    At { time: DateTime<Utc> },
    /// Transit time plus an offset in minutes, negative meaning before transit
    Culmination { offset_mins: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionCondition {
    Sequence,
    Repeat { count: u32 },
    Loop,
    At { time: DateTime<Utc> },
}

/// Set of pipeline steps a job needs before capturing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepPipeline(u8);

impl StepPipeline {
    pub const NONE: StepPipeline = StepPipeline(0);
    pub const TRACK: StepPipeline = StepPipeline(1 << 0);
    pub const FOCUS: StepPipeline = StepPipeline(1 << 1);
    pub const ALIGN: StepPipeline = StepPipeline(1 << 2);
    pub const GUIDE: StepPipeline = StepPipeline(1 << 3);

    pub const fn all() -> Self {
        StepPipeline(0b1111)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn contains(&self, other: StepPipeline) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn insert(&mut self, other: StepPipeline) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: StepPipeline) {
        self.0 &= !other.0;
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for StepPipeline {
    type Output = StepPipeline;

    fn bitor(self, rhs: StepPipeline) -> StepPipeline {
        StepPipeline(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConstraints {
    /// Degrees above the horizon, None means no constraint
    pub min_altitude: Option<f64>,
    /// Degrees from the Moon, None means no constraint
    pub min_moon_separation: Option<f64>,
    pub enforce_twilight: bool,
    pub enforce_weather: bool,
}

/// Captures already on disk, per storage signature
pub type CapturedFramesMap = HashMap<String, u32>;

/// Persisted description of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub target: SkyPoint,
    pub sequence_file: PathBuf,
    #[serde(default)]
    pub fits_file: Option<PathBuf>,
    #[serde(default)]
    pub position_angle: Option<f64>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    pub startup: StartupCondition,
    pub completion: CompletionCondition,
    #[serde(default)]
    pub constraints: JobConstraints,
    #[serde(default = "StepPipeline::all")]
    pub steps: StepPipeline,
}

fn default_priority() -> u8 {
    10
}

/// Runtime job, owned by the scheduler queue
#[derive(Debug, Clone)]
pub struct ObservationJob {
    pub id: Uuid,
    pub name: String,
    pub target: SkyPoint,
    pub sequence_file: PathBuf,
    pub fits_file: Option<PathBuf>,
    pub position_angle: Option<f64>,
    /// Lower value wins ties
    pub priority: u8,

    /// Startup condition as loaded, restored on reset
    pub file_startup_condition: StartupCondition,
    /// Startup condition as currently worked on by evaluation
    pub startup_condition: StartupCondition,
    pub startup_time: Option<DateTime<Utc>>,
    completion_condition: CompletionCondition,
    pub constraints: JobConstraints,
    pub steps: StepPipeline,

    state: JobState,
    pub state_time: Option<DateTime<Utc>>,
    pub stage: JobStage,
    pub score: Score,
    /// Seconds; see ESTIMATE_UNKNOWN and ESTIMATE_UNBOUNDED
    pub estimated_time: i64,
    /// Seconds between the previous job's completion and this job's startup
    pub lead_time: i64,
    /// Pipeline overhead before the first capture, seconds
    pub estimated_startup_secs: i64,
    pub altitude_at_startup: Option<f64>,
    pub setting_at_startup: bool,

    pub repeats_required: u32,
    pub repeats_remaining: u32,
    pub completed_iterations: u32,
    pub captured_frames: CapturedFramesMap,
    pub light_frames_required: bool,
    pub in_sequence_focus: bool,
    pub sequence_count: u32,
    pub completed_count: u32,
    pub initial_filter: Option<String>,
    pub(crate) focus_warning_logged: bool,
}

impl ObservationJob {
    pub fn new(name: impl Into<String>, target: SkyPoint) -> Self {
        let mut job = Self {
            id: Uuid::new_v4(),
            name: name.into(),
            target,
            sequence_file: PathBuf::new(),
            fits_file: None,
            position_angle: None,
            priority: default_priority(),
            file_startup_condition: StartupCondition::Asap,
            startup_condition: StartupCondition::Asap,
            startup_time: None,
            completion_condition: CompletionCondition::Sequence,
            constraints: JobConstraints::default(),
            steps: StepPipeline::TRACK,
            state: JobState::Idle,
            state_time: None,
            stage: JobStage::Idle,
            score: 0,
            estimated_time: ESTIMATE_UNKNOWN,
            lead_time: 0,
            estimated_startup_secs: 0,
            altitude_at_startup: None,
            setting_at_startup: false,
            repeats_required: 1,
            repeats_remaining: 1,
            completed_iterations: 0,
            captured_frames: CapturedFramesMap::new(),
            light_frames_required: false,
            in_sequence_focus: false,
            sequence_count: 0,
            completed_count: 0,
            initial_filter: None,
            focus_warning_logged: false,
        };
        job.set_completion_condition(CompletionCondition::Sequence);
        job
    }

    pub fn from_definition(def: &JobDefinition) -> Self {
        let mut job = Self::new(def.name.clone(), def.target);
        job.sequence_file = def.sequence_file.clone();
        job.fits_file = def.fits_file.clone();
        job.position_angle = def.position_angle;
        job.priority = def.priority;
        job.constraints = def.constraints;
        job.steps = def.steps;
        job.set_file_startup_condition(def.startup);
        job.set_completion_condition(def.completion);
        job
    }

    pub fn to_definition(&self) -> JobDefinition {
        JobDefinition {
            name: self.name.clone(),
            target: self.target,
            sequence_file: self.sequence_file.clone(),
            fits_file: self.fits_file.clone(),
            position_angle: self.position_angle,
            priority: self.priority,
            startup: self.file_startup_condition,
            completion: self.completion_condition,
            constraints: self.constraints,
            steps: self.steps,
        }
    }

    // ===== Builders =====

    pub fn with_sequence(mut self, path: impl Into<PathBuf>) -> Self {
        self.sequence_file = path.into();
        self
    }

    pub fn with_startup(mut self, condition: StartupCondition) -> Self {
        self.set_file_startup_condition(condition);
        self
    }

    pub fn with_completion(mut self, condition: CompletionCondition) -> Self {
        self.set_completion_condition(condition);
        self
    }

    pub fn with_constraints(mut self, constraints: JobConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_steps(mut self, steps: StepPipeline) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    // ===== State =====

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Change the state, returning true when it actually changed
    pub fn set_state(&mut self, state: JobState, now: DateTime<Utc>) -> bool {
        if self.state == state {
            return false;
        }
        tracing::debug!("Job '{}' state {} -> {}", self.name, self.state, state);
        self.state = state;
        self.state_time = Some(now);
        if state != JobState::Busy {
            self.stage = JobStage::Idle;
        }
        true
    }

    pub fn set_file_startup_condition(&mut self, condition: StartupCondition) {
        self.file_startup_condition = condition;
        self.set_startup_condition(condition);
    }

    pub fn set_startup_condition(&mut self, condition: StartupCondition) {
        self.startup_condition = condition;
        self.startup_time = match condition {
            StartupCondition::At { time } => Some(time),
            _ => None,
        };
    }

    pub fn completion_condition(&self) -> CompletionCondition {
        self.completion_condition
    }

    pub fn set_completion_condition(&mut self, condition: CompletionCondition) {
        self.completion_condition = condition;
        self.repeats_required = match condition {
            CompletionCondition::Loop | CompletionCondition::At { .. } => 0,
            CompletionCondition::Sequence => 1,
            CompletionCondition::Repeat { count } => count.max(1),
        };
        self.repeats_remaining = self.repeats_required;
    }

    /// When the job is expected to finish, if that can be known
    pub fn completion_time(&self) -> Option<DateTime<Utc>> {
        match self.completion_condition {
            CompletionCondition::At { time } => Some(time),
            CompletionCondition::Loop => None,
            _ if self.estimated_time < 0 => None,
            _ => self
                .startup_time
                .map(|start| start + Duration::seconds(self.estimated_time)),
        }
    }

    pub fn has_fixed_startup(&self) -> bool {
        matches!(self.startup_condition, StartupCondition::At { .. })
    }

    pub fn is_culmination(&self) -> bool {
        matches!(self.startup_condition, StartupCondition::Culmination { .. })
    }

    /// Two jobs capturing the same target with the same sequence
    pub fn is_duplicate_of(&self, other: &ObservationJob) -> bool {
        self.id != other.id && self.name == other.name && self.sequence_file == other.sequence_file
    }

    /// Back to a freshly loaded job, forcing re-estimation
    pub fn reset(&mut self) {
        self.state = JobState::Idle;
        self.state_time = None;
        self.stage = JobStage::Idle;
        self.estimated_time = ESTIMATE_UNKNOWN;
        self.lead_time = 0;
        self.score = 0;
        self.set_startup_condition(self.file_startup_condition);
        self.repeats_remaining = self.repeats_required;
        self.focus_warning_logged = false;
    }

    // ===== Astronomy =====

    pub fn altitude_at(&self, location: &GeoLocation, t: &DateTime<Utc>) -> f64 {
        astro::altitude(&self.target, location, t)
    }

    /// Past the meridian, i.e. losing altitude
    pub fn is_setting_at(&self, location: &GeoLocation, t: &DateTime<Utc>) -> bool {
        astro::hour_angle(&self.target, location, t) > 0.0
    }

    /// Next transit at or after `from`, shifted by the culmination offset.
    /// None when the target stays below the horizon at transit.
    pub fn calculate_culmination(&self, location: &GeoLocation, from: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let offset = match self.file_startup_condition {
            StartupCondition::Culmination { offset_mins } => Duration::minutes(offset_mins),
            _ => Duration::zero(),
        };
        let transit = astro::next_transit(&self.target, location, &(*from - offset));
        if self.altitude_at(location, &transit) < 0.0 {
            return None;
        }
        Some(transit + offset)
    }

    /// First minute at or after `from` where both the altitude and Moon
    /// separation constraints hold, searching one day ahead.
    pub fn calculate_altitude_time(&self, location: &GeoLocation, from: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let min_alt = self.constraints.min_altitude;
        let min_sep = self.constraints.min_moon_separation;
        if min_alt.is_none() && min_sep.is_none() {
            return Some(*from);
        }

        (0..=ALTITUDE_SEARCH_MINS)
            .map(|m| *from + Duration::minutes(m))
            .find(|t| {
                let alt_ok = min_alt.map_or(true, |min| self.altitude_at(location, t) >= min);
                alt_ok
                    && min_sep.map_or(true, |min| {
                        let moon = astro::moon_position(astro::julian_day(t));
                        astro::angular_separation(&moon, &self.target) >= min
                    })
            })
    }

    /// Whether the altitude and Moon constraints hold at `t`
    pub fn constraints_hold_at(&self, obs: &Observatory, t: &DateTime<Utc>) -> bool {
        let alt_ok = self
            .constraints
            .min_altitude
            .map_or(true, |min| obs.altitude(&self.target, t) >= min);
        let moon_ok = self.constraints.min_moon_separation.map_or(true, |min| {
            let moon = astro::moon_position(astro::julian_day(t));
            astro::angular_separation(&moon, &self.target) >= min
        });
        alt_ok && moon_ok
    }

    pub fn has_bad_score(&self) -> bool {
        self.score <= BAD_SCORE
    }
}

/// Setting targets first, then by altitude at the reference time.
/// Two setting targets sort lowest first since that one is lost sooner.
pub fn decreasing_altitude_order(
    a: &ObservationJob,
    b: &ObservationJob,
    location: &GeoLocation,
    when: &DateTime<Utc>,
) -> Ordering {
    let a_setting = a.is_setting_at(location, when);
    let b_setting = b.is_setting_at(location, when);
    let alt_a = a.altitude_at(location, when);
    let alt_b = b.altitude_at(location, when);

    match (a_setting, b_setting) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (true, true) => alt_a.partial_cmp(&alt_b).unwrap_or(Ordering::Equal),
        (false, false) => alt_b.partial_cmp(&alt_a).unwrap_or(Ordering::Equal),
    }
}

/// Ascending priority value
pub fn increasing_priority_order(a: &ObservationJob, b: &ObservationJob) -> Ordering {
    a.priority.cmp(&b.priority)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn silicon_valley() -> GeoLocation {
        GeoLocation {
            latitude: 37.0 + 26.0 / 60.0 + 30.0 / 3600.0,
            longitude: -(122.0 + 10.0 / 60.0),
            utc_offset_hours: -7.0,
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 4, 17, 7, 0, 1).unwrap()
    }

    #[test]
    fn test_step_pipeline() {
        let mut steps = StepPipeline::TRACK | StepPipeline::FOCUS;
        assert!(steps.contains(StepPipeline::TRACK));
        assert!(!steps.contains(StepPipeline::GUIDE));

        steps.remove(StepPipeline::FOCUS);
        assert!(!steps.contains(StepPipeline::FOCUS));
        steps.insert(StepPipeline::GUIDE);
        assert_eq!(steps.bits(), 0b1001);
        assert!(!StepPipeline::NONE.contains(StepPipeline::NONE));
    }

    #[test]
    fn test_repeats_follow_completion_condition() {
        let mut job = ObservationJob::new("M42", SkyPoint::new(5.58, -5.39));
        assert_eq!(job.repeats_required, 1);

        job.set_completion_condition(CompletionCondition::Repeat { count: 3 });
        assert_eq!(job.repeats_required, 3);
        assert_eq!(job.repeats_remaining, 3);

        job.set_completion_condition(CompletionCondition::Repeat { count: 0 });
        assert_eq!(job.repeats_required, 1);

        job.set_completion_condition(CompletionCondition::Loop);
        assert_eq!(job.repeats_required, 0);
    }

    #[test]
    fn test_completion_time() {
        let mut job = ObservationJob::new("M42", SkyPoint::new(5.58, -5.39));
        assert!(job.completion_time().is_none());

        job.startup_time = Some(start());
        job.estimated_time = 600;
        assert_eq!(job.completion_time(), Some(start() + Duration::seconds(600)));

        job.estimated_time = ESTIMATE_UNBOUNDED;
        assert!(job.completion_time().is_none());

        let end = start() + Duration::hours(2);
        job.set_completion_condition(CompletionCondition::At { time: end });
        assert_eq!(job.completion_time(), Some(end));
    }

    #[test]
    fn test_reset_restores_file_startup() {
        let fixed = start() + Duration::hours(1);
        let mut job = ObservationJob::new("M42", SkyPoint::new(5.58, -5.39))
            .with_startup(StartupCondition::At { time: fixed })
            .with_completion(CompletionCondition::Repeat { count: 2 });

        job.set_state(JobState::Scheduled, start());
        job.startup_time = Some(fixed + Duration::hours(3));
        job.estimated_time = 1200;
        job.lead_time = 300;
        job.repeats_remaining = 1;
        job.stage = JobStage::Capturing;

        job.reset();
        assert_eq!(job.state(), JobState::Idle);
        assert_eq!(job.stage, JobStage::Idle);
        assert_eq!(job.estimated_time, ESTIMATE_UNKNOWN);
        assert_eq!(job.lead_time, 0);
        assert_eq!(job.startup_time, Some(fixed));
        assert_eq!(job.repeats_remaining, 2);
    }

    #[test]
    fn test_definition_round_trip() {
        let job = ObservationJob::new("M42", SkyPoint::new(5.58, -5.39))
            .with_sequence("/tmp/m42.json")
            .with_startup(StartupCondition::Culmination { offset_mins: -30 })
            .with_steps(StepPipeline::all())
            .with_priority(3);
        let def = job.to_definition();
        let json = serde_json::to_string(&def).unwrap();
        let back: JobDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, def);

        let rebuilt = ObservationJob::from_definition(&back);
        assert_eq!(rebuilt.startup_condition, StartupCondition::Culmination { offset_mins: -30 });
        assert_eq!(rebuilt.priority, 3);
    }

    #[test]
    fn test_culmination() {
        let loc = silicon_valley();
        let job = ObservationJob::new("zenith", SkyPoint::from_degrees(188.2, 37.56))
            .with_startup(StartupCondition::Culmination { offset_mins: 60 });
        let culmination = job.calculate_culmination(&loc, &start()).unwrap();
        assert!(culmination >= start());
        let transit = culmination - Duration::minutes(60);
        assert!(astro::hour_angle(&job.target, &loc, &transit).abs() < 0.01);

        // A southern circumpolar target never rises at this latitude
        let hidden = ObservationJob::new("south", SkyPoint::new(12.0, -70.0));
        assert!(hidden.calculate_culmination(&loc, &start()).is_none());
    }

    #[test]
    fn test_altitude_time() {
        let loc = silicon_valley();
        let mut job = ObservationJob::new("zenith", SkyPoint::from_degrees(188.2, 37.56));
        assert_eq!(job.calculate_altitude_time(&loc, &start()), Some(start()));

        job.constraints.min_altitude = Some(80.0);
        assert_eq!(job.calculate_altitude_time(&loc, &start()), Some(start()));

        // A target culminating near 40 degrees never reaches 80
        let mut low = ObservationJob::new("low", SkyPoint::new(12.0, -12.5));
        low.constraints.min_altitude = Some(80.0);
        assert!(low.calculate_altitude_time(&loc, &start()).is_none());
    }

    #[test]
    fn test_ordering_predicates() {
        let loc = silicon_valley();
        // Both just past the meridian at the reference time
        let high = ObservationJob::new("high", SkyPoint::from_degrees(188.2, 37.56)).with_priority(5);
        let low = ObservationJob::new("low", SkyPoint::new(12.0, -12.5)).with_priority(1);
        // Still rising
        let rising = ObservationJob::new("rising", SkyPoint::new(14.0, 20.0));

        assert!(high.is_setting_at(&loc, &start()));
        assert!(!rising.is_setting_at(&loc, &start()));

        assert_eq!(decreasing_altitude_order(&high, &rising, &loc, &start()), Ordering::Less);
        assert_eq!(decreasing_altitude_order(&rising, &low, &loc, &start()), Ordering::Greater);
        assert_eq!(decreasing_altitude_order(&high, &low, &loc, &start()), Ordering::Greater);
        assert_eq!(increasing_priority_order(&high, &low), Ordering::Greater);
    }

    #[test]
    fn test_duplicates() {
        let a = ObservationJob::new("M42", SkyPoint::new(5.58, -5.39)).with_sequence("/tmp/a.json");
        let b = ObservationJob::new("M42", SkyPoint::new(5.58, -5.39)).with_sequence("/tmp/a.json");
        let c = ObservationJob::new("M42", SkyPoint::new(5.58, -5.39)).with_sequence("/tmp/c.json");
        assert!(a.is_duplicate_of(&b));
        assert!(!a.is_duplicate_of(&a));
        assert!(!a.is_duplicate_of(&c));
    }
}
