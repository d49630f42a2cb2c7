//! Scheduler settings
//!
//! Every tunable the scheduler consults lives in [`SchedulerSettings`]. The
//! struct is serde-friendly so it can be stored next to the schedule file;
//! missing fields fall back to their defaults.

use crate::error::{SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What to do with jobs that ended ABORTED or ERROR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorHandlingStrategy {
    /// Leave failed jobs alone
    DontRestart,
    /// Retry failed jobs once every job has terminated
    #[default]
    RestartAfterTermination,
    /// Retry a failed job right away, after the configured delay
    RestartImmediately,
}

/// Observatory location
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    /// Degrees, positive north
    pub latitude: f64,
    /// Degrees, positive east
    pub longitude: f64,
    /// Offset of local civil time from UTC, hours
    pub utc_offset_hours: f64,
}

impl Default for GeoLocation {
    fn default() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
            utc_offset_hours: 0.0,
        }
    }
}

/// Observatory startup and shutdown procedure
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcedureConfig {
    pub startup_script: Option<PathBuf>,
    pub unpark_dome: bool,
    pub unpark_mount: bool,
    pub uncap: bool,

    pub warm_ccd: bool,
    pub cap: bool,
    pub park_mount: bool,
    pub park_dome: bool,
    pub shutdown_script: Option<PathBuf>,
}

/// Timeouts used by the execution state machine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerTimeouts {
    /// Ekos start attempt (default: 60 seconds)
    pub ekos_start_secs: u64,
    /// INDI connection attempt (default: 30 seconds)
    pub indi_connect_secs: u64,
    /// Waiting for devices to report ready (default: 30 seconds)
    pub property_check_secs: u64,
    /// Cap park/unpark (default: 60 seconds)
    pub cap_park_secs: u64,
    /// Mount park/unpark (default: 60 seconds)
    pub mount_park_secs: u64,
    /// Dome park/unpark (default: 120 seconds)
    pub dome_park_secs: u64,
    /// Inactivity on align, focus and capture (default: 120 seconds)
    pub module_inactivity_secs: u64,
    /// Inactivity on guiding (default: 60 seconds)
    pub guide_inactivity_secs: u64,
    /// Base delay before guiding is restarted, multiplied by the failure count (default: 5 seconds)
    pub guide_restart_step_secs: u64,
}

impl Default for SchedulerTimeouts {
    fn default() -> Self {
        Self {
            ekos_start_secs: 60,
            indi_connect_secs: 30,
            property_check_secs: 30,
            cap_park_secs: 60,
            mount_park_secs: 60,
            dome_park_secs: 120,
            module_inactivity_secs: 120,
            guide_inactivity_secs: 60,
            guide_restart_step_secs: 5,
        }
    }
}

impl SchedulerTimeouts {
    pub fn ekos_start(&self) -> Duration {
        Duration::from_secs(self.ekos_start_secs)
    }

    pub fn indi_connect(&self) -> Duration {
        Duration::from_secs(self.indi_connect_secs)
    }

    pub fn property_check(&self) -> Duration {
        Duration::from_secs(self.property_check_secs)
    }

    pub fn cap_park(&self) -> Duration {
        Duration::from_secs(self.cap_park_secs)
    }

    pub fn mount_park(&self) -> Duration {
        Duration::from_secs(self.mount_park_secs)
    }

    pub fn dome_park(&self) -> Duration {
        Duration::from_secs(self.dome_park_secs)
    }

    pub fn module_inactivity(&self) -> Duration {
        Duration::from_secs(self.module_inactivity_secs)
    }

    pub fn guide_inactivity(&self) -> Duration {
        Duration::from_secs(self.guide_inactivity_secs)
    }

    /// Delay before the n-th guiding restart
    pub fn guide_restart_delay(&self, failures: u8) -> Duration {
        Duration::from_secs(self.guide_restart_step_secs * failures as u64)
    }
}

/// All scheduler options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Minimum gap between two consecutive jobs, minutes
    pub lead_time_mins: i64,
    /// Safety margin before astronomical dawn, minutes
    pub pre_dawn_mins: i64,
    /// Targets lower than this many degrees above their minimum altitude count as setting
    pub setting_altitude_cutoff_deg: f64,
    pub remember_job_progress: bool,
    /// Sort jobs by altitude, then priority, before evaluating
    pub sort_jobs: bool,

    pub error_handling: ErrorHandlingStrategy,
    /// Delay before failed jobs are re-evaluated, seconds
    pub error_handling_delay_secs: u64,
    /// Also reconsider ERROR jobs, not only ABORTED ones
    pub reschedule_errors: bool,

    pub preemptive_shutdown: bool,
    /// Waits longer than this shut the observatory down, hours
    pub preemptive_shutdown_hours: f64,

    /// Restart the whole queue once every job is done
    pub repeat_sequence: bool,
    /// Number of queue repetitions, 0 repeats forever
    pub repeat_sequence_count: u32,

    pub dither_enabled: bool,
    pub dither_frames: u32,
    pub dither_settle_secs: f64,
    pub guiding_settle_secs: f64,
    pub reset_guide_calibration: bool,
    pub realign_after_calibration_failure: bool,
    pub reset_mount_model_before_job: bool,
    pub reset_mount_model_on_align_failure: bool,
    pub force_alignment_before_job: bool,

    pub stop_ekos_after_shutdown: bool,
    pub shutdown_script_terminates_indi: bool,

    /// Nominal scheduler tick, milliseconds
    pub update_period_ms: u64,
    /// Number of user-facing log lines kept
    pub log_capacity: usize,

    pub location: GeoLocation,
    pub procedure: ProcedureConfig,
    pub timeouts: SchedulerTimeouts,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            lead_time_mins: 5,
            pre_dawn_mins: 60,
            setting_altitude_cutoff_deg: 3.0,
            remember_job_progress: true,
            sort_jobs: true,
            error_handling: ErrorHandlingStrategy::RestartAfterTermination,
            error_handling_delay_secs: 0,
            reschedule_errors: false,
            preemptive_shutdown: false,
            preemptive_shutdown_hours: 2.0,
            repeat_sequence: false,
            repeat_sequence_count: 0,
            dither_enabled: false,
            dither_frames: 1,
            dither_settle_secs: 0.0,
            guiding_settle_secs: 0.0,
            reset_guide_calibration: false,
            realign_after_calibration_failure: false,
            reset_mount_model_before_job: false,
            reset_mount_model_on_align_failure: false,
            force_alignment_before_job: false,
            stop_ekos_after_shutdown: true,
            shutdown_script_terminates_indi: false,
            update_period_ms: 1000,
            log_capacity: 500,
            location: GeoLocation::default(),
            procedure: ProcedureConfig::default(),
            timeouts: SchedulerTimeouts::default(),
        }
    }
}

impl SchedulerSettings {
    pub fn lead_time_secs(&self) -> i64 {
        self.lead_time_mins * 60
    }

    pub fn update_period(&self) -> Duration {
        Duration::from_millis(self.update_period_ms)
    }

    pub fn error_handling_delay(&self) -> Duration {
        Duration::from_secs(self.error_handling_delay_secs)
    }

    pub fn preemptive_shutdown_secs(&self) -> i64 {
        (self.preemptive_shutdown_hours * 3600.0) as i64
    }

    /// Load settings from a JSON file
    pub fn load(path: &Path) -> SchedulerResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let settings: SchedulerSettings = serde_json::from_str(&contents)?;
        settings.validate()?;
        tracing::debug!("Loaded scheduler settings from {}", path.display());
        Ok(settings)
    }

    /// Save settings to a JSON file
    pub fn save(&self, path: &Path) -> SchedulerResult<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.lead_time_mins < 0 {
            return Err(SchedulerError::InvalidConfig(format!(
                "lead time must not be negative, got {} minutes",
                self.lead_time_mins
            )));
        }
        if self.pre_dawn_mins < 0 {
            return Err(SchedulerError::InvalidConfig(format!(
                "pre-dawn time must not be negative, got {} minutes",
                self.pre_dawn_mins
            )));
        }
        if self.dither_frames == 0 {
            return Err(SchedulerError::InvalidConfig(
                "dither frames must be at least 1".to_string(),
            ));
        }
        if self.update_period_ms == 0 {
            return Err(SchedulerError::InvalidConfig(
                "update period must be positive".to_string(),
            ));
        }
        let loc = &self.location;
        if !loc.latitude.is_finite() || loc.latitude.abs() > 90.0 {
            return Err(SchedulerError::InvalidConfig(format!(
                "latitude out of range: {}",
                loc.latitude
            )));
        }
        if !loc.longitude.is_finite() || !loc.utc_offset_hours.is_finite() {
            return Err(SchedulerError::InvalidConfig(
                "location coordinates must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = SchedulerSettings::default();
        assert_eq!(settings.lead_time_secs(), 300);
        assert_eq!(settings.timeouts.ekos_start(), Duration::from_secs(60));
        assert_eq!(settings.timeouts.dome_park(), Duration::from_secs(120));
        assert_eq!(settings.timeouts.guide_restart_delay(3), Duration::from_secs(15));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "lead_time_mins": 10, "error_handling": "RESTART_IMMEDIATELY" }"#;
        let settings: SchedulerSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.lead_time_mins, 10);
        assert_eq!(settings.error_handling, ErrorHandlingStrategy::RestartImmediately);
        assert_eq!(settings.pre_dawn_mins, 60);
        assert!(settings.remember_job_progress);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut settings = SchedulerSettings::default();
        settings.dither_frames = 0;
        assert!(settings.validate().is_err());

        let mut settings = SchedulerSettings::default();
        settings.location.latitude = 95.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.json");

        let mut settings = SchedulerSettings::default();
        settings.procedure.park_mount = true;
        settings.location.latitude = 37.44;
        settings.save(&path).unwrap();

        let loaded = SchedulerSettings::load(&path).unwrap();
        assert_eq!(loaded, settings);
    }
}
