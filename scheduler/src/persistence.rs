//! Schedule files
//!
//! A schedule is a JSON document holding the job definitions together with
//! the options that travel with them.

use crate::config::{ErrorHandlingStrategy, GeoLocation, ProcedureConfig, SchedulerSettings};
use crate::error::{SchedulerError, SchedulerResult};
use crate::events::SchedulerEvent;
use crate::job::{JobDefinition, ObservationJob};
use crate::process::SchedulerProcess;
use crate::session::SchedulerState;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Current schedule format version
pub const SCHEDULE_FORMAT_VERSION: u32 = 1;

fn default_true() -> bool {
    true
}

/// On-disk schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDocument {
    pub version: u32,
    pub jobs: Vec<JobDefinition>,
    #[serde(default)]
    pub procedure: ProcedureConfig,
    #[serde(default)]
    pub error_handling: ErrorHandlingStrategy,
    #[serde(default)]
    pub error_handling_delay_secs: u64,
    #[serde(default)]
    pub reschedule_errors: bool,
    #[serde(default = "default_true")]
    pub remember_job_progress: bool,
    #[serde(default)]
    pub location: Option<GeoLocation>,
}

impl ScheduleDocument {
    pub fn new(settings: &SchedulerSettings, jobs: &[ObservationJob]) -> Self {
        Self {
            version: SCHEDULE_FORMAT_VERSION,
            jobs: jobs.iter().map(ObservationJob::to_definition).collect(),
            procedure: settings.procedure.clone(),
            error_handling: settings.error_handling,
            error_handling_delay_secs: settings.error_handling_delay_secs,
            reschedule_errors: settings.reschedule_errors,
            remember_job_progress: settings.remember_job_progress,
            location: Some(settings.location),
        }
    }

    /// Copy the options carried by the schedule into `settings`
    pub fn apply_to(&self, settings: &mut SchedulerSettings) {
        settings.procedure = self.procedure.clone();
        settings.error_handling = self.error_handling;
        settings.error_handling_delay_secs = self.error_handling_delay_secs;
        settings.reschedule_errors = self.reschedule_errors;
        settings.remember_job_progress = self.remember_job_progress;
        if let Some(location) = self.location {
            settings.location = location;
        }
    }

    pub fn read(path: &Path) -> SchedulerResult<Self> {
        let invalid = |reason: String| SchedulerError::InvalidSchedule {
            path: path.display().to_string(),
            reason,
        };

        let contents = std::fs::read_to_string(path)?;
        let document: ScheduleDocument = serde_json::from_str(&contents).map_err(|e| invalid(e.to_string()))?;
        if document.version != SCHEDULE_FORMAT_VERSION {
            return Err(SchedulerError::UnsupportedVersion(document.version));
        }

        for def in &document.jobs {
            if def.name.trim().is_empty() {
                return Err(invalid("job without a name".to_string()));
            }
            let target = def.target;
            if !target.ra_hours.is_finite() || !target.dec_degrees.is_finite() || target.dec_degrees.abs() > 90.0 {
                return Err(invalid(format!("job '{}' has invalid coordinates", def.name)));
            }
        }

        tracing::debug!("Read {} jobs from {}", document.jobs.len(), path.display());
        Ok(document)
    }

    pub fn write(&self, path: &Path) -> SchedulerResult<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

impl SchedulerProcess {
    fn ensure_idle(&self, path: &Path) -> SchedulerResult<()> {
        if self.session.scheduler != SchedulerState::Idle {
            return Err(SchedulerError::InvalidSchedule {
                path: path.display().to_string(),
                reason: format!("scheduler is {}", self.session.scheduler),
            });
        }
        Ok(())
    }

    /// Replace the queue with the jobs of a schedule file. Returns the job count.
    pub fn load_schedule(&mut self, path: &Path) -> SchedulerResult<usize> {
        self.ensure_idle(path)?;
        self.set_scheduler_state(SchedulerState::Loading);
        let document = match ScheduleDocument::read(path) {
            Ok(document) => document,
            Err(e) => {
                self.set_scheduler_state(SchedulerState::Idle);
                self.append_log(format!("Failed to load schedule {}: {}", path.display(), e));
                return Err(e);
            }
        };

        document.apply_to(&mut self.settings);
        self.jobs = document.jobs.iter().map(ObservationJob::from_definition).collect();
        self.active_job = None;
        self.captured.clear();
        self.dirty = false;
        self.set_scheduler_state(SchedulerState::Idle);
        self.events.emit(SchedulerEvent::JobListChanged);
        self.append_log(format!("Loaded {} jobs from {}.", self.jobs.len(), path.display()));
        Ok(self.jobs.len())
    }

    /// Add the jobs of a schedule file to the queue; options stay as they are
    pub fn append_schedule(&mut self, path: &Path) -> SchedulerResult<usize> {
        self.ensure_idle(path)?;
        let document = ScheduleDocument::read(path)?;
        let count = document.jobs.len();
        self.jobs.extend(document.jobs.iter().map(ObservationJob::from_definition));
        self.dirty = true;
        self.events.emit(SchedulerEvent::JobListChanged);
        self.append_log(format!("Appended {} jobs from {}.", count, path.display()));
        Ok(count)
    }

    pub fn save_schedule(&mut self, path: &Path) -> SchedulerResult<()> {
        ScheduleDocument::new(&self.settings, &self.jobs).write(path)?;
        self.dirty = false;
        self.append_log(format!("Scheduler list saved to {}.", path.display()));
        Ok(())
    }
}
