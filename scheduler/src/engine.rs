//! Evaluation engine
//!
//! Filters the job queue, estimates durations, resolves overlaps between
//! jobs one at a time in list order, and picks the next job to execute.

use crate::config::{ErrorHandlingStrategy, SchedulerSettings};
use crate::constraints::{
    altitude_score, dark_sky_score, moon_separation_score, total_score, weather_score, Observatory, Score,
    BAD_SCORE,
};
use crate::device::WeatherStatus;
use crate::estimate::{estimate_job_time, update_light_frames_required};
use crate::events::{EventSink, SchedulerEvent};
use crate::job::{
    decreasing_altitude_order, increasing_priority_order, CapturedFramesMap, CompletionCondition, JobState,
    ObservationJob, StartupCondition, ESTIMATE_UNKNOWN,
};
use crate::sequence::{SequenceSource, UploadMode};
use chrono::{DateTime, Duration, Utc};
use std::time::Duration as StdDuration;
use uuid::Uuid;

/// Constraint-satisfaction attempts per job
pub const MAX_EVALUATION_ATTEMPTS: usize = 10;

/// Search horizon when looking for a time where the job scores positively, minutes
const SCORE_SEARCH_MINS: i64 = 24 * 60;

/// What an evaluation pass produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationOutcome {
    /// The job to execute next
    Selected(Uuid),
    /// Nothing can be scheduled
    NoJob,
    /// Jobs were scheduled but selection was not requested
    EvaluatedOnly,
    /// Aborted jobs were re-queued, evaluate again after the delay
    RetryAfter(StdDuration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub outcome: EvaluationOutcome,
    /// The job list order changed
    pub reordered: bool,
}

/// Result of re-checking a running job
#[derive(Debug, Clone, PartialEq)]
pub enum JobCheck {
    Continue,
    /// Stop the job, leaving it in the given state
    Interrupt { state: JobState, reason: String },
}

/// Change a job state, notifying listeners
pub fn transition(job: &mut ObservationJob, state: JobState, now: DateTime<Utc>, events: &EventSink) {
    if job.set_state(state, now) {
        events.emit(SchedulerEvent::JobStateChanged {
            id: job.id,
            name: job.name.clone(),
            state,
        });
    }
}

/// Tentative placement of a job during overlap resolution
enum Placement {
    Scheduled(DateTime<Utc>),
    Rejected(JobState, String),
    Unresolved,
}

/// Scheduled slot used to detect overlaps
#[derive(Debug, Clone)]
struct Slot {
    name: String,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
}

fn overlaps(
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    other_start: DateTime<Utc>,
    other_end: Option<DateTime<Utc>>,
    lead: Duration,
) -> bool {
    let before_other_ends = other_end.map_or(true, |e| start < e + lead);
    let other_before_this_ends = end.map_or(true, |e| other_start < e + lead);
    before_other_ends && other_before_this_ends
}

// =========================================================================
// EVALUATOR
// =========================================================================

/// Runs evaluation passes over the job queue
pub struct JobEvaluator<'a> {
    settings: &'a SchedulerSettings,
    sequences: &'a dyn SequenceSource,
    now: DateTime<Utc>,
    weather: WeatherStatus,
}

impl<'a> JobEvaluator<'a> {
    pub fn new(settings: &'a SchedulerSettings, sequences: &'a dyn SequenceSource, now: DateTime<Utc>) -> Self {
        Self {
            settings,
            sequences,
            now,
            weather: WeatherStatus::Idle,
        }
    }

    pub fn with_weather(mut self, weather: WeatherStatus) -> Self {
        self.weather = weather;
        self
    }

    pub fn observatory(&self) -> Observatory {
        Observatory::for_night(self.settings.location, self.settings.pre_dawn_mins, &self.now)
            .with_setting_cutoff(self.settings.setting_altitude_cutoff_deg)
    }

    fn lead(&self) -> Duration {
        Duration::seconds(self.settings.lead_time_secs())
    }

    /// One evaluation pass over `jobs`
    pub fn evaluate(
        &self,
        jobs: &mut Vec<ObservationJob>,
        captured: &mut CapturedFramesMap,
        evaluate_only: bool,
        events: &mut EventSink,
    ) -> Evaluation {
        let mut result = Evaluation {
            outcome: EvaluationOutcome::NoJob,
            reordered: false,
        };
        if jobs.is_empty() {
            return result;
        }

        if self.settings.remember_job_progress {
            self.update_completed_counts(jobs, captured, events);
        }
        let obs = self.observatory();

        if let Some(delay) = self.requeue_aborted_jobs(jobs, events) {
            result.outcome = EvaluationOutcome::RetryAfter(delay);
            return result;
        }

        let mut candidates = self.prepare_jobs(jobs, captured, events);
        if candidates.is_empty() {
            tracing::debug!("No job left to evaluate");
            if !evaluate_only {
                events.append_log(self.now, "No jobs left in the scheduler queue after evaluating.");
            }
            return result;
        }

        if self.settings.sort_jobs {
            let reference = jobs[candidates[0]].startup_time.unwrap_or(self.now);
            let location = self.settings.location;
            candidates.sort_by(|&a, &b| decreasing_altitude_order(&jobs[a], &jobs[b], &location, &reference));
            candidates.sort_by(|&a, &b| increasing_priority_order(&jobs[a], &jobs[b]));
        }

        self.resolve_overlaps(jobs, &candidates, &obs, events);
        result.reordered = Self::reorder(jobs, &candidates);
        if result.reordered {
            events.emit(SchedulerEvent::JobListChanged);
        }

        if evaluate_only {
            result.outcome = EvaluationOutcome::EvaluatedOnly;
            return result;
        }

        result.outcome = match self.select_job(jobs, &obs) {
            Some(id) => EvaluationOutcome::Selected(id),
            None => {
                events.append_log(self.now, "No jobs scheduled.");
                EvaluationOutcome::NoJob
            }
        };
        result
    }

    // ===== Step 1: capture counts =====

    fn update_completed_counts(&self, jobs: &mut [ObservationJob], captured: &mut CapturedFramesMap, events: &mut EventSink) {
        let mut fresh = CapturedFramesMap::new();
        for job in jobs.iter_mut() {
            if matches!(job.state(), JobState::Invalid | JobState::Busy) {
                continue;
            }
            let sequence = match self.sequences.load_sequence(&job.sequence_file) {
                Ok(sequence) => sequence,
                Err(e) => {
                    events.append_log(
                        self.now,
                        format!(
                            "Warning: job '{}' has inaccessible sequence '{}', marking invalid.",
                            job.name,
                            job.sequence_file.display()
                        ),
                    );
                    tracing::debug!("Sequence error: {}", e);
                    transition(job, JobState::Invalid, self.now, events);
                    continue;
                }
            };
            for step in &sequence.steps {
                // Files saved on the remote side cannot be counted
                if step.upload_mode == UploadMode::Remote || fresh.contains_key(&step.signature) {
                    continue;
                }
                fresh.insert(step.signature.clone(), self.sequences.count_captured(&step.signature));
            }
            update_light_frames_required(job, &sequence, &fresh);
        }
        for (signature, count) in &fresh {
            tracing::debug!("Captured frames {}: {}", signature, count);
        }
        *captured = fresh;
    }

    // ===== Step 2: filtering =====

    /// Once only aborted or failed jobs remain, put them back into evaluation
    fn requeue_aborted_jobs(&self, jobs: &mut [ObservationJob], events: &mut EventSink) -> Option<StdDuration> {
        if self.settings.error_handling == ErrorHandlingStrategy::DontRestart {
            return None;
        }
        let retryable = |job: &ObservationJob| {
            job.state() == JobState::Aborted || (job.state() == JobState::Error && self.settings.reschedule_errors)
        };
        let only_finished = jobs.iter().all(|j| {
            matches!(
                j.state(),
                JobState::Aborted | JobState::Error | JobState::Invalid | JobState::Complete
            )
        });
        if !only_finished || !jobs.iter().any(retryable) {
            return None;
        }

        events.append_log(
            self.now,
            "Only aborted jobs left in the scheduler queue after evaluating, rescheduling those.",
        );
        for job in jobs.iter_mut().filter(|j| retryable(j)) {
            transition(job, JobState::Evaluation, self.now, events);
        }

        let delay = self.settings.error_handling_delay();
        if self.settings.error_handling == ErrorHandlingStrategy::RestartAfterTermination && !delay.is_zero() {
            events.append_log(
                self.now,
                format!("Waiting {} seconds to restart aborted jobs.", delay.as_secs()),
            );
            return Some(delay);
        }
        None
    }

    /// Indices of the jobs taking part in this pass, all left in EVALUATION
    fn prepare_jobs(
        &self,
        jobs: &mut [ObservationJob],
        captured: &CapturedFramesMap,
        events: &mut EventSink,
    ) -> Vec<usize> {
        let mut candidates = Vec::new();
        for (index, job) in jobs.iter_mut().enumerate() {
            match job.state() {
                JobState::Invalid | JobState::Complete | JobState::Busy => continue,
                JobState::Error if !self.settings.reschedule_errors => continue,
                JobState::Aborted | JobState::Error => {
                    if self.settings.error_handling != ErrorHandlingStrategy::RestartImmediately {
                        continue;
                    }
                }
                JobState::Idle | JobState::Evaluation | JobState::Scheduled => {}
            }

            if let CompletionCondition::At { time } = job.completion_condition() {
                if time <= self.now {
                    events.append_log(
                        self.now,
                        format!(
                            "Job '{}' completion time {} has already passed, skipping.",
                            job.name,
                            time.format("%Y-%m-%d %H:%M:%S")
                        ),
                    );
                    transition(job, JobState::Idle, self.now, events);
                    continue;
                }
            }

            if matches!(job.completion_condition(), CompletionCondition::Repeat { .. }) && job.repeats_remaining == 0 {
                events.append_log(self.now, format!("Job '{}' has no more batches remaining.", job.name));
                if !self.settings.remember_job_progress {
                    job.estimated_time = 0;
                    transition(job, JobState::Complete, self.now, events);
                    continue;
                }
            }

            // Working startup condition goes back to what the user asked for
            job.set_startup_condition(job.file_startup_condition);
            job.estimated_time = ESTIMATE_UNKNOWN;
            if let Err(e) = estimate_job_time(job, self.sequences, captured, self.settings, self.now, events) {
                events.append_log(
                    self.now,
                    format!("Warning: job '{}' has an invalid sequence, marking invalid: {}", job.name, e),
                );
                transition(job, JobState::Invalid, self.now, events);
                continue;
            }

            if job.estimated_time == 0 {
                job.repeats_remaining = 0;
                events.append_log(self.now, format!("Job '{}' has no more captures to take, marking complete.", job.name));
                transition(job, JobState::Complete, self.now, events);
                continue;
            }

            transition(job, JobState::Evaluation, self.now, events);
            candidates.push(index);
        }
        candidates
    }

    // ===== Step 5: overlap resolution =====

    fn resolve_overlaps(
        &self,
        jobs: &mut [ObservationJob],
        candidates: &[usize],
        obs: &Observatory,
        events: &mut EventSink,
    ) {
        // Running jobs keep their slot
        let mut slots: Vec<Slot> = jobs
            .iter()
            .filter(|j| j.state() == JobState::Busy)
            .filter_map(|j| {
                j.startup_time.map(|start| Slot {
                    name: j.name.clone(),
                    start,
                    end: j.completion_time(),
                })
            })
            .collect();

        for (position, &index) in candidates.iter().enumerate() {
            let next_fixed = candidates.get(position + 1).and_then(|&n| match jobs[n].startup_condition {
                StartupCondition::At { time } => Some(Slot {
                    name: jobs[n].name.clone(),
                    start: time,
                    end: jobs[n].completion_time(),
                }),
                _ => None,
            });

            let placement = self.place_job(&jobs[index], &slots, next_fixed.as_ref(), obs);
            let job = &mut jobs[index];
            match placement {
                Placement::Scheduled(start) => {
                    job.startup_time = Some(start);
                    job.score = total_score(job, obs, &start);
                    job.altitude_at_startup = Some(job.altitude_at(&obs.location, &start));
                    job.setting_at_startup = job.is_setting_at(&obs.location, &start);
                    job.lead_time = slots
                        .iter()
                        .filter_map(|s| s.end)
                        .filter(|end| *end <= start)
                        .max()
                        .map_or(0, |end| (start - end).num_seconds());
                    tracing::info!(
                        "Job '{}' scheduled at {} with score {}",
                        job.name,
                        start.format("%Y-%m-%d %H:%M:%S"),
                        job.score
                    );
                    transition(job, JobState::Scheduled, self.now, events);
                    slots.push(Slot {
                        name: job.name.clone(),
                        start,
                        end: job.completion_time(),
                    });
                }
                Placement::Rejected(state, reason) => {
                    events.append_log(self.now, reason);
                    job.score = BAD_SCORE;
                    transition(job, state, self.now, events);
                }
                Placement::Unresolved => {
                    events.append_log(
                        self.now,
                        format!(
                            "Job '{}' could not be scheduled after {} attempts, marking invalid.",
                            job.name, MAX_EVALUATION_ATTEMPTS
                        ),
                    );
                    job.score = BAD_SCORE;
                    transition(job, JobState::Invalid, self.now, events);
                }
            }
        }
    }

    fn place_job(&self, job: &ObservationJob, slots: &[Slot], next_fixed: Option<&Slot>, obs: &Observatory) -> Placement {
        let lead = self.lead();
        let fmt = |t: &DateTime<Utc>| t.format("%Y-%m-%d %H:%M:%S").to_string();
        let fixed = match job.startup_condition {
            StartupCondition::At { time } => Some(time),
            _ => None,
        };
        let mut start = fixed.unwrap_or(self.now);
        let duration = match job.completion_condition() {
            CompletionCondition::At { .. } => None,
            _ if job.estimated_time >= 0 => Some(Duration::seconds(job.estimated_time)),
            _ => None,
        };
        let end_of = |start: DateTime<Utc>| match job.completion_condition() {
            CompletionCondition::At { time } => Some(time),
            CompletionCondition::Loop => None,
            _ => duration.map(|d| start + d),
        };

        for _ in 0..MAX_EVALUATION_ATTEMPTS {
            // (a) fixed startup
            if let Some(time) = fixed {
                if time + lead < self.now {
                    return Placement::Rejected(
                        JobState::Invalid,
                        format!(
                            "Job '{}' has fixed startup time {} set in the past, marking invalid.",
                            job.name,
                            fmt(&time)
                        ),
                    );
                }
                if job.light_frames_required {
                    if let Some(reason) = self.fixed_startup_violation(job, obs, &time) {
                        return Placement::Rejected(JobState::Invalid, reason);
                    }
                }
            }

            // (b) previously scheduled jobs
            let end = end_of(start);
            if let Some(slot) = slots.iter().find(|s| overlaps(start, end, s.start, s.end, lead)) {
                if fixed.is_some() {
                    return Placement::Rejected(
                        JobState::Invalid,
                        format!(
                            "Job '{}' has fixed startup time {} overlapping job '{}', marking invalid.",
                            job.name,
                            fmt(&start),
                            slot.name
                        ),
                    );
                }
                match slot.end {
                    Some(slot_end) => {
                        tracing::debug!("Job '{}' pushed after job '{}'", job.name, slot.name);
                        start = slot_end + lead;
                        continue;
                    }
                    None => {
                        return Placement::Rejected(
                            JobState::Aborted,
                            format!(
                                "Job '{}' cannot start after job '{}' which has no completion time, marking aborted.",
                                job.name, slot.name
                            ),
                        )
                    }
                }
            }

            if job.light_frames_required {
                // (c) daylight
                if job.constraints.enforce_twilight && dark_sky_score(obs, &start) < 0 {
                    match obs.twilight.next_dusk(&obs.location, &start) {
                        Some(dusk) => {
                            // One minute past the boundary so the darkness check passes
                            let dusk = dusk.max(start) + Duration::minutes(1);
                            tracing::debug!("Job '{}' deferred to dusk at {}", job.name, fmt(&dusk));
                            start = dusk;
                            continue;
                        }
                        None => {
                            return Placement::Rejected(
                                JobState::Invalid,
                                format!("Job '{}' requires darkness but the sky never gets dark, marking invalid.", job.name),
                            )
                        }
                    }
                }
            }

            // (d) culmination
            if job.is_culmination() {
                match job.calculate_culmination(&obs.location, &start) {
                    Some(culmination) if culmination > start => {
                        start = culmination;
                        continue;
                    }
                    Some(_) => {}
                    None => {
                        return Placement::Rejected(
                            JobState::Invalid,
                            format!("Job '{}' target does not culminate above the horizon, marking invalid.", job.name),
                        )
                    }
                }
            }

            if job.light_frames_required {
                // (e) altitude and Moon constraints
                match job.calculate_altitude_time(&obs.location, &start) {
                    Some(t) if t > start => {
                        start = t;
                        continue;
                    }
                    Some(_) => {}
                    None => return Placement::Rejected(JobState::Invalid, self.constraint_message(job, obs, &start)),
                }

                // Horizon and setting cutoff, twilight buffer
                let score = total_score(job, obs, &start);
                if score < 0 {
                    match self.next_positive_score(job, obs, &start) {
                        Some(t) => {
                            start = t;
                            continue;
                        }
                        None => {
                            return Placement::Rejected(
                                JobState::Invalid,
                                format!(
                                    "Job '{}' has no time within the next day where its constraints are satisfied (score {}), marking invalid.",
                                    job.name, score
                                ),
                            )
                        }
                    }
                }
            }

            // (f) fixed job right after this one
            if let Some(next) = next_fixed {
                if overlaps(start, end_of(start), next.start, next.end, lead) {
                    return Placement::Rejected(
                        JobState::Aborted,
                        format!(
                            "Job '{}' would overlap fixed job '{}' starting at {}, marking aborted.",
                            job.name,
                            next.name,
                            fmt(&next.start)
                        ),
                    );
                }
            }

            // (g) completion before startup
            if let CompletionCondition::At { time } = job.completion_condition() {
                if time <= start {
                    return Placement::Rejected(
                        JobState::Invalid,
                        format!(
                            "Job '{}' completion time {} precedes its startup time {}, marking invalid.",
                            job.name,
                            fmt(&time),
                            fmt(&start)
                        ),
                    );
                }
            }

            // (h) weather
            let weather = weather_score(job.constraints.enforce_weather, self.weather);
            if weather < 0 {
                return Placement::Rejected(
                    JobState::Aborted,
                    format!("Job '{}' requires good weather, marking aborted.", job.name),
                );
            }

            return Placement::Scheduled(start);
        }
        Placement::Unresolved
    }

    fn fixed_startup_violation(&self, job: &ObservationJob, obs: &Observatory, time: &DateTime<Utc>) -> Option<String> {
        let fmt = time.format("%Y-%m-%d %H:%M:%S");
        if job.constraints.enforce_twilight && dark_sky_score(obs, time) < 0 {
            return Some(format!(
                "Job '{}' has fixed startup time {} outside of the dark sky window, marking invalid.",
                job.name, fmt
            ));
        }
        if !job.constraints_hold_at(obs, time) || altitude_score(job, obs, time) < 0 {
            return Some(self.constraint_message(job, obs, time).replace(
                "marking invalid",
                &format!("at fixed startup time {}, marking invalid", fmt),
            ));
        }
        if moon_separation_score(job, obs, time) < 0 {
            return Some(format!(
                "Job '{}' is too close to the Moon at fixed startup time {}, marking invalid.",
                job.name, fmt
            ));
        }
        None
    }

    /// Names the constraint that cannot be met
    fn constraint_message(&self, job: &ObservationJob, obs: &Observatory, t: &DateTime<Utc>) -> String {
        let altitude = job.altitude_at(&obs.location, t);
        match (job.constraints.min_altitude, job.constraints.min_moon_separation) {
            (Some(min), _) if altitude < min || job.constraints.min_moon_separation.is_none() => format!(
                "Job '{}' altitude constraint of {:.1} degrees cannot be met (current altitude {:.1} degrees), marking invalid.",
                job.name, min, altitude
            ),
            (_, Some(min)) => format!(
                "Job '{}' Moon separation constraint of {:.1} degrees cannot be met, marking invalid.",
                job.name, min
            ),
            _ => format!(
                "Job '{}' target stays below the horizon (current altitude {:.1} degrees), marking invalid.",
                job.name, altitude
            ),
        }
    }

    fn next_positive_score(&self, job: &ObservationJob, obs: &Observatory, from: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        (1..=SCORE_SEARCH_MINS)
            .map(|m| *from + Duration::minutes(m))
            .find(|t| total_score(job, obs, t) >= 0)
    }

    // ===== Steps 6 to 8 =====

    /// Put the evaluated jobs back in their slots, scheduled ones by startup time
    fn reorder(jobs: &mut Vec<ObservationJob>, candidates: &[usize]) -> bool {
        let mut slots: Vec<usize> = candidates.to_vec();
        slots.sort_unstable();

        let mut ordered: Vec<usize> = candidates.to_vec();
        ordered.sort_by_key(|&i| match jobs[i].state() {
            JobState::Scheduled => (0, jobs[i].startup_time),
            _ => (1, None),
        });

        if ordered == slots {
            return false;
        }

        let mut taken: Vec<Option<ObservationJob>> = std::mem::take(jobs).into_iter().map(Some).collect();
        let moved: Vec<ObservationJob> = ordered.iter().filter_map(|&i| taken[i].take()).collect();
        for (slot, job) in slots.iter().zip(moved) {
            taken[*slot] = Some(job);
        }
        *jobs = taken.into_iter().flatten().collect();
        true
    }

    fn select_job(&self, jobs: &mut [ObservationJob], obs: &Observatory) -> Option<Uuid> {
        let job = jobs.iter_mut().find(|j| j.state() == JobState::Scheduled)?;
        if job.startup_condition == StartupCondition::Asap {
            let score: Score = total_score(job, obs, &self.now);
            if score >= 0 && job.startup_time.map_or(true, |t| t > self.now) {
                tracing::debug!("Job '{}' can start right now", job.name);
                job.startup_time = Some(self.now);
            }
        }
        Some(job.id)
    }

    // ===== Running job =====

    /// Re-check the constraints of the running job at `now`
    pub fn check_job(&self, job: &ObservationJob) -> JobCheck {
        let obs = self.observatory();
        let now = self.now;
        let fmt = |t: &DateTime<Utc>| t.format("%Y-%m-%d %H:%M:%S").to_string();

        if let CompletionCondition::At { time } = job.completion_condition() {
            if time <= now {
                return JobCheck::Interrupt {
                    state: JobState::Complete,
                    reason: format!("Job '{}' reached completion time {}, stopping.", job.name, fmt(&time)),
                };
            }
        }

        if !job.light_frames_required {
            return JobCheck::Continue;
        }

        if let Some(min) = job.constraints.min_altitude {
            let altitude = job.altitude_at(&obs.location, &now);
            if altitude < min {
                return JobCheck::Interrupt {
                    state: JobState::Aborted,
                    reason: format!(
                        "Job '{}' current altitude ({:.1} degrees) crossed minimum constraint altitude ({:.1} degrees), marking aborted.",
                        job.name, altitude, min
                    ),
                };
            }
        }

        if job.constraints.min_moon_separation.is_some() && moon_separation_score(job, &obs, &now) < 0 {
            return JobCheck::Interrupt {
                state: JobState::Aborted,
                reason: format!(
                    "Job '{}' is now closer to the Moon than its minimum separation, marking aborted.",
                    job.name
                ),
            };
        }

        if job.constraints.enforce_twilight && dark_sky_score(&obs, &now) < 0 {
            return JobCheck::Interrupt {
                state: JobState::Aborted,
                reason: format!(
                    "Job '{}' is now approaching astronomical twilight rise limit ({} minutes safety margin), marking aborted.",
                    job.name, self.settings.pre_dawn_mins
                ),
            };
        }

        if weather_score(job.constraints.enforce_weather, self.weather) <= BAD_SCORE {
            return JobCheck::Interrupt {
                state: JobState::Aborted,
                reason: format!("Job '{}' is aborted due to a weather alert.", job.name),
            };
        }

        JobCheck::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::astro::SkyPoint;
    use crate::config::GeoLocation;
    use crate::job::{JobConstraints, StepPipeline};
    use crate::sequence::{CaptureSequence, MemorySequenceSource, SequenceStep};
    use chrono::TimeZone;

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            location: GeoLocation {
                latitude: 37.0 + 26.0 / 60.0 + 30.0 / 3600.0,
                longitude: -(122.0 + 10.0 / 60.0),
                utc_offset_hours: -7.0,
            },
            remember_job_progress: false,
            sort_jobs: false,
            ..SchedulerSettings::default()
        }
    }

    /// 00:00:01 local time, deep in the night
    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 4, 17, 7, 0, 1).unwrap()
    }

    fn source() -> MemorySequenceSource {
        let source = MemorySequenceSource::new();
        source.insert(
            "/seq/3x60.json",
            CaptureSequence::new(vec![SequenceStep::light("/data/a/Light", 60.0, 3)]),
        );
        source.insert(
            "/seq/30x60.json",
            CaptureSequence::new(vec![SequenceStep::light("/data/b/Light", 60.0, 30)]),
        );
        source
    }

    fn zenith_job(name: &str, sequence: &str) -> ObservationJob {
        ObservationJob::new(name, SkyPoint::from_degrees(188.2, 37.56))
            .with_sequence(sequence)
            .with_steps(StepPipeline::NONE)
    }

    fn evaluate(jobs: &mut Vec<ObservationJob>, settings: &SchedulerSettings, source: &MemorySequenceSource) -> Evaluation {
        let mut events = EventSink::new(100);
        let mut captured = CapturedFramesMap::new();
        JobEvaluator::new(settings, source, now()).evaluate(jobs, &mut captured, false, &mut events)
    }

    fn scheduled_pairs_respect_lead(jobs: &[ObservationJob], lead: i64) -> bool {
        let mut scheduled: Vec<&ObservationJob> = jobs.iter().filter(|j| j.state() == JobState::Scheduled).collect();
        scheduled.sort_by_key(|j| j.startup_time);
        scheduled.windows(2).all(|w| match (w[0].completion_time(), w[1].startup_time) {
            (Some(end), Some(start)) => end + Duration::seconds(lead) <= start,
            _ => false,
        })
    }

    #[test]
    fn test_single_asap_job() {
        let settings = settings();
        let source = source();
        let mut jobs = vec![zenith_job("A", "/seq/3x60.json")];

        let evaluation = evaluate(&mut jobs, &settings, &source);
        assert_eq!(evaluation.outcome, EvaluationOutcome::Selected(jobs[0].id));
        assert_eq!(jobs[0].state(), JobState::Scheduled);
        assert_eq!(jobs[0].estimated_time, 180);
        assert_eq!(jobs[0].startup_time, Some(now()));
    }

    #[test]
    fn test_asap_before_fixed_job() {
        let settings = settings();
        let source = source();
        let fixed = now() + Duration::hours(1);
        let mut jobs = vec![
            zenith_job("B", "/seq/3x60.json"),
            zenith_job("A", "/seq/30x60.json").with_startup(StartupCondition::At { time: fixed }),
        ];

        evaluate(&mut jobs, &settings, &source);
        let b = jobs.iter().find(|j| j.name == "B").unwrap();
        let a = jobs.iter().find(|j| j.name == "A").unwrap();
        assert_eq!(b.state(), JobState::Scheduled);
        assert_eq!(b.startup_time, Some(now()));
        assert_eq!(a.state(), JobState::Scheduled);
        assert_eq!(a.startup_time, Some(fixed));
        assert!(scheduled_pairs_respect_lead(&jobs, settings.lead_time_secs()));
    }

    #[test]
    fn test_asap_overlapping_fixed_job_is_aborted() {
        let settings = settings();
        let source = source();
        // B needs 30 minutes but A starts in 10
        let fixed = now() + Duration::minutes(10);
        let mut jobs = vec![
            zenith_job("B", "/seq/30x60.json"),
            zenith_job("A", "/seq/3x60.json").with_startup(StartupCondition::At { time: fixed }),
        ];

        evaluate(&mut jobs, &settings, &source);
        let b = jobs.iter().find(|j| j.name == "B").unwrap();
        let a = jobs.iter().find(|j| j.name == "A").unwrap();
        assert_eq!(b.state(), JobState::Aborted);
        assert_eq!(a.state(), JobState::Scheduled);
        assert_eq!(a.startup_time, Some(fixed));
    }

    #[test]
    fn test_identical_fixed_startups() {
        let settings = settings();
        let source = source();
        let fixed = now() + Duration::minutes(30);
        let mut jobs: Vec<ObservationJob> = ["J1", "J2", "J3"]
            .iter()
            .map(|n| zenith_job(n, "/seq/3x60.json").with_startup(StartupCondition::At { time: fixed }))
            .collect();

        evaluate(&mut jobs, &settings, &source);
        let at_fixed = jobs
            .iter()
            .filter(|j| j.state() == JobState::Scheduled && j.startup_time == Some(fixed))
            .count();
        assert_eq!(at_fixed, 1);
        assert!(jobs
            .iter()
            .filter(|j| j.state() != JobState::Scheduled)
            .all(|j| matches!(j.state(), JobState::Aborted | JobState::Invalid)));
    }

    #[test]
    fn test_sequential_asap_jobs_respect_lead_time() {
        let settings = settings();
        let source = source();
        let mut jobs = vec![
            zenith_job("A", "/seq/3x60.json"),
            zenith_job("B", "/seq/3x60.json"),
            zenith_job("C", "/seq/3x60.json"),
        ];

        evaluate(&mut jobs, &settings, &source);
        assert!(jobs.iter().all(|j| j.state() == JobState::Scheduled));
        assert!(scheduled_pairs_respect_lead(&jobs, settings.lead_time_secs()));
        assert_eq!(jobs[1].startup_time, Some(now() + Duration::seconds(180 + 300)));
        assert_eq!(jobs[1].lead_time, 300);
    }

    #[test]
    fn test_unreachable_altitude_is_invalid() {
        let settings = settings();
        let source = source();
        let mut events = EventSink::new(100);
        let mut captured = CapturedFramesMap::new();
        // Culminates near 40 degrees at this latitude
        let mut jobs = vec![ObservationJob::new("low", SkyPoint::new(12.0, -12.5))
            .with_sequence("/seq/3x60.json")
            .with_steps(StepPipeline::NONE)
            .with_constraints(JobConstraints {
                min_altitude: Some(80.0),
                ..JobConstraints::default()
            })];

        JobEvaluator::new(&settings, &source, now()).evaluate(&mut jobs, &mut captured, false, &mut events);
        assert_eq!(jobs[0].state(), JobState::Invalid);
        assert!(events.log().contains("altitude constraint of 80.0 degrees"));
    }

    #[test]
    fn test_daylight_defers_to_dusk() {
        let settings = settings();
        let source = source();
        // Local noon
        let noon = Utc.with_ymd_and_hms(2021, 4, 17, 19, 0, 0).unwrap();
        let mut events = EventSink::new(100);
        let mut captured = CapturedFramesMap::new();
        let mut jobs = vec![ObservationJob::new("polaris", SkyPoint::new(2.53, 89.26))
            .with_sequence("/seq/3x60.json")
            .with_steps(StepPipeline::NONE)
            .with_constraints(JobConstraints {
                enforce_twilight: true,
                ..JobConstraints::default()
            })];

        let evaluator = JobEvaluator::new(&settings, &source, noon);
        evaluator.evaluate(&mut jobs, &mut captured, false, &mut events);
        assert_eq!(jobs[0].state(), JobState::Scheduled);
        let start = jobs[0].startup_time.unwrap();
        assert!(start > noon + Duration::hours(6));
        assert!(dark_sky_score(&evaluator.observatory(), &start) >= 0);
    }

    #[test]
    fn test_evaluation_is_idempotent() {
        let settings = settings();
        let source = source();
        let fixed = now() + Duration::hours(2);
        let mut jobs = vec![
            zenith_job("A", "/seq/3x60.json"),
            zenith_job("B", "/seq/30x60.json").with_startup(StartupCondition::At { time: fixed }),
            zenith_job("C", "/seq/30x60.json"),
        ];

        let first = evaluate(&mut jobs, &settings, &source);
        let snapshot: Vec<_> = jobs.iter().map(|j| (j.id, j.state(), j.startup_time)).collect();
        let second = evaluate(&mut jobs, &settings, &source);
        let again: Vec<_> = jobs.iter().map(|j| (j.id, j.state(), j.startup_time)).collect();

        assert_eq!(first.outcome, second.outcome);
        assert_eq!(snapshot, again);
        assert!(!second.reordered);
    }

    #[test]
    fn test_reset_round_trip() {
        let settings = settings();
        let source = source();
        let mut jobs = vec![zenith_job("A", "/seq/3x60.json"), zenith_job("B", "/seq/3x60.json")];

        evaluate(&mut jobs, &settings, &source);
        let before: Vec<_> = jobs.iter().map(|j| (j.id, j.state(), j.startup_time)).collect();
        for job in &mut jobs {
            job.reset();
        }
        evaluate(&mut jobs, &settings, &source);
        let after: Vec<_> = jobs.iter().map(|j| (j.id, j.state(), j.startup_time)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_priority_sort() {
        let mut settings = settings();
        settings.sort_jobs = true;
        let source = source();
        let mut jobs = vec![
            zenith_job("later", "/seq/3x60.json").with_priority(20),
            zenith_job("first", "/seq/3x60.json").with_priority(1),
        ];

        let evaluation = evaluate(&mut jobs, &settings, &source);
        assert!(evaluation.reordered);
        assert_eq!(jobs[0].name, "first");
        assert_eq!(evaluation.outcome, EvaluationOutcome::Selected(jobs[0].id));
    }

    #[test]
    fn test_missing_sequence_is_invalid() {
        let settings = settings();
        let source = source();
        let mut jobs = vec![zenith_job("A", "/seq/missing.json")];

        let evaluation = evaluate(&mut jobs, &settings, &source);
        assert_eq!(jobs[0].state(), JobState::Invalid);
        assert_eq!(evaluation.outcome, EvaluationOutcome::NoJob);
    }

    #[test]
    fn test_evaluate_only() {
        let settings = settings();
        let source = source();
        let mut events = EventSink::new(100);
        let mut captured = CapturedFramesMap::new();
        let mut jobs = vec![zenith_job("A", "/seq/3x60.json")];

        let evaluation =
            JobEvaluator::new(&settings, &source, now()).evaluate(&mut jobs, &mut captured, true, &mut events);
        assert_eq!(evaluation.outcome, EvaluationOutcome::EvaluatedOnly);
        assert_eq!(jobs[0].state(), JobState::Scheduled);
    }

    #[test]
    fn test_aborted_jobs_requeued_after_termination() {
        let mut settings = settings();
        settings.error_handling = ErrorHandlingStrategy::RestartAfterTermination;
        settings.error_handling_delay_secs = 30;
        let source = source();
        let mut jobs = vec![zenith_job("A", "/seq/3x60.json")];
        jobs[0].set_state(JobState::Aborted, now());

        let evaluation = evaluate(&mut jobs, &settings, &source);
        assert_eq!(evaluation.outcome, EvaluationOutcome::RetryAfter(StdDuration::from_secs(30)));
        assert_eq!(jobs[0].state(), JobState::Evaluation);

        let evaluation = evaluate(&mut jobs, &settings, &source);
        assert_eq!(evaluation.outcome, EvaluationOutcome::Selected(jobs[0].id));
    }

    #[test]
    fn test_dont_restart_skips_aborted() {
        let mut settings = settings();
        settings.error_handling = ErrorHandlingStrategy::DontRestart;
        let source = source();
        let mut jobs = vec![zenith_job("A", "/seq/3x60.json")];
        jobs[0].set_state(JobState::Aborted, now());

        let evaluation = evaluate(&mut jobs, &settings, &source);
        assert_eq!(evaluation.outcome, EvaluationOutcome::NoJob);
        assert_eq!(jobs[0].state(), JobState::Aborted);
    }

    #[test]
    fn test_check_job() {
        let settings = settings();
        let source = source();
        let evaluator = JobEvaluator::new(&settings, &source, now());

        let mut job = zenith_job("A", "/seq/3x60.json");
        job.light_frames_required = true;
        assert_eq!(evaluator.check_job(&job), JobCheck::Continue);

        job.constraints.min_altitude = Some(89.9);
        assert!(matches!(
            evaluator.check_job(&job),
            JobCheck::Interrupt { state: JobState::Aborted, .. }
        ));

        job.constraints.min_altitude = None;
        job.set_completion_condition(CompletionCondition::At { time: now() - Duration::minutes(1) });
        assert!(matches!(
            evaluator.check_job(&job),
            JobCheck::Interrupt { state: JobState::Complete, .. }
        ));
    }

    #[test]
    fn test_weather_alert_blocks_scheduling() {
        let settings = settings();
        let source = source();
        let mut events = EventSink::new(100);
        let mut captured = CapturedFramesMap::new();
        let mut jobs = vec![zenith_job("A", "/seq/3x60.json").with_constraints(JobConstraints {
            enforce_weather: true,
            ..JobConstraints::default()
        })];

        JobEvaluator::new(&settings, &source, now())
            .with_weather(WeatherStatus::Alert)
            .evaluate(&mut jobs, &mut captured, false, &mut events);
        assert_eq!(jobs[0].state(), JobState::Aborted);
    }
}
