//! Execution state machine
//!
//! A [`SchedulerProcess`] owns the job queue, the session state and the
//! device modules. The runner calls [`SchedulerProcess::run_iteration`] on a
//! timer; each iteration performs one bounded step and schedules the next.
//! Nothing here blocks: an operation that is not finished yet returns and is
//! checked again on a later iteration.

use crate::clock::SharedClock;
use crate::config::{ErrorHandlingStrategy, SchedulerSettings};
use crate::device::{methods, props, DeviceModules, ModuleKind, WeatherStatus};
use crate::engine::{transition, EvaluationOutcome, JobEvaluator};
use crate::estimate::{calculate_expected_captures, captured_counts, fill_captured_frames_map};
use crate::events::{EventSink, LogBuffer, SchedulerEvent};
use crate::job::{CapturedFramesMap, CompletionCondition, JobStage, JobState, ObservationJob, StepPipeline};
use crate::script::RunningScript;
use crate::sequence::{SharedSequenceSource, UploadMode};
use crate::session::{
    EkosState, IndiState, ParkWaitState, SchedulerState, SessionState, ShutdownState, StartupState, TimerState,
};
use crate::sleep::{plan_sleep, wakeup_interval_ms, SleepContext, SleepDecision};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Upper bound on chained follow-up actions within one iteration
const MAX_FOLLOW_UPS: usize = 16;

/// What has to happen once a pipeline action or status handler returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FollowUp {
    Done,
    /// Proceed to the next pipeline stage of the active job
    NextAction,
    /// The active job is finished one way or another
    FindNextJob,
}

/// The observation scheduler
pub struct SchedulerProcess {
    pub(crate) settings: SchedulerSettings,
    pub(crate) jobs: Vec<ObservationJob>,
    pub(crate) active_job: Option<Uuid>,
    pub(crate) session: SessionState,
    pub(crate) modules: DeviceModules,
    pub(crate) clock: SharedClock,
    pub(crate) sequences: SharedSequenceSource,
    pub(crate) events: EventSink,
    pub(crate) captured: CapturedFramesMap,
    pub(crate) script: Option<RunningScript>,
    /// The job list changed since it was last saved
    pub(crate) dirty: bool,
}

impl SchedulerProcess {
    pub fn new(
        settings: SchedulerSettings,
        modules: DeviceModules,
        clock: SharedClock,
        sequences: SharedSequenceSource,
    ) -> Self {
        let events = EventSink::new(settings.log_capacity);
        Self {
            settings,
            jobs: Vec::new(),
            active_job: None,
            session: SessionState::new(),
            modules,
            clock,
            sequences,
            events,
            captured: CapturedFramesMap::new(),
            script: None,
            dirty: false,
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn state(&self) -> SchedulerState {
        self.session.scheduler
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Replace the settings; only possible while the scheduler is idle
    pub fn set_settings(&mut self, settings: SchedulerSettings) -> bool {
        if self.session.scheduler != SchedulerState::Idle {
            return false;
        }
        self.settings = settings;
        true
    }

    pub fn jobs(&self) -> &[ObservationJob] {
        &self.jobs
    }

    pub fn job(&self, id: Uuid) -> Option<&ObservationJob> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub(crate) fn job_mut(&mut self, id: Uuid) -> Option<&mut ObservationJob> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    pub fn active_job(&self) -> Option<&ObservationJob> {
        self.active_job.and_then(|id| self.job(id))
    }

    pub fn log(&self) -> &LogBuffer {
        self.events.log()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn modules_mut(&mut self) -> &mut DeviceModules {
        &mut self.modules
    }

    // =========================================================================
    // JOB LIST
    // =========================================================================

    pub fn add_job(&mut self, job: ObservationJob) -> Uuid {
        let id = job.id;
        tracing::info!("Adding job '{}'", job.name);
        self.jobs.push(job);
        self.dirty = true;
        self.events.emit(SchedulerEvent::JobListChanged);
        id
    }

    /// Remove a job; the running job cannot be removed
    pub fn remove_job(&mut self, id: Uuid) -> bool {
        if self.active_job == Some(id) && self.session.scheduler != SchedulerState::Idle {
            return false;
        }
        let before = self.jobs.len();
        self.jobs.retain(|j| j.id != id);
        if self.jobs.len() == before {
            return false;
        }
        if self.active_job == Some(id) {
            self.active_job = None;
        }
        self.dirty = true;
        self.events.emit(SchedulerEvent::JobListChanged);
        true
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    pub(crate) fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    pub(crate) fn append_log(&mut self, message: impl Into<String>) {
        let now = self.clock.now();
        self.events.append_log(now, message);
    }

    pub(crate) fn set_job_state(&mut self, id: Uuid, state: JobState) {
        let now = self.clock.now();
        if let Some(job) = self.jobs.iter_mut().find(|j| j.id == id) {
            transition(job, state, now, &self.events);
        }
    }

    pub(crate) fn set_active_state(&mut self, state: JobState) {
        if let Some(id) = self.active_job {
            self.set_job_state(id, state);
        }
    }

    pub(crate) fn set_stage(&mut self, stage: JobStage) {
        if let Some(id) = self.active_job {
            if let Some(job) = self.job_mut(id) {
                tracing::debug!("Job '{}' stage {:?} -> {:?}", job.name, job.stage, stage);
                job.stage = stage;
            }
        }
    }

    pub(crate) fn active_stage(&self) -> Option<JobStage> {
        self.active_job().map(|j| j.stage)
    }

    pub(crate) fn active_name(&self) -> String {
        self.active_job().map(|j| j.name.clone()).unwrap_or_default()
    }

    pub(crate) fn active_uses(&self, step: StepPipeline) -> bool {
        self.active_job().map_or(false, |j| j.steps.contains(step))
    }

    pub(crate) fn set_scheduler_state(&mut self, state: SchedulerState) {
        if self.session.scheduler != state {
            tracing::info!("Scheduler state {} -> {}", self.session.scheduler, state);
            self.session.scheduler = state;
            self.events.emit(SchedulerEvent::StateChanged(state));
        }
    }

    /// Simulated milliseconds converted to a real timer interval
    pub(crate) fn scaled_ms(&self, ms: i64) -> i64 {
        let scale = self.clock.scale();
        let scale = if scale.is_finite() && scale > 0.0 { scale } else { 1.0 };
        (ms as f64 / scale).round() as i64
    }

    pub(crate) fn setup_next_iteration(&mut self, state: TimerState) {
        let period = self.settings.update_period_ms as i64;
        self.session.setup_next_iteration(state, period);
    }

    /// Fire a command whose failure only matters to the log
    pub(crate) async fn call_quietly(&self, kind: ModuleKind, method: &str, args: &[Value]) {
        if let Err(e) = self.modules.call(kind, method, args).await {
            tracing::warn!("{}.{} failed: {}", kind, method, e);
        }
    }

    fn mark_with_duplicates(&mut self, id: Uuid, state: JobState) {
        let Some(active) = self.job(id).cloned() else {
            return;
        };
        let now = self.clock.now();
        for job in self.jobs.iter_mut() {
            if job.id == id || job.is_duplicate_of(&active) {
                transition(job, state, now, &self.events);
            }
        }
    }

    /// Whether captures of this job are visible locally
    fn can_count_captures(&self, id: Uuid) -> bool {
        let Some(job) = self.job(id) else {
            return false;
        };
        match self.sequences.load_sequence(&job.sequence_file) {
            Ok(sequence) => sequence.steps.iter().all(|s| s.upload_mode != UploadMode::Remote),
            Err(_) => false,
        }
    }

    /// Iterations already on disk, from the least advanced signature
    fn remembered_iterations(&self, job: &ObservationJob) -> Option<u32> {
        let sequence = self.sequences.load_sequence(&job.sequence_file).ok()?;
        let mut captured = CapturedFramesMap::new();
        captured_counts(self.sequences.as_ref(), &sequence, &mut captured);
        let (expected, _) = calculate_expected_captures(&sequence);
        Some(fill_captured_frames_map(&expected, &captured, job, true).completed_iterations)
    }

    pub(crate) async fn run_follow_ups(&mut self, mut next: FollowUp) {
        for _ in 0..MAX_FOLLOW_UPS {
            next = match next {
                FollowUp::Done => return,
                FollowUp::NextAction => self.get_next_action().await,
                FollowUp::FindNextJob => self.find_next_job().await,
            };
        }
        if next != FollowUp::Done {
            tracing::warn!("Dropping follow-up {:?} after {} chained actions", next, MAX_FOLLOW_UPS);
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Start the scheduler, or resume it when paused
    pub async fn start_scheduler(&mut self) {
        match self.session.scheduler {
            SchedulerState::Idle => {
                let procedure = &self.settings.procedure;
                let invalid = [("startup", &procedure.startup_script), ("shutdown", &procedure.shutdown_script)]
                    .into_iter()
                    .find_map(|(kind, script)| match script {
                        Some(path) if !path.exists() => Some(format!(
                            "Warning: {} script {} is not valid.",
                            kind,
                            path.display()
                        )),
                        _ => None,
                    });
                if let Some(message) = invalid {
                    self.append_log(message);
                    return;
                }

                tracing::info!("Scheduler is starting...");
                let remember = self.settings.remember_job_progress;
                for job in self.jobs.iter_mut() {
                    job.reset();
                    if !remember {
                        job.completed_iterations = 0;
                        job.completed_count = 0;
                    }
                }
                self.events.emit(SchedulerEvent::JobListChanged);
                self.session.failures.reset();
                self.session.capture_batch = 0;
                self.session.sequence_iteration = 1;
                self.session.last_polled_status = None;

                self.evaluate_jobs(true);
                self.set_scheduler_state(SchedulerState::Running);
                self.setup_next_iteration(TimerState::RunScheduler);
                self.append_log("Scheduler started.");
            }
            SchedulerState::Paused => {
                self.append_log("Scheduler resuming.");
                self.set_scheduler_state(SchedulerState::Running);
                self.setup_next_iteration(TimerState::RunScheduler);
            }
            _ => {}
        }
    }

    /// Request a pause; it takes effect once the active job is no longer busy
    pub fn pause_scheduler(&mut self) {
        if self.session.scheduler != SchedulerState::Running {
            return;
        }
        self.set_scheduler_state(SchedulerState::Paused);
        self.append_log("Scheduler pause planned...");
    }

    pub(crate) fn set_paused(&mut self) {
        self.setup_next_iteration(TimerState::RunNothing);
        self.append_log("Scheduler paused.");
    }

    /// Stop the scheduler. During a pre-emptive shutdown the queue is kept
    /// and the scheduler sleeps until the wakeup time.
    pub async fn stop_scheduler(&mut self) {
        if !matches!(
            self.session.scheduler,
            SchedulerState::Running | SchedulerState::Paused | SchedulerState::Shutdown
        ) {
            return;
        }
        tracing::info!("Scheduler is stopping...");

        let preemptive = self.session.preemptive_shutdown;
        if !preemptive {
            if self.active_job.is_some() {
                self.stop_current_job_action().await;
            }
            let now = self.clock.now();
            let mut messages = Vec::new();
            for job in self.jobs.iter_mut() {
                if matches!(
                    job.state(),
                    JobState::Idle | JobState::Evaluation | JobState::Scheduled | JobState::Busy
                ) {
                    messages.push(format!(
                        "Job '{}' has not been processed upon scheduler stop, marking aborted.",
                        job.name
                    ));
                    transition(job, JobState::Aborted, now, &self.events);
                }
            }
            for message in messages {
                self.append_log(message);
            }
        }

        self.setup_next_iteration(TimerState::RunNothing);
        self.session.cancel_guiding_timer();
        self.set_scheduler_state(SchedulerState::Idle);
        self.session.park_wait = ParkWaitState::Idle;
        self.session.ekos = EkosState::Idle;
        self.session.indi = IndiState::Idle;

        if self.session.startup != StartupState::Complete || preemptive {
            if self.session.startup == StartupState::Script {
                self.terminate_script();
            }
            self.session.startup = StartupState::Idle;
        } else {
            // Startup script is not run again, unparking is
            let procedure = &self.settings.procedure;
            if procedure.unpark_dome {
                self.session.startup = StartupState::UnparkDome;
            } else if procedure.unpark_mount {
                self.session.startup = StartupState::UnparkMount;
            } else if procedure.uncap {
                self.session.startup = StartupState::UnparkCap;
            }
        }

        self.session.shutdown = ShutdownState::Idle;
        self.active_job = None;
        self.session.failures.reset();
        self.session.autofocus_completed = false;
        self.session.operation_timer.stop();

        if preemptive {
            let now = self.clock.now();
            let wakeup = self.session.preemptive_wakeup_time.unwrap_or(now);
            let interval = wakeup_interval_ms(now, wakeup, self.clock.scale());
            self.session.setup_next_iteration(TimerState::RunWakeup, interval);
            self.append_log(format!(
                "Scheduler is sleeping until {}.",
                wakeup.format("%Y-%m-%d %H:%M:%S")
            ));
            self.events.emit(SchedulerEvent::Stopped);
            return;
        }

        if self.modules.has(ModuleKind::Capture) {
            self.call_quietly(ModuleKind::Capture, methods::SET_TARGET_NAME, &[Value::String(String::new())])
                .await;
        }
        self.terminate_script();
        self.append_log("Scheduler stopped.");
        self.events.emit(SchedulerEvent::Stopped);
    }

    /// Evaluate the queue, selecting the next job unless `evaluate_only`
    pub fn evaluate_jobs(&mut self, evaluate_only: bool) -> EvaluationOutcome {
        let now = self.clock.now();
        let evaluator =
            JobEvaluator::new(&self.settings, self.sequences.as_ref(), now).with_weather(self.session.weather);
        let evaluation = evaluator.evaluate(&mut self.jobs, &mut self.captured, evaluate_only, &mut self.events);
        if evaluation.reordered {
            self.dirty = true;
        }

        match evaluation.outcome {
            EvaluationOutcome::Selected(id) => {
                self.active_job = Some(id);
                if let Some(job) = self.job(id) {
                    tracing::info!("Scheduler is about to execute job '{}'", job.name);
                }
            }
            EvaluationOutcome::RetryAfter(delay) => {
                let interval = self.scaled_ms(delay.as_millis() as i64);
                self.session.setup_next_iteration(TimerState::RunScheduler, interval);
            }
            EvaluationOutcome::NoJob | EvaluationOutcome::EvaluatedOnly => {}
        }
        evaluation.outcome
    }

    /// Apply a new clock rate, rescheduling a pending wakeup accordingly
    pub fn set_clock_scale(&mut self, scale: f64) {
        self.clock.set_scale(scale);
        if self.session.timer_state != TimerState::RunWakeup {
            return;
        }
        let until = self.session.wakeup_time.or(self.session.preemptive_wakeup_time);
        if let Some(until) = until {
            let interval = wakeup_interval_ms(self.clock.now(), until, self.clock.scale());
            tracing::debug!("Clock scale {}, wakeup in {} ms", scale, interval);
            self.session.timer_interval_ms = interval;
        }
    }

    // =========================================================================
    // ITERATION
    // =========================================================================

    /// Run one iteration. Returns the delay until the next one, or None when
    /// there is nothing left to do until a command arrives.
    pub async fn run_iteration(&mut self) -> Option<Duration> {
        self.session.iteration += 1;
        self.poll_script();
        self.poll_weather().await;

        match self.session.timer_state {
            TimerState::RunWakeup => self.wake_up_scheduler().await,
            TimerState::RunScheduler => {
                self.check_status().await;
            }
            TimerState::RunJobCheck => self.check_job_stage().await,
            TimerState::RunShutdown => {
                self.check_shutdown_state().await;
            }
            TimerState::RunNothing => {}
        }

        self.poll_manual_procedures().await;

        if !self.session.iteration_setup {
            let state = self.session.timer_state;
            self.setup_next_iteration(state);
        }
        self.session.iteration_setup = false;
        self.next_interval()
    }

    /// Delay until the next iteration as currently set up
    pub(crate) fn next_interval(&self) -> Option<Duration> {
        if self.session.timer_interval_ms >= 0 {
            Some(Duration::from_millis(self.session.timer_interval_ms as u64))
        } else if self.session.manual_startup || self.session.manual_shutdown || self.script.is_some() {
            Some(self.settings.update_period())
        } else {
            None
        }
    }

    /// Overall progress check: shutdown, evaluation, bring-up, then execution
    pub(crate) async fn check_status(&mut self) -> bool {
        if self.session.scheduler == SchedulerState::Paused {
            let busy = self.active_job().map_or(false, |j| j.state() == JobState::Busy);
            if !busy {
                self.set_paused();
                return false;
            }
        }

        let Some(id) = self.active_job else {
            if matches!(self.session.shutdown, ShutdownState::Complete | ShutdownState::Error) {
                return self.complete_shutdown().await;
            }

            if self.session.shutdown != ShutdownState::Idle {
                if self.session.ekos == EkosState::Stopping && !self.check_ekos_state().await {
                    return false;
                }
                self.check_shutdown_state().await;
                return false;
            }

            if !self.check_park_wait_state().await {
                return false;
            }

            let mut outcome = self.evaluate_jobs(false);
            if outcome == EvaluationOutcome::NoJob && self.repeat_job_sequence() {
                outcome = self.evaluate_jobs(false);
            }
            match outcome {
                EvaluationOutcome::NoJob => {
                    self.check_shutdown_state().await;
                    return false;
                }
                _ => return true,
            }
        };

        if self.should_sleep(id).await {
            return true;
        }

        if self.session.startup == StartupState::Error {
            self.stop_scheduler().await;
            return true;
        }

        if (self.session.startup == StartupState::Idle && !self.check_startup_state().await)
            || self.session.startup == StartupState::Script
        {
            return false;
        }

        if !self.check_ekos_state().await {
            return false;
        }

        if !self.check_indi_state().await {
            return false;
        }

        if !self.check_park_wait_state().await {
            return false;
        }

        let startup = self.session.startup;
        if startup > StartupState::Script && startup < StartupState::Error && !self.check_startup_state().await {
            return false;
        }

        if self.job(id).map(|j| j.state()) == Some(JobState::Complete) {
            let follow = self.find_next_job().await;
            self.run_follow_ups(follow).await;
        } else {
            self.execute_job(id).await;
        }
        true
    }

    /// Start the whole queue over when the repeat-sequence option allows it
    fn repeat_job_sequence(&mut self) -> bool {
        if !self.settings.repeat_sequence || self.settings.remember_job_progress {
            return false;
        }
        let limit = self.settings.repeat_sequence_count;
        if limit != 0 && self.session.sequence_iteration >= limit {
            return false;
        }
        if !self.jobs.iter().any(|j| j.state() == JobState::Complete) {
            return false;
        }

        self.session.sequence_iteration += 1;
        let message = format!("Starting job sequence iteration #{}", self.session.sequence_iteration);
        self.append_log(message);
        for job in self.jobs.iter_mut() {
            job.reset();
            job.completed_iterations = 0;
            job.completed_count = 0;
        }
        self.events.emit(SchedulerEvent::JobListChanged);
        true
    }

    /// Decide whether to wait for the selected job; true when not proceeding now
    pub(crate) async fn should_sleep(&mut self, id: Uuid) -> bool {
        let Some(job) = self.job(id) else {
            return false;
        };
        if !job.light_frames_required {
            return false;
        }

        let ctx = SleepContext {
            now: self.clock.now(),
            scale: self.clock.scale(),
            startup: self.session.startup,
            park_wait: self.session.park_wait,
        };
        let plan = plan_sleep(job, &self.settings, &ctx);
        for message in plan.messages {
            self.append_log(message);
        }

        match plan.decision {
            SleepDecision::Proceed => false,
            SleepDecision::PreemptiveShutdown { wakeup } => {
                self.session.enable_preemptive_shutdown(wakeup);
                self.check_shutdown_state().await;
                true
            }
            SleepDecision::ParkAndWait => {
                self.session.park_wait = ParkWaitState::Park;
                false
            }
            SleepDecision::Sleep { until, interval_ms } => {
                self.session.wakeup_time = Some(until);
                self.events.emit(SchedulerEvent::Sleeping { until });
                self.session.setup_next_iteration(TimerState::RunWakeup, interval_ms);
                true
            }
        }
    }

    pub(crate) async fn wake_up_scheduler(&mut self) {
        self.session.wakeup_time = None;
        if self.session.preemptive_shutdown {
            self.session.disable_preemptive_shutdown();
            self.append_log("Scheduler is awake.");
            self.start_scheduler().await;
        } else {
            if self.session.scheduler == SchedulerState::Running {
                self.append_log("Scheduler is awake. Jobs shall be started when ready...");
            } else {
                self.append_log("Scheduler is awake. Jobs shall be started when scheduler is resumed.");
            }
            self.setup_next_iteration(TimerState::RunScheduler);
        }
    }

    // =========================================================================
    // JOB EXECUTION
    // =========================================================================

    /// Make `id` the busy job. False when it is already running or has to wait.
    pub(crate) async fn execute_job(&mut self, id: Uuid) -> bool {
        if self.active_job == Some(id) && self.job(id).map(|j| j.state()) == Some(JobState::Busy) {
            return false;
        }
        self.active_job = Some(id);

        if self.should_sleep(id).await {
            return false;
        }

        self.session.autofocus_completed = false;
        self.session.last_polled_status = None;
        tracing::info!("Executing job '{}'", self.active_name());
        self.set_job_state(id, JobState::Busy);
        self.setup_next_iteration(TimerState::RunJobCheck);
        true
    }

    /// Abort whatever module the active job is using
    pub(crate) async fn stop_current_job_action(&mut self) {
        if let Some(stage) = self.active_stage() {
            let module = match stage {
                JobStage::Slewing | JobStage::Reslewing => Some(ModuleKind::Mount),
                JobStage::Focusing | JobStage::PostalignFocusing => Some(ModuleKind::Focus),
                JobStage::Aligning => Some(ModuleKind::Align),
                JobStage::Capturing => Some(ModuleKind::Capture),
                _ => None,
            };
            if let Some(module) = module {
                self.call_quietly(module, methods::ABORT, &[]).await;
            }
            self.set_stage(JobStage::Idle);
        }
        self.stop_guiding().await;
    }

    pub(crate) async fn stop_guiding(&mut self) {
        if self.active_uses(StepPipeline::GUIDE) {
            self.call_quietly(ModuleKind::Guide, methods::ABORT, &[]).await;
            self.session.failures.guide = 0;
        }
        self.session.cancel_guiding_timer();
    }

    /// Act on the outcome of the active job, then pick what runs next
    pub(crate) async fn find_next_job(&mut self) -> FollowUp {
        if self.session.scheduler == SchedulerState::Paused {
            self.set_paused();
            return FollowUp::Done;
        }
        let Some(id) = self.active_job else {
            self.setup_next_iteration(TimerState::RunScheduler);
            return FollowUp::Done;
        };
        let Some(job) = self.job(id) else {
            self.active_job = None;
            self.setup_next_iteration(TimerState::RunScheduler);
            return FollowUp::Done;
        };
        let name = job.name.clone();
        let state = job.state();
        let completion = job.completion_condition();

        self.session.failures.reset_job();
        self.session.last_polled_status = None;

        if matches!(state, JobState::Error | JobState::Aborted) {
            self.session.capture_batch = 0;
            self.stop_guiding().await;
            if state == JobState::Error {
                self.append_log(format!("Job '{}' is terminated due to errors.", name));
            } else {
                self.append_log(format!("Job '{}' is aborted.", name));
            }
            self.set_stage(JobStage::Idle);

            let restart = self.settings.error_handling == ErrorHandlingStrategy::RestartImmediately
                && (state == JobState::Aborted || self.settings.reschedule_errors);
            if restart {
                self.set_job_state(id, JobState::Scheduled);
                let delay = self.settings.error_handling_delay_secs as i64;
                self.append_log(format!("Waiting {} seconds to restart job '{}'.", delay, name));
                let interval = self.scaled_ms(delay * 1000);
                self.session.setup_next_iteration(TimerState::RunWakeup, interval);
                return FollowUp::Done;
            }

            self.active_job = None;
            self.setup_next_iteration(TimerState::RunScheduler);
            return FollowUp::Done;
        }

        if state == JobState::Idle {
            self.active_job = None;
            self.setup_next_iteration(TimerState::RunScheduler);
            return FollowUp::Done;
        }

        match completion {
            CompletionCondition::Sequence => {
                if self.settings.remember_job_progress {
                    self.mark_with_duplicates(id, JobState::Idle);
                }
                self.session.capture_batch = 0;
                self.stop_guiding().await;
                self.append_log(format!("Job '{}' is complete.", name));
                self.set_stage(JobStage::Idle);
                if !self.can_count_captures(id) {
                    self.set_job_state(id, JobState::Complete);
                }
                self.active_job = None;
                self.setup_next_iteration(TimerState::RunScheduler);
                FollowUp::Done
            }

            CompletionCondition::Repeat { .. } => {
                let remaining = self.count_down_repeats(id);
                if remaining == 0 {
                    if let Some(job) = self.job_mut(id) {
                        job.startup_time = None;
                    }
                    self.mark_with_duplicates(id, JobState::Idle);
                    self.evaluate_jobs(true);
                    self.stop_current_job_action().await;

                    let required = self.job(id).map_or(0, |j| j.repeats_required);
                    self.append_log(format!("Job '{}' is complete after #{} batches.", name, required));
                    if !self.can_count_captures(id) {
                        self.set_job_state(id, JobState::Complete);
                    }
                    self.active_job = None;
                    self.setup_next_iteration(TimerState::RunScheduler);
                    return FollowUp::Done;
                }

                if !self.execute_job(id).await {
                    return FollowUp::Done;
                }
                let follow = self.restart_job_pipeline(true).await;
                self.session.capture_batch += 1;
                self.append_log(format!("Job '{}' is repeating, #{} batches remaining.", name, remaining));
                self.setup_next_iteration(TimerState::RunJobCheck);
                follow
            }

            CompletionCondition::Loop => {
                if !self.execute_job(id).await {
                    return FollowUp::Done;
                }
                let follow = self.restart_job_pipeline(false).await;
                self.session.capture_batch += 1;
                self.append_log(format!("Job '{}' is repeating, looping indefinitely.", name));
                self.setup_next_iteration(TimerState::RunJobCheck);
                follow
            }

            CompletionCondition::At { time } => {
                if self.clock.now() >= time {
                    self.mark_with_duplicates(id, JobState::Idle);
                    self.stop_current_job_action().await;
                    let batches = self.session.capture_batch + 1;
                    self.session.capture_batch = 0;
                    self.append_log(format!(
                        "Job '{}' stopping, reached completion time with #{} batches done.",
                        name, batches
                    ));
                    self.set_stage(JobStage::Idle);
                    self.active_job = None;
                    self.setup_next_iteration(TimerState::RunScheduler);
                    return FollowUp::Done;
                }

                if !self.execute_job(id).await {
                    return FollowUp::Done;
                }
                let follow = self.restart_job_pipeline(false).await;
                self.session.capture_batch += 1;
                self.append_log(format!(
                    "Job '{}' completed #{} batches before completion time, restarted.",
                    name, self.session.capture_batch
                ));
                self.setup_next_iteration(TimerState::RunJobCheck);
                follow
            }
        }
    }

    /// One batch done: returns the batches still to go
    fn count_down_repeats(&mut self, id: Uuid) -> u32 {
        let remember = self.settings.remember_job_progress;
        let done = match self.job(id) {
            Some(job) if remember => self.remembered_iterations(job),
            _ => None,
        };
        let Some(job) = self.job_mut(id) else {
            return 0;
        };
        match done {
            Some(done) => {
                job.completed_iterations = done;
                job.repeats_remaining = job.repeats_required.saturating_sub(done);
            }
            None => {
                job.repeats_remaining = job.repeats_remaining.saturating_sub(1);
                job.completed_iterations += 1;
            }
        }
        job.repeats_remaining
    }

    /// Pick the stage a repeating job restarts from
    async fn restart_job_pipeline(&mut self, repeat: bool) -> FollowUp {
        if self.active_uses(StepPipeline::ALIGN) && self.settings.force_alignment_before_job {
            self.stop_guiding().await;
            self.set_stage(JobStage::Aligning);
            return self.start_astrometry().await;
        }
        if repeat {
            if self.active_uses(StepPipeline::GUIDE) {
                self.set_stage(JobStage::Capturing);
                return self.start_capture(false).await;
            }
            if self.active_uses(StepPipeline::ALIGN) {
                self.set_stage(JobStage::Aligning);
                return self.start_astrometry().await;
            }
            if self.active_uses(StepPipeline::TRACK) {
                self.set_stage(JobStage::Slewing);
                return self.start_slew().await;
            }
        }
        self.set_stage(JobStage::Capturing);
        self.start_capture(false).await
    }

    // =========================================================================
    // WEATHER
    // =========================================================================

    pub async fn set_weather_status(&mut self, status: WeatherStatus) {
        if status == self.session.weather {
            return;
        }
        self.session.weather = status;
        self.events.emit(SchedulerEvent::WeatherChanged(status));
        match status {
            WeatherStatus::Ok => self.append_log("Weather conditions are OK."),
            WeatherStatus::Warning => self.append_log("Warning: weather conditions are in the WARNING zone."),
            WeatherStatus::Alert => self.append_log("Caution: weather conditions are in the DANGER zone!"),
            WeatherStatus::Idle => {}
        }

        let active = matches!(self.session.scheduler, SchedulerState::Running | SchedulerState::Paused);
        if status == WeatherStatus::Alert && active && self.session.shutdown == ShutdownState::Idle {
            self.append_log("Starting shutdown procedure due to severe weather.");
            if self.active_job.is_some() {
                self.stop_current_job_action().await;
                self.set_active_state(JobState::Aborted);
            }
            self.check_shutdown_state().await;
        }
    }

    async fn poll_weather(&mut self) {
        if !matches!(self.session.scheduler, SchedulerState::Running | SchedulerState::Paused)
            || !self.modules.has(ModuleKind::Weather)
        {
            return;
        }
        match self.modules.read_as::<WeatherStatus>(ModuleKind::Weather, props::STATUS).await {
            Ok(status) => self.set_weather_status(status).await,
            Err(e) => tracing::debug!("Weather status unavailable: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::astro::SkyPoint;
    use crate::clock::{Clock, SimulatedClock};
    use crate::config::GeoLocation;
    use crate::device::SimulatedObservatory;
    use crate::sequence::{CaptureSequence, MemorySequenceSource, SequenceStep};
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Arc;

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 4, 17, 7, 0, 0).unwrap()
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            location: GeoLocation {
                latitude: 37.44,
                longitude: -122.17,
                utc_offset_hours: -7.0,
            },
            remember_job_progress: false,
            ..SchedulerSettings::default()
        }
    }

    fn process(settings: SchedulerSettings) -> (SchedulerProcess, SimulatedObservatory, Arc<SimulatedClock>) {
        let clock = Arc::new(SimulatedClock::new(start_time()));
        let source = Arc::new(MemorySequenceSource::new());
        source.insert(
            "/seq/m51.json",
            CaptureSequence::new(vec![SequenceStep::light("/data/M51/Light", 60.0, 3)]),
        );
        let obs = SimulatedObservatory::with_capture_sink(source.clone());
        let process = SchedulerProcess::new(settings, obs.modules(), clock.clone(), source);
        (process, obs, clock)
    }

    fn m51() -> ObservationJob {
        ObservationJob::new("M51", SkyPoint::from_degrees(202.47, 47.19))
            .with_sequence("/seq/m51.json")
            .with_steps(StepPipeline::NONE)
    }

    #[tokio::test]
    async fn test_start_evaluates_and_stop_aborts() {
        let (mut process, _obs, _clock) = process(settings());
        let id = process.add_job(m51());
        assert!(process.is_dirty());

        process.start_scheduler().await;
        assert_eq!(process.state(), SchedulerState::Running);
        assert_eq!(process.job(id).unwrap().state(), JobState::Scheduled);
        assert!(process.log().contains("Scheduler started."));

        process.stop_scheduler().await;
        assert_eq!(process.state(), SchedulerState::Idle);
        assert_eq!(process.job(id).unwrap().state(), JobState::Aborted);
        assert!(process
            .log()
            .contains("Job 'M51' has not been processed upon scheduler stop, marking aborted."));
        assert_eq!(process.session().timer_state, TimerState::RunNothing);
    }

    #[tokio::test]
    async fn test_pause_waits_for_idle_job() {
        let (mut process, _obs, _clock) = process(settings());
        process.add_job(m51());
        process.start_scheduler().await;
        process.pause_scheduler();
        assert_eq!(process.state(), SchedulerState::Paused);

        // No busy job: the pause takes effect on the next status check
        process.run_iteration().await;
        assert!(process.log().contains("Scheduler paused."));
        assert_eq!(process.session().timer_state, TimerState::RunNothing);

        process.start_scheduler().await;
        assert_eq!(process.state(), SchedulerState::Running);
        assert!(process.log().contains("Scheduler resuming."));
    }

    #[tokio::test]
    async fn test_remove_job() {
        let (mut process, _obs, _clock) = process(settings());
        let id = process.add_job(m51());
        assert!(process.remove_job(id));
        assert!(!process.remove_job(id));
        assert!(process.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_weather_alert_starts_shutdown() {
        let (mut process, _obs, _clock) = process(settings());
        process.add_job(m51());
        process.start_scheduler().await;

        process.set_weather_status(WeatherStatus::Alert).await;
        assert!(process.log().contains("Caution: weather conditions are in the DANGER zone!"));
        assert!(process.log().contains("Starting shutdown procedure due to severe weather."));
        assert_eq!(process.state(), SchedulerState::Shutdown);
        assert_eq!(process.session().timer_state, TimerState::RunShutdown);
    }

    #[tokio::test]
    async fn test_clock_scale_reschedules_wakeup() {
        let (mut process, _obs, clock) = process(settings());
        process.session.wakeup_time = Some(clock.now() + chrono::Duration::seconds(99));
        process.session.setup_next_iteration(TimerState::RunWakeup, 100_000);

        process.set_clock_scale(10.0);
        assert_eq!(process.session().timer_interval_ms, 10_000);
    }

    #[tokio::test]
    async fn test_count_down_repeats() {
        let (mut process, _obs, _clock) = process(settings());
        let id = process.add_job(m51().with_completion(CompletionCondition::Repeat { count: 3 }));
        assert_eq!(process.count_down_repeats(id), 2);
        assert_eq!(process.count_down_repeats(id), 1);
        assert_eq!(process.count_down_repeats(id), 0);
        assert_eq!(process.job(id).unwrap().completed_iterations, 3);
    }

    fn restart_settings(reschedule_errors: bool) -> SchedulerSettings {
        SchedulerSettings {
            error_handling: ErrorHandlingStrategy::RestartImmediately,
            error_handling_delay_secs: 30,
            reschedule_errors,
            ..settings()
        }
    }

    /// Start the scheduler and make the queued job the one that just ended in `state`
    async fn finished_job(process: &mut SchedulerProcess, state: JobState) -> Uuid {
        let id = process.add_job(m51());
        process.start_scheduler().await;
        assert_eq!(process.job(id).unwrap().state(), JobState::Scheduled);
        process.active_job = Some(id);
        process.set_job_state(id, state);
        id
    }

    #[tokio::test]
    async fn test_restart_immediately_requeues_aborted_job() {
        let (mut process, _obs, clock) = process(restart_settings(false));
        process.set_clock_scale(2.0);
        let id = finished_job(&mut process, JobState::Aborted).await;

        assert_eq!(process.find_next_job().await, FollowUp::Done);
        assert_eq!(process.job(id).unwrap().state(), JobState::Scheduled);
        assert_eq!(process.active_job().map(|j| j.id), Some(id));
        assert_eq!(process.session().timer_state, TimerState::RunWakeup);
        assert_eq!(process.session().timer_interval_ms, 15_000);
        assert!(process.log().contains("Job 'M51' is aborted."));
        assert!(process.log().contains("Waiting 30 seconds to restart job 'M51'."));

        clock.advance_secs(30);
        process.run_iteration().await;
        assert!(process.log().contains("Scheduler is awake. Jobs shall be started when ready..."));
        assert_eq!(process.session().timer_state, TimerState::RunScheduler);

        // Bring-up runs again for the same job, which then becomes busy
        for _ in 0..50 {
            if process.job(id).unwrap().state() == JobState::Busy {
                break;
            }
            clock.advance_secs(1);
            process.run_iteration().await;
        }
        assert_eq!(process.job(id).unwrap().state(), JobState::Busy);
        assert_eq!(process.active_job().map(|j| j.id), Some(id));
        assert_eq!(process.session().timer_state, TimerState::RunJobCheck);
    }

    #[tokio::test]
    async fn test_restart_immediately_leaves_errors_alone() {
        let (mut process, _obs, _clock) = process(restart_settings(false));
        let id = finished_job(&mut process, JobState::Error).await;

        process.find_next_job().await;
        assert_eq!(process.job(id).unwrap().state(), JobState::Error);
        assert!(process.active_job().is_none());
        assert_eq!(process.session().timer_state, TimerState::RunScheduler);
        assert!(process.log().contains("Job 'M51' is terminated due to errors."));
        assert!(!process.log().contains("Waiting 30 seconds to restart job 'M51'."));
    }

    #[tokio::test]
    async fn test_restart_immediately_reschedules_errors_when_enabled() {
        let (mut process, _obs, _clock) = process(restart_settings(true));
        let id = finished_job(&mut process, JobState::Error).await;

        process.find_next_job().await;
        assert_eq!(process.job(id).unwrap().state(), JobState::Scheduled);
        assert_eq!(process.active_job().map(|j| j.id), Some(id));
        assert_eq!(process.session().timer_state, TimerState::RunWakeup);
        assert_eq!(process.session().timer_interval_ms, 30_000);
        assert!(process.log().contains("Waiting 30 seconds to restart job 'M51'."));
    }
}
