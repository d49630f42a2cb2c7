//! Job pipeline: slew, focus, align, guide, capture
//!
//! Each `start_*` action issues its commands and moves the active job to the
//! matching stage. Progress is then observed either through statuses pushed
//! with [`SchedulerProcess::on_module_status`] or by polling the module on
//! each job check.

use crate::device::{
    methods, props, AlignStatus, CaptureStatus, FocusStatus, GuideStatus, ModuleKind, ModuleStatus,
    MountStatus,
};
use crate::error::DeviceError;
use crate::engine::{JobCheck, JobEvaluator};
use crate::job::{JobStage, JobState, StepPipeline};
use crate::process::{FollowUp, SchedulerProcess};
use crate::session::{FailureCounters, ParkWaitState, TimerState};
use crate::MAX_FAILURE_ATTEMPTS;
use serde_json::{json, Value};
use std::time::Duration;

/// Module driving a stage, if the stage waits on one
fn stage_module(stage: JobStage) -> Option<ModuleKind> {
    match stage {
        JobStage::Slewing | JobStage::Reslewing => Some(ModuleKind::Mount),
        JobStage::Focusing => Some(ModuleKind::Focus),
        JobStage::Aligning => Some(ModuleKind::Align),
        JobStage::Guiding => Some(ModuleKind::Guide),
        JobStage::Capturing => Some(ModuleKind::Capture),
        _ => None,
    }
}

/// Decode a raw status value for the given module
fn parse_status(kind: ModuleKind, value: Value) -> Option<ModuleStatus> {
    let status = match kind {
        ModuleKind::Mount => ModuleStatus::Mount(serde_json::from_value(value).ok()?),
        ModuleKind::Align => ModuleStatus::Align(serde_json::from_value(value).ok()?),
        ModuleKind::Focus => ModuleStatus::Focus(serde_json::from_value(value).ok()?),
        ModuleKind::Guide => ModuleStatus::Guide(serde_json::from_value(value).ok()?),
        ModuleKind::Capture => ModuleStatus::Capture(serde_json::from_value(value).ok()?),
        ModuleKind::Weather => ModuleStatus::Weather(serde_json::from_value(value).ok()?),
        _ => return None,
    };
    Some(status)
}

impl ModuleStatus {
    pub fn module(&self) -> ModuleKind {
        match self {
            ModuleStatus::Mount(_) => ModuleKind::Mount,
            ModuleStatus::Align(_) => ModuleKind::Align,
            ModuleStatus::Focus(_) => ModuleKind::Focus,
            ModuleStatus::Guide(_) => ModuleKind::Guide,
            ModuleStatus::Capture(_) => ModuleKind::Capture,
            ModuleStatus::Weather(_) => ModuleKind::Weather,
        }
    }

    /// The inner status as the module would report it
    pub fn value(&self) -> Value {
        let value = match self {
            ModuleStatus::Mount(s) => serde_json::to_value(s),
            ModuleStatus::Align(s) => serde_json::to_value(s),
            ModuleStatus::Focus(s) => serde_json::to_value(s),
            ModuleStatus::Guide(s) => serde_json::to_value(s),
            ModuleStatus::Capture(s) => serde_json::to_value(s),
            ModuleStatus::Weather(s) => serde_json::to_value(s),
        };
        value.unwrap_or(Value::Null)
    }

    /// Whether the module sits idle, meaning a started procedure went nowhere
    fn is_idle(&self) -> bool {
        match self {
            ModuleStatus::Align(s) => *s == AlignStatus::Idle,
            ModuleStatus::Capture(s) => *s == CaptureStatus::Idle,
            ModuleStatus::Focus(s) => matches!(s, FocusStatus::Idle | FocusStatus::Waiting),
            ModuleStatus::Guide(s) => matches!(s, GuideStatus::Idle | GuideStatus::Connected | GuideStatus::Disconnected),
            _ => false,
        }
    }
}

impl SchedulerProcess {
    // =========================================================================
    // HELPERS
    // =========================================================================

    /// Log, leave the active job in `state` and move on
    fn fail_job(&mut self, state: JobState, message: String) -> FollowUp {
        self.append_log(message);
        self.set_active_state(state);
        FollowUp::FindNextJob
    }

    /// A module command failed: reconnect on transport loss, otherwise the job errors out
    async fn module_failure(&mut self, error: &DeviceError) -> FollowUp {
        if error.is_communication() && self.manage_connection_loss().await {
            return FollowUp::Done;
        }
        self.set_active_state(JobState::Error);
        FollowUp::FindNextJob
    }

    /// Enter a stage that waits on a module
    fn enter_stage(&mut self, stage: JobStage) {
        self.set_stage(stage);
        self.session.last_polled_status = None;
        self.session.operation_timer.start(self.clock.as_ref());
    }

    /// A real-time delay expressed on the scheduler clock
    fn clock_delay(&self, delay: Duration) -> chrono::Duration {
        let scale = self.clock.scale();
        let scale = if scale.is_finite() && scale > 0.0 { scale } else { 1.0 };
        chrono::Duration::milliseconds((delay.as_millis() as f64 * scale) as i64)
    }

    async fn is_guiding(&self) -> bool {
        matches!(
            self.modules.read_as::<GuideStatus>(ModuleKind::Guide, props::STATUS).await,
            Ok(GuideStatus::Guiding)
        )
    }

    // =========================================================================
    // NEXT ACTION
    // =========================================================================

    /// Start whatever comes after the active job's current stage
    pub(crate) async fn get_next_action(&mut self) -> FollowUp {
        let Some(job) = self.active_job() else {
            return FollowUp::Done;
        };
        let name = job.name.clone();
        let stage = job.stage;
        let steps = job.steps;
        let light_frames = job.light_frames_required;
        let in_sequence_focus = job.in_sequence_focus;
        let focus_pending = steps.contains(StepPipeline::FOCUS) && !self.session.autofocus_completed;

        match stage {
            JobStage::Idle if light_frames => {
                if steps.contains(StepPipeline::TRACK) {
                    self.start_slew().await
                } else if focus_pending {
                    self.start_focusing().await
                } else if steps.contains(StepPipeline::ALIGN) {
                    self.start_astrometry().await
                } else if steps.contains(StepPipeline::GUIDE) {
                    if self.is_guiding().await {
                        self.append_log("Guiding already running, directly start capturing.");
                        self.start_capture(false).await
                    } else {
                        self.start_guiding(false).await
                    }
                } else {
                    self.start_capture(false).await
                }
            }
            JobStage::Idle => {
                if !steps.is_empty() {
                    self.append_log(format!(
                        "Job '{}' is proceeding directly to capture stage because only calibration frames are pending.",
                        name
                    ));
                }
                self.start_capture(false).await
            }
            JobStage::SlewComplete => {
                if focus_pending {
                    self.start_focusing().await
                } else if steps.contains(StepPipeline::ALIGN) {
                    self.start_astrometry().await
                } else if steps.contains(StepPipeline::GUIDE) {
                    self.start_guiding(false).await
                } else {
                    self.start_capture(false).await
                }
            }
            JobStage::FocusComplete => {
                if steps.contains(StepPipeline::ALIGN) {
                    self.start_astrometry().await
                } else if steps.contains(StepPipeline::GUIDE) {
                    self.start_guiding(false).await
                } else {
                    self.start_capture(false).await
                }
            }
            JobStage::AlignComplete => {
                // The solver slewed to the solved target: wait for the mount to settle
                if self.modules.has(ModuleKind::Mount) {
                    self.enter_stage(JobStage::Reslewing);
                    FollowUp::Done
                } else {
                    self.set_stage(JobStage::ReslewingComplete);
                    FollowUp::NextAction
                }
            }
            JobStage::ReslewingComplete => {
                if steps.contains(StepPipeline::FOCUS) && in_sequence_focus {
                    self.set_stage(JobStage::PostalignFocusing);
                    self.start_focusing().await
                } else if steps.contains(StepPipeline::GUIDE) {
                    self.start_guiding(false).await
                } else {
                    self.start_capture(false).await
                }
            }
            JobStage::PostalignFocusingComplete => {
                if steps.contains(StepPipeline::GUIDE) {
                    self.start_guiding(false).await
                } else {
                    self.start_capture(false).await
                }
            }
            JobStage::GuidingComplete => self.start_capture(false).await,
            _ => FollowUp::Done,
        }
    }

    // =========================================================================
    // ACTIONS
    // =========================================================================

    pub(crate) async fn start_slew(&mut self) -> FollowUp {
        let Some(job) = self.active_job() else {
            return FollowUp::Done;
        };
        let name = job.name.clone();
        let target = job.target;

        if self.is_mount_parked().await {
            self.session.park_wait = ParkWaitState::Unpark;
            return FollowUp::Done;
        }

        if self.settings.reset_mount_model_before_job {
            self.call_quietly(ModuleKind::Mount, methods::RESET_MODEL, &[]).await;
        }

        let args = [json!(target.ra_hours), json!(target.dec_degrees)];
        if let Err(e) = self.modules.call(ModuleKind::Mount, methods::SLEW, &args).await {
            self.append_log(format!("Warning: job '{}' slew request failed: {}", name, e));
            return self.module_failure(&e).await;
        }

        if self.session.park_wait == ParkWaitState::Unparked {
            self.session.park_wait = ParkWaitState::Idle;
        }
        self.enter_stage(JobStage::Slewing);
        self.append_log(format!("Job '{}' is slewing to target.", name));
        FollowUp::Done
    }

    pub(crate) async fn start_focusing(&mut self) -> FollowUp {
        let Some(job) = self.active_job() else {
            return FollowUp::Done;
        };
        let id = job.id;
        let name = job.name.clone();
        let filter = job.initial_filter.clone();

        // In-sequence focus after alignment is left to the capture module
        if matches!(job.stage, JobStage::ReslewingComplete | JobStage::PostalignFocusing) {
            self.call_quietly(ModuleKind::Capture, methods::CLEAR_AUTOFOCUS_HFR, &[]).await;
            self.call_quietly(ModuleKind::Focus, methods::RESET_FRAME, &[]).await;
            self.set_stage(JobStage::PostalignFocusingComplete);
            return FollowUp::NextAction;
        }

        match self.modules.read_as::<bool>(ModuleKind::Focus, props::CAN_AUTOFOCUS).await {
            Ok(true) => {}
            Ok(false) => {
                self.append_log(format!(
                    "Warning: job '{}' is unable to proceed with autofocus, not supported.",
                    name
                ));
                if let Some(job) = self.job_mut(id) {
                    job.steps.remove(StepPipeline::FOCUS);
                }
                self.set_stage(JobStage::FocusComplete);
                return FollowUp::NextAction;
            }
            Err(e) => {
                self.append_log(format!("Warning: job '{}' canAutoFocus request failed: {}", name, e));
                return self.module_failure(&e).await;
            }
        }

        self.call_quietly(ModuleKind::Capture, methods::CLEAR_AUTOFOCUS_HFR, &[]).await;
        if let Err(e) = self.modules.call(ModuleKind::Focus, methods::RESET_FRAME, &[]).await {
            self.append_log(format!("Warning: job '{}' resetFrame request failed: {}", name, e));
            return self.module_failure(&e).await;
        }
        if let Some(filter) = filter {
            self.call_quietly(ModuleKind::Focus, methods::SET_FILTER, &[json!(filter)]).await;
        }
        if let Err(e) = self.modules.call(ModuleKind::Focus, methods::START, &[]).await {
            self.append_log(format!("Warning: job '{}' focus request failed: {}", name, e));
            return self.module_failure(&e).await;
        }

        self.enter_stage(JobStage::Focusing);
        self.append_log(format!("Job '{}' is focusing.", name));
        FollowUp::Done
    }

    pub(crate) async fn start_astrometry(&mut self) -> FollowUp {
        let Some(job) = self.active_job() else {
            return FollowUp::Done;
        };
        let name = job.name.clone();
        let target = job.target;
        let fits_file = job.fits_file.clone();
        let position_angle = job.position_angle;

        if let Some(path) = fits_file {
            if !path.exists() {
                return self.fail_job(
                    JobState::Error,
                    format!("Warning: job '{}' target FITS file does not exist.", name),
                );
            }
            let args = [json!(path.to_string_lossy())];
            if let Err(e) = self.modules.call(ModuleKind::Align, methods::LOAD_AND_SLEW, &args).await {
                self.append_log(format!("Warning: job '{}' loadAndSlew request failed: {}", name, e));
                return self.module_failure(&e).await;
            }
            self.append_log(format!("Job '{}' is plate solving {}.", name, path.display()));
        } else {
            let coords = [json!(target.ra_hours), json!(target.dec_degrees)];
            if let Err(e) = self.modules.call(ModuleKind::Align, methods::SET_TARGET_COORDS, &coords).await {
                self.append_log(format!("Warning: job '{}' setTargetCoords request failed: {}", name, e));
                return self.module_failure(&e).await;
            }
            if let Some(angle) = position_angle.filter(|a| *a >= -180.0) {
                self.call_quietly(ModuleKind::Align, methods::SET_TARGET_ROTATION, &[json!(angle)])
                    .await;
            }
            if let Err(e) = self.modules.call(ModuleKind::Align, methods::CAPTURE_AND_SOLVE, &[]).await {
                self.append_log(format!("Warning: job '{}' captureAndSolve request failed: {}", name, e));
                return self.module_failure(&e).await;
            }
            self.append_log(format!("Job '{}' is capturing and plate solving.", name));
        }

        self.enter_stage(JobStage::Aligning);
        FollowUp::Done
    }

    pub(crate) async fn start_guiding(&mut self, reset_calibration: bool) -> FollowUp {
        let Some(job) = self.active_job() else {
            return FollowUp::Done;
        };
        let name = job.name.clone();

        if !reset_calibration && self.is_guiding().await {
            self.set_stage(JobStage::GuidingComplete);
            self.append_log(format!(
                "Guiding already running for {}, starting next scheduler action...",
                name
            ));
            return FollowUp::NextAction;
        }

        self.call_quietly(ModuleKind::Guide, methods::CONNECT_GUIDER, &[]).await;
        self.call_quietly(ModuleKind::Guide, methods::SET_AUTO_STAR, &[json!(true)]).await;
        if reset_calibration && self.settings.reset_guide_calibration {
            self.call_quietly(ModuleKind::Guide, methods::CLEAR_CALIBRATION, &[]).await;
        }
        if let Err(e) = self.modules.call(ModuleKind::Guide, methods::GUIDE, &[]).await {
            self.append_log(format!("Warning: job '{}' guide request failed: {}", name, e));
            return self.module_failure(&e).await;
        }

        self.enter_stage(JobStage::Guiding);
        self.append_log(format!("Starting guiding procedure for {} ...", name));
        FollowUp::Done
    }

    /// Restart guiding once the delay after a guiding failure has elapsed
    async fn process_guiding_timer(&mut self) -> FollowUp {
        match self.session.guiding_restart_at {
            Some(at) if self.clock.now() >= at => {
                self.session.cancel_guiding_timer();
                self.start_guiding(true).await
            }
            _ => FollowUp::Done,
        }
    }

    pub(crate) async fn start_capture(&mut self, restart: bool) -> FollowUp {
        let Some(job) = self.active_job() else {
            return FollowUp::Done;
        };
        let name = job.name.clone();
        let sequence_file = job.sequence_file.clone();
        let mut frames: Vec<(String, u32)> = job.captured_frames.iter().map(|(k, v)| (k.clone(), *v)).collect();
        frames.sort();

        // Guiding has to be running before capture starts
        if self.active_uses(StepPipeline::GUIDE) && !self.is_guiding().await {
            self.set_stage(JobStage::Guiding);
            return self.start_guiding(false).await;
        }

        self.call_quietly(ModuleKind::Capture, methods::SET_TARGET_NAME, &[json!(name)]).await;

        if !restart {
            let args = [json!(sequence_file.to_string_lossy()), json!(name)];
            if let Err(e) = self.modules.call(ModuleKind::Capture, methods::LOAD_SEQUENCE_QUEUE, &args).await {
                self.append_log(format!("Warning: job '{}' loadSequenceQueue request failed: {}", name, e));
                return self.module_failure(&e).await;
            }
        }

        for (signature, count) in frames {
            self.call_quietly(
                ModuleKind::Capture,
                methods::SET_CAPTURED_FRAMES_MAP,
                &[json!(signature), json!(count)],
            )
            .await;
        }

        if let Err(e) = self.modules.call(ModuleKind::Capture, methods::START, &[]).await {
            self.append_log(format!("Warning: job '{}' capture request failed: {}", name, e));
            return self.module_failure(&e).await;
        }

        self.enter_stage(JobStage::Capturing);
        if self.session.capture_batch > 0 {
            self.append_log(format!(
                "Job '{}' capture is in progress (batch #{})...",
                name,
                self.session.capture_batch + 1
            ));
        } else {
            self.append_log(format!("Job '{}' capture is in progress...", name));
        }
        FollowUp::Done
    }

    // =========================================================================
    // STATUS HANDLERS
    // =========================================================================

    /// Feed a status pushed by a module
    pub async fn on_module_status(&mut self, status: ModuleStatus) {
        if let ModuleStatus::Weather(weather) = status {
            self.set_weather_status(weather).await;
            return;
        }
        // Keep polling from seeing the same change again
        if self.active_stage().and_then(stage_module) == Some(status.module()) {
            self.session.last_polled_status = Some(status.value());
        }
        let follow = self.handle_module_status(status).await;
        self.run_follow_ups(follow).await;
    }

    /// Whether status changes are meaningful for the active job right now
    fn accepts_status(&self) -> bool {
        let Some(job) = self.active_job() else {
            return false;
        };
        if job.state() == JobState::Scheduled {
            if let Some(startup) = job.startup_time {
                return self.clock.now() >= startup;
            }
        }
        true
    }

    async fn handle_module_status(&mut self, status: ModuleStatus) -> FollowUp {
        if !self.accepts_status() {
            return FollowUp::Done;
        }
        match status {
            ModuleStatus::Mount(s) => self.handle_mount_status(s),
            ModuleStatus::Align(s) => self.handle_align_status(s).await,
            ModuleStatus::Focus(s) => self.handle_focus_status(s).await,
            ModuleStatus::Guide(s) => self.handle_guide_status(s).await,
            ModuleStatus::Capture(s) => self.handle_capture_status(s).await,
            ModuleStatus::Weather(s) => {
                self.set_weather_status(s).await;
                FollowUp::Done
            }
        }
    }

    fn handle_mount_status(&mut self, status: MountStatus) -> FollowUp {
        let name = self.active_name();
        match self.active_stage() {
            Some(JobStage::Slewing) => match status {
                MountStatus::Tracking => {
                    self.append_log(format!("Job '{}' slew is complete.", name));
                    self.set_stage(JobStage::SlewComplete);
                    FollowUp::Done
                }
                MountStatus::Error => self.fail_job(
                    JobState::Error,
                    format!("Warning: job '{}' slew failed, marking terminated due to errors.", name),
                ),
                MountStatus::Idle => {
                    self.append_log(format!("Warning: job '{}' found not slewing, restarting.", name));
                    self.set_stage(JobStage::Idle);
                    FollowUp::NextAction
                }
                _ => FollowUp::Done,
            },
            Some(JobStage::Reslewing) => match status {
                MountStatus::Tracking => {
                    self.append_log(format!("Job '{}' repositioning is complete.", name));
                    self.set_stage(JobStage::ReslewingComplete);
                    FollowUp::Done
                }
                MountStatus::Error => self.fail_job(
                    JobState::Error,
                    format!("Warning: job '{}' repositioning failed, marking terminated due to errors.", name),
                ),
                MountStatus::Idle => {
                    self.append_log(format!("Warning: job '{}' found not repositioning, restarting.", name));
                    self.set_stage(JobStage::Idle);
                    FollowUp::NextAction
                }
                _ => FollowUp::Done,
            },
            _ => FollowUp::Done,
        }
    }

    async fn handle_align_status(&mut self, status: AlignStatus) -> FollowUp {
        if self.active_stage() != Some(JobStage::Aligning) {
            return FollowUp::Done;
        }
        let name = self.active_name();
        match status {
            AlignStatus::Complete => {
                self.append_log(format!("Job '{}' alignment is complete.", name));
                self.session.failures.align = 0;
                self.set_stage(JobStage::AlignComplete);
                FollowUp::NextAction
            }
            AlignStatus::Failed | AlignStatus::Aborted => {
                self.append_log(format!("Warning: job '{}' alignment failed.", name));
                if !FailureCounters::increase(&mut self.session.failures.align) {
                    return self.fail_job(
                        JobState::Aborted,
                        format!("Warning: job '{}' alignment procedure failed, marking aborted.", name),
                    );
                }
                let attempts = self.session.failures.align;
                if self.settings.reset_mount_model_on_align_failure && attempts > MAX_FAILURE_ATTEMPTS - 1 {
                    self.append_log(format!(
                        "Warning: job '{}' forcing mount model reset after failing alignment #{}.",
                        name, attempts
                    ));
                    self.call_quietly(ModuleKind::Mount, methods::RESET_MODEL, &[]).await;
                }
                self.append_log(format!("Restarting {} alignment procedure...", name));
                self.start_astrometry().await
            }
            _ => FollowUp::Done,
        }
    }

    async fn handle_guide_status(&mut self, status: GuideStatus) -> FollowUp {
        if self.active_stage() != Some(JobStage::Guiding) {
            return FollowUp::Done;
        }
        let name = self.active_name();
        match status {
            GuideStatus::Guiding => {
                self.append_log(format!("Job '{}' guiding is in progress.", name));
                self.session.failures.guide = 0;
                self.session.cancel_guiding_timer();
                self.set_stage(JobStage::GuidingComplete);
                FollowUp::NextAction
            }
            GuideStatus::CalibrationError | GuideStatus::Aborted => {
                let calibration = status == GuideStatus::CalibrationError;
                if calibration {
                    self.append_log(format!("Warning: job '{}' calibration failed.", name));
                } else {
                    self.append_log(format!("Warning: job '{}' guiding failed.", name));
                }
                if self.session.is_guiding_timer_active() {
                    return FollowUp::Done;
                }
                if !FailureCounters::increase(&mut self.session.failures.guide) {
                    return self.fail_job(
                        JobState::Aborted,
                        format!("Warning: job '{}' guiding procedure failed, marking aborted.", name),
                    );
                }

                if calibration && self.settings.realign_after_calibration_failure {
                    self.append_log(format!("Restarting {} alignment procedure...", name));
                    return self.start_astrometry().await;
                }

                let delay = self.settings.timeouts.guide_restart_delay(self.session.failures.guide);
                self.append_log(format!(
                    "Job '{}' is guiding, guiding procedure will be restarted in {} seconds.",
                    name,
                    delay.as_secs()
                ));
                let at = self.clock.now() + self.clock_delay(delay);
                self.session.start_guiding_timer(at);
                FollowUp::Done
            }
            _ => FollowUp::Done,
        }
    }

    async fn handle_focus_status(&mut self, status: FocusStatus) -> FollowUp {
        if self.active_stage() != Some(JobStage::Focusing) {
            return FollowUp::Done;
        }
        let name = self.active_name();
        match status {
            FocusStatus::Complete => {
                self.append_log(format!("Job '{}' focusing is complete.", name));
                self.session.failures.focus = 0;
                self.session.autofocus_completed = true;
                self.set_stage(JobStage::FocusComplete);
                FollowUp::NextAction
            }
            FocusStatus::Failed | FocusStatus::Aborted => {
                self.append_log(format!("Warning: job '{}' focusing failed.", name));
                if !FailureCounters::increase(&mut self.session.failures.focus) {
                    return self.fail_job(
                        JobState::Aborted,
                        format!("Warning: job '{}' focusing procedure failed, marking aborted.", name),
                    );
                }
                self.append_log(format!("Job '{}' is restarting its focusing procedure.", name));
                self.call_quietly(ModuleKind::Focus, methods::RESET_FRAME, &[]).await;
                self.start_focusing().await
            }
            _ => FollowUp::Done,
        }
    }

    async fn handle_capture_status(&mut self, status: CaptureStatus) -> FollowUp {
        if self.active_stage() != Some(JobStage::Capturing) {
            return FollowUp::Done;
        }
        let name = self.active_name();
        match status {
            CaptureStatus::Complete => {
                self.session.failures.capture = 0;
                let remember = self.settings.remember_job_progress;
                if let Some(id) = self.active_job {
                    if let Some(job) = self.job_mut(id) {
                        if !remember {
                            let batch = job.sequence_count / job.repeats_required.max(1);
                            job.completed_count = job.completed_count.saturating_add(batch);
                        }
                    }
                }
                self.set_active_state(JobState::Complete);
                FollowUp::FindNextJob
            }
            CaptureStatus::Aborted | CaptureStatus::Failed => {
                self.append_log(format!("Warning: job '{}' failed to capture target.", name));
                if !FailureCounters::increase(&mut self.session.failures.capture) {
                    return self.fail_job(
                        JobState::Aborted,
                        format!("Warning: job '{}' failed its capture procedure, marking aborted.", name),
                    );
                }
                self.append_log(format!("Job '{}' is restarting its capture procedure.", name));
                self.start_capture(true).await
            }
            _ => FollowUp::Done,
        }
    }

    // =========================================================================
    // JOB CHECK
    // =========================================================================

    /// Periodic check of the busy job: constraints, then progress of its stage
    pub(crate) async fn check_job_stage(&mut self) {
        let Some(id) = self.active_job else {
            self.setup_next_iteration(TimerState::RunScheduler);
            return;
        };
        let verdict = match self.job(id) {
            Some(job) => JobEvaluator::new(&self.settings, self.sequences.as_ref(), self.clock.now())
                .with_weather(self.session.weather)
                .check_job(job),
            None => {
                self.active_job = None;
                self.setup_next_iteration(TimerState::RunScheduler);
                return;
            }
        };
        if let JobCheck::Interrupt { state, reason } = verdict {
            self.append_log(reason);
            self.stop_current_job_action().await;
            self.set_job_state(id, state);
            self.run_follow_ups(FollowUp::FindNextJob).await;
            return;
        }

        if !self.check_status().await {
            return;
        }
        if self.active_job != Some(id) || self.job(id).map(|j| j.state()) != Some(JobState::Busy) {
            return;
        }

        let follow = self.process_guiding_timer().await;
        if follow != FollowUp::Done {
            self.run_follow_ups(follow).await;
            return;
        }

        let Some(stage) = self.active_stage() else {
            return;
        };
        let follow = match stage {
            JobStage::Idle => FollowUp::NextAction,
            JobStage::Aligning | JobStage::Focusing | JobStage::Guiding | JobStage::Capturing => {
                self.check_module_stage(stage).await
            }
            JobStage::Slewing | JobStage::Reslewing => self.check_mount_stage().await,
            JobStage::SlewComplete | JobStage::ReslewingComplete => self.check_dome_motion().await,
            JobStage::FocusComplete
            | JobStage::AlignComplete
            | JobStage::PostalignFocusingComplete
            | JobStage::GuidingComplete => FollowUp::NextAction,
            JobStage::PostalignFocusing => FollowUp::Done,
        };
        self.run_follow_ups(follow).await;
    }

    /// Poll the module of a stage for changes and for inactivity
    async fn check_module_stage(&mut self, stage: JobStage) -> FollowUp {
        let Some(kind) = stage_module(stage) else {
            return FollowUp::Done;
        };

        let status = match self.modules.read(kind, props::STATUS).await {
            Ok(value) => {
                if self.session.last_polled_status.as_ref() != Some(&value) {
                    self.session.last_polled_status = Some(value.clone());
                    if let Some(status) = parse_status(kind, value.clone()) {
                        let follow = self.handle_module_status(status).await;
                        if follow != FollowUp::Done || self.active_stage() != Some(stage) {
                            return follow;
                        }
                    }
                }
                parse_status(kind, value)
            }
            Err(e) => {
                tracing::debug!("{} status unavailable: {}", kind, e);
                None
            }
        };

        let limit = if kind == ModuleKind::Guide {
            self.settings.timeouts.guide_inactivity()
        } else {
            self.settings.timeouts.module_inactivity()
        };
        if !self.session.operation_timer.exceeded(self.clock.as_ref(), limit) {
            return FollowUp::Done;
        }
        if !status.map_or(false, |s| s.is_idle()) {
            self.session.operation_timer.start(self.clock.as_ref());
            return FollowUp::Done;
        }

        let name = self.active_name();
        let (counter, procedure) = match kind {
            ModuleKind::Align => (&mut self.session.failures.align, "alignment"),
            ModuleKind::Focus => (&mut self.session.failures.focus, "focusing"),
            ModuleKind::Guide => (&mut self.session.failures.guide, "guiding"),
            _ => (&mut self.session.failures.capture, "capture"),
        };
        if !FailureCounters::increase(counter) {
            return self.fail_job(
                JobState::Aborted,
                format!("Warning: job '{}' {} procedure failed, marking aborted.", name, procedure),
            );
        }
        tracing::warn!("Job '{}' {} timed out, restarting", name, procedure);
        match kind {
            ModuleKind::Align => self.start_astrometry().await,
            ModuleKind::Focus => self.start_focusing().await,
            ModuleKind::Guide => self.start_guiding(false).await,
            _ => self.start_capture(false).await,
        }
    }

    async fn check_mount_stage(&mut self) -> FollowUp {
        match self.modules.read_as::<MountStatus>(ModuleKind::Mount, props::STATUS).await {
            Ok(status) => self.handle_module_status(ModuleStatus::Mount(status)).await,
            Err(e) => {
                let name = self.active_name();
                tracing::error!("Mount status read failed: {}", e);
                self.append_log(format!(
                    "Warning: job '{}' lost connection to the mount, attempting to reconnect.",
                    name
                ));
                self.module_failure(&e).await
            }
        }
    }

    /// After a slew, wait for the dome to stop before the next step
    async fn check_dome_motion(&mut self) -> FollowUp {
        if !self.session.dome_ready || !self.modules.has(ModuleKind::Dome) {
            return FollowUp::NextAction;
        }
        match self.modules.read_as::<bool>(ModuleKind::Dome, props::IS_MOVING).await {
            Ok(false) => FollowUp::NextAction,
            Ok(true) => FollowUp::Done,
            Err(e) => {
                let name = self.active_name();
                tracing::error!("Dome motion read failed: {}", e);
                self.append_log(format!(
                    "Warning: job '{}' lost connection to the dome, attempting to reconnect.",
                    name
                ));
                self.module_failure(&e).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::astro::SkyPoint;
    use crate::clock::SimulatedClock;
    use crate::config::SchedulerSettings;
    use crate::device::SimulatedObservatory;
    use crate::job::ObservationJob;
    use crate::sequence::{CaptureSequence, MemorySequenceSource, SequenceStep};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use uuid::Uuid;

    fn process() -> (SchedulerProcess, SimulatedObservatory, Arc<SimulatedClock>) {
        let clock = Arc::new(SimulatedClock::new(Utc.with_ymd_and_hms(2021, 4, 17, 7, 0, 0).unwrap()));
        let source = Arc::new(MemorySequenceSource::new());
        source.insert(
            "/seq/m51.json",
            CaptureSequence::new(vec![SequenceStep::light("/data/M51/Light", 60.0, 3)]),
        );
        let obs = SimulatedObservatory::with_capture_sink(source.clone());
        let settings = SchedulerSettings {
            remember_job_progress: false,
            ..SchedulerSettings::default()
        };
        let process = SchedulerProcess::new(settings, obs.modules(), clock.clone(), source);
        (process, obs, clock)
    }

    /// Make a job the busy one without going through evaluation
    fn activate(process: &mut SchedulerProcess, steps: StepPipeline) -> Uuid {
        let job = ObservationJob::new("M51", SkyPoint::from_degrees(202.47, 47.19))
            .with_sequence("/seq/m51.json")
            .with_steps(steps);
        let id = process.add_job(job);
        process.active_job = Some(id);
        process.set_job_state(id, JobState::Busy);
        if let Some(job) = process.job_mut(id) {
            job.light_frames_required = true;
        }
        id
    }

    fn stage(process: &SchedulerProcess, id: Uuid) -> JobStage {
        process.job(id).unwrap().stage
    }

    #[tokio::test]
    async fn test_next_action_order() {
        let (mut process, obs, _clock) = process();
        let id = activate(&mut process, StepPipeline::all());

        process.run_follow_ups(FollowUp::NextAction).await;
        assert_eq!(stage(&process, id), JobStage::Slewing);
        assert_eq!(obs.mount.call_count(methods::SLEW), 1);
        assert!(process.log().contains("Job 'M51' is slewing to target."));

        process.set_stage(JobStage::SlewComplete);
        process.run_follow_ups(FollowUp::NextAction).await;
        assert_eq!(stage(&process, id), JobStage::Focusing);

        process.session.autofocus_completed = true;
        process.set_stage(JobStage::SlewComplete);
        process.run_follow_ups(FollowUp::NextAction).await;
        assert_eq!(stage(&process, id), JobStage::Aligning);
        assert_eq!(obs.align.call_count(methods::CAPTURE_AND_SOLVE), 1);
    }

    #[tokio::test]
    async fn test_calibration_only_goes_to_capture() {
        let (mut process, obs, _clock) = process();
        let id = activate(&mut process, StepPipeline::TRACK);
        process.job_mut(id).unwrap().light_frames_required = false;

        process.run_follow_ups(FollowUp::NextAction).await;
        assert_eq!(stage(&process, id), JobStage::Capturing);
        assert_eq!(obs.mount.call_count(methods::SLEW), 0);
        assert!(process.log().contains("only calibration frames are pending"));
    }

    #[tokio::test]
    async fn test_slew_waits_for_tracking() {
        let (mut process, _obs, _clock) = process();
        let id = activate(&mut process, StepPipeline::TRACK);
        process.start_slew().await;

        // Slewing, then tracking on the following read
        assert_eq!(process.check_mount_stage().await, FollowUp::Done);
        assert_eq!(stage(&process, id), JobStage::Slewing);
        assert_eq!(process.check_mount_stage().await, FollowUp::Done);
        assert_eq!(stage(&process, id), JobStage::SlewComplete);
        assert!(process.log().contains("Job 'M51' slew is complete."));
    }

    #[tokio::test]
    async fn test_parked_mount_requests_unpark() {
        let (mut process, obs, _clock) = process();
        activate(&mut process, StepPipeline::TRACK);
        obs.mount.set_property(props::PARK_STATUS, json!("PARKED"));

        assert_eq!(process.start_slew().await, FollowUp::Done);
        assert_eq!(process.session().park_wait, ParkWaitState::Unpark);
        assert_eq!(obs.mount.call_count(methods::SLEW), 0);
    }

    #[tokio::test]
    async fn test_mount_error_terminates_job() {
        let (mut process, _obs, _clock) = process();
        let id = activate(&mut process, StepPipeline::TRACK);
        process.set_stage(JobStage::Slewing);

        let follow = process.handle_mount_status(MountStatus::Error);
        assert_eq!(follow, FollowUp::FindNextJob);
        assert_eq!(process.job(id).unwrap().state(), JobState::Error);
    }

    #[tokio::test]
    async fn test_autofocus_unsupported_skips_focus() {
        let (mut process, obs, _clock) = process();
        let id = activate(&mut process, StepPipeline::FOCUS);
        obs.focus.set_property(props::CAN_AUTOFOCUS, json!(false));

        assert_eq!(process.start_focusing().await, FollowUp::NextAction);
        assert_eq!(stage(&process, id), JobStage::FocusComplete);
        assert!(!process.job(id).unwrap().steps.contains(StepPipeline::FOCUS));
        assert_eq!(obs.focus.call_count(methods::START), 0);
    }

    #[tokio::test]
    async fn test_focus_failures_abort_after_retries() {
        let (mut process, obs, _clock) = process();
        let id = activate(&mut process, StepPipeline::FOCUS);
        process.start_focusing().await;

        for _ in 0..MAX_FAILURE_ATTEMPTS {
            let follow = process.handle_focus_status(FocusStatus::Failed).await;
            assert_eq!(follow, FollowUp::Done);
            assert_eq!(stage(&process, id), JobStage::Focusing);
        }
        assert_eq!(obs.focus.call_count(methods::START), 1 + MAX_FAILURE_ATTEMPTS as usize);

        let follow = process.handle_focus_status(FocusStatus::Failed).await;
        assert_eq!(follow, FollowUp::FindNextJob);
        assert_eq!(process.job(id).unwrap().state(), JobState::Aborted);
        assert!(process
            .log()
            .contains("Warning: job 'M51' focusing procedure failed, marking aborted."));
    }

    #[tokio::test]
    async fn test_align_complete_then_reslew() {
        let (mut process, obs, _clock) = process();
        let id = activate(&mut process, StepPipeline::ALIGN);
        process.job_mut(id).unwrap().position_angle = Some(45.0);
        process.start_astrometry().await;
        assert_eq!(obs.align.call_count(methods::SET_TARGET_ROTATION), 1);

        // Progress, then complete
        assert_eq!(process.check_module_stage(JobStage::Aligning).await, FollowUp::Done);
        let follow = process.check_module_stage(JobStage::Aligning).await;
        assert_eq!(follow, FollowUp::NextAction);
        assert!(process.log().contains("Job 'M51' alignment is complete."));

        process.run_follow_ups(follow).await;
        assert_eq!(stage(&process, id), JobStage::Reslewing);
    }

    #[tokio::test]
    async fn test_missing_fits_file_errors() {
        let (mut process, _obs, _clock) = process();
        let id = activate(&mut process, StepPipeline::ALIGN);
        process.job_mut(id).unwrap().fits_file = Some("/nonexistent/m51.fits".into());

        assert_eq!(process.start_astrometry().await, FollowUp::FindNextJob);
        assert_eq!(process.job(id).unwrap().state(), JobState::Error);
        assert!(process
            .log()
            .contains("Warning: job 'M51' target FITS file does not exist."));
    }

    #[tokio::test]
    async fn test_align_failure_resets_model_on_last_attempt() {
        let (mut process, obs, _clock) = process();
        process.settings.reset_mount_model_on_align_failure = true;
        activate(&mut process, StepPipeline::ALIGN);
        process.start_astrometry().await;

        for _ in 0..MAX_FAILURE_ATTEMPTS {
            process.handle_align_status(AlignStatus::Failed).await;
        }
        assert_eq!(obs.mount.call_count(methods::RESET_MODEL), 1);
        assert!(process
            .log()
            .contains("Warning: job 'M51' forcing mount model reset after failing alignment #5."));
    }

    #[tokio::test]
    async fn test_guiding_failure_restarts_after_delay() {
        let (mut process, obs, clock) = process();
        let id = activate(&mut process, StepPipeline::GUIDE);
        process.start_guiding(false).await;
        assert_eq!(stage(&process, id), JobStage::Guiding);

        assert_eq!(process.handle_guide_status(GuideStatus::Aborted).await, FollowUp::Done);
        assert!(process.session().is_guiding_timer_active());
        assert!(process
            .log()
            .contains("Job 'M51' is guiding, guiding procedure will be restarted in 5 seconds."));

        // Nothing happens before the deadline
        assert_eq!(process.process_guiding_timer().await, FollowUp::Done);
        assert_eq!(obs.guide.call_count(methods::GUIDE), 1);

        clock.advance_secs(6);
        process.process_guiding_timer().await;
        assert!(!process.session().is_guiding_timer_active());
        assert_eq!(obs.guide.call_count(methods::GUIDE), 2);
    }

    #[tokio::test]
    async fn test_capture_waits_for_guiding() {
        let (mut process, obs, _clock) = process();
        let id = activate(&mut process, StepPipeline::GUIDE);
        process.set_stage(JobStage::GuidingComplete);

        process.start_capture(false).await;
        assert_eq!(stage(&process, id), JobStage::Guiding);
        assert_eq!(obs.capture.call_count(methods::START), 0);
        assert_eq!(obs.guide.call_count(methods::GUIDE), 1);
    }

    #[tokio::test]
    async fn test_capture_complete_finishes_job() {
        let (mut process, obs, _clock) = process();
        let id = activate(&mut process, StepPipeline::NONE);
        process.job_mut(id).unwrap().sequence_count = 3;
        process.start_capture(false).await;

        let loaded = obs.capture.calls();
        assert!(loaded.iter().any(|(m, args)| m == methods::LOAD_SEQUENCE_QUEUE
            && args.first() == Some(&json!("/seq/m51.json"))));
        assert!(process.log().contains("Job 'M51' capture is in progress..."));

        process.on_module_status(ModuleStatus::Capture(CaptureStatus::Complete)).await;
        let job = process.job(id).unwrap();
        assert_eq!(job.state(), JobState::Complete);
        assert_eq!(job.completed_count, 3);
        assert!(process.log().contains("Job 'M51' is complete."));
        assert!(process.active_job.is_none());
    }

    #[tokio::test]
    async fn test_capture_abort_restarts_without_reload() {
        let (mut process, obs, _clock) = process();
        let id = activate(&mut process, StepPipeline::NONE);
        process.start_capture(false).await;

        let follow = process.handle_capture_status(CaptureStatus::Aborted).await;
        assert_eq!(follow, FollowUp::Done);
        assert_eq!(stage(&process, id), JobStage::Capturing);
        assert_eq!(obs.capture.call_count(methods::START), 2);
        assert_eq!(obs.capture.call_count(methods::LOAD_SEQUENCE_QUEUE), 1);
    }

    #[tokio::test]
    async fn test_inactive_module_is_restarted() {
        let (mut process, obs, clock) = process();
        let id = activate(&mut process, StepPipeline::FOCUS);
        process.start_focusing().await;
        obs.focus.set_status(FocusStatus::Idle);
        process.session.last_polled_status = Some(json!("IDLE"));

        clock.advance_secs(121);
        assert_eq!(process.check_module_stage(JobStage::Focusing).await, FollowUp::Done);
        assert_eq!(process.session().failures.focus, 1);
        assert_eq!(obs.focus.call_count(methods::START), 2);
        assert_eq!(stage(&process, id), JobStage::Focusing);
    }

    #[tokio::test]
    async fn test_status_for_other_stage_is_ignored() {
        let (mut process, _obs, _clock) = process();
        let id = activate(&mut process, StepPipeline::ALIGN);
        process.set_stage(JobStage::Capturing);

        assert_eq!(process.handle_align_status(AlignStatus::Complete).await, FollowUp::Done);
        assert_eq!(stage(&process, id), JobStage::Capturing);
    }
}
