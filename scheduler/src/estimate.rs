//! Job duration estimation and capture bookkeeping

use crate::config::SchedulerSettings;
use crate::events::EventSink;
use crate::job::{
    CapturedFramesMap, CompletionCondition, ObservationJob, StartupCondition, StepPipeline,
    ESTIMATE_UNBOUNDED,
};
use crate::sequence::{CaptureSequence, FrameType, SequenceSource, UploadMode};
use crate::error::SchedulerResult;
use chrono::{DateTime, Utc};

/// Autofocus time per capture when the sequence focuses in-sequence, seconds
const AUTOFOCUS_SECS_PER_CAPTURE: f64 = 10.0;
/// Dither time per dithered capture, seconds
const DITHER_SECS: f64 = 15.0;

/// Fixed overhead of the pipeline steps before capture starts, seconds
pub fn time_heuristics(steps: StepPipeline, settings: &SchedulerSettings) -> f64 {
    let mut secs = 0.0;
    if steps.contains(StepPipeline::TRACK) {
        secs += 30.0;
    }
    if steps.contains(StepPipeline::FOCUS) {
        secs += 120.0;
    }
    if steps.contains(StepPipeline::ALIGN) {
        secs += 60.0;
    }
    if steps.contains(StepPipeline::GUIDE) {
        // Looping, star selection and settling
        secs += 15.0;
        secs += settings.dither_settle_secs;
        secs += settings.guiding_settle_secs;
        if settings.reset_guide_calibration {
            secs += 120.0;
        }
    }
    secs
}

/// Captures expected per repeat, keyed by signature, and their total
pub fn calculate_expected_captures(sequence: &CaptureSequence) -> (CapturedFramesMap, u32) {
    let mut expected = CapturedFramesMap::new();
    let mut total = 0;
    for step in &sequence.steps {
        *expected.entry(step.signature.clone()).or_insert(0) += step.count;
        total += step.count;
    }
    (expected, total)
}

/// Result of matching on-disk captures against the expected ones
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureProgress {
    /// Frames the capture module should consider already done, per signature
    pub capture_map: CapturedFramesMap,
    pub total_completed: u32,
    pub completed_iterations: u32,
}

pub fn fill_captured_frames_map(
    expected: &CapturedFramesMap,
    captured: &CapturedFramesMap,
    job: &ObservationJob,
    remember_progress: bool,
) -> CaptureProgress {
    let count_of = |key: &str| captured.get(key).copied().unwrap_or(0);
    let mut progress = CaptureProgress::default();

    let mut current_iteration = 0u32;
    if remember_progress {
        // Iteration of the least advanced signature
        let min_completed = expected
            .iter()
            .filter(|(_, &n)| n > 0)
            .map(|(key, &n)| count_of(key) / n)
            .min()
            .unwrap_or(0);
        current_iteration = match job.completion_condition() {
            CompletionCondition::Repeat { .. } if min_completed >= job.repeats_required => {
                job.repeats_required + 1
            }
            _ => min_completed + 1,
        };
        progress.completed_iterations = current_iteration.saturating_sub(1);
    } else {
        progress.completed_iterations = job.completed_iterations;
    }

    for (key, &per_repeat) in expected {
        let done = count_of(key);
        let already = if remember_progress {
            let diff = per_repeat as i64 * current_iteration as i64 - done as i64;
            if diff <= 0 {
                per_repeat
            } else if diff >= per_repeat as i64 {
                0
            } else {
                per_repeat - diff as u32
            }
        } else {
            0
        };
        progress.capture_map.insert(key.clone(), already);

        progress.total_completed += match job.completion_condition() {
            CompletionCondition::Loop => done,
            _ => done.min(per_repeat * job.repeats_required),
        };
    }
    progress
}

/// Whether the job still has light frames to take
pub fn update_light_frames_required(
    job: &mut ObservationJob,
    sequence: &CaptureSequence,
    captured: &CapturedFramesMap,
) {
    job.light_frames_required = match job.completion_condition() {
        CompletionCondition::Sequence | CompletionCondition::Repeat { .. } => {
            let (expected, _) = calculate_expected_captures(sequence);
            sequence.steps.iter().any(|step| {
                step.frame_type == FrameType::Light
                    && expected.get(&step.signature).copied().unwrap_or(0) * job.repeats_required
                        > captured.get(&step.signature).copied().unwrap_or(0)
            })
        }
        _ => true,
    };
}

/// Capture counts on disk for every signature of a sequence
pub fn captured_counts(source: &dyn SequenceSource, sequence: &CaptureSequence, into: &mut CapturedFramesMap) {
    for step in &sequence.steps {
        if !into.contains_key(&step.signature) {
            into.insert(step.signature.clone(), source.count_captured(&step.signature));
        }
    }
}

/// Estimate how long the job needs, storing the result in `job.estimated_time`.
///
/// Fails only when the sequence cannot be loaded.
pub fn estimate_job_time(
    job: &mut ObservationJob,
    source: &dyn SequenceSource,
    captured: &CapturedFramesMap,
    settings: &SchedulerSettings,
    now: DateTime<Utc>,
    events: &mut EventSink,
) -> SchedulerResult<()> {
    let sequence = match source.load_sequence(&job.sequence_file) {
        Ok(sequence) => sequence,
        Err(e) => {
            tracing::warn!(
                "Failed estimating the duration of job '{}', its sequence file is invalid: {}",
                job.name,
                e
            );
            return Err(e);
        }
    };

    job.in_sequence_focus = sequence.autofocus_in_sequence;
    job.initial_filter = sequence
        .steps
        .first()
        .filter(|s| s.frame_type == FrameType::Light)
        .and_then(|s| s.filter.clone());

    if sequence.autofocus_in_sequence && !job.steps.contains(StepPipeline::FOCUS) && !job.focus_warning_logged {
        events.append_log(
            now,
            format!(
                "Warning: Job '{}' has its focus step disabled, periodic and/or HFR procedures currently set in its sequence will not occur.",
                job.name
            ),
        );
        job.focus_warning_logged = true;
    }

    let remember = settings.remember_job_progress;
    let (expected, captures_per_repeat) = calculate_expected_captures(&sequence);
    let progress = fill_captured_frames_map(&expected, captured, job, remember);
    job.completed_iterations = progress.completed_iterations;
    update_light_frames_required(job, &sequence, captured);

    let mut total_imaging = 0.0f64;
    for (index, step) in sequence.steps.iter().enumerate() {
        let label = format!("Job '{}' {}x{}\"", job.name, step.count, step.exposure_secs);

        if step.upload_mode == UploadMode::Remote {
            tracing::info!("{} duration cannot be estimated since the sequence saves the files remotely.", label);
            job.estimated_time = ESTIMATE_UNBOUNDED;
            job.captured_frames = progress.capture_map;
            return Ok(());
        }

        let mut required = step.count * job.repeats_required;
        let mut completed = captured.get(&step.signature).copied().unwrap_or(0);

        if remember && job.completion_condition() != CompletionCondition::Loop {
            required = expected.get(&step.signature).copied().unwrap_or(0) * job.repeats_required;
            // A signature revisited later in the same sequence is accounted for by its first occurrence
            if sequence.steps[..index].iter().any(|s| s.signature == step.signature) {
                required = 0;
            }
            tracing::debug!("{} has completed {}/{} of its required captures.", label, completed, required);
        } else if captures_per_repeat > 0 {
            completed = job.completed_count / captures_per_repeat * step.count;
        } else {
            completed = 0;
        }

        let captures_complete = required == 0 || completed >= required;
        if step.frame_type != FrameType::Light {
            tracing::debug!("{} captures calibration frames.", label);
        }

        if !captures_complete || job.completion_condition() == CompletionCondition::Loop {
            let to_go = required.saturating_sub(completed) as f64;
            let secs_per_capture = step.exposure_secs + step.delay_ms as f64 / 1000.0;
            total_imaging += (secs_per_capture * to_go).abs();

            if step.frame_type == FrameType::Light {
                if sequence.autofocus_in_sequence {
                    total_imaging += to_go * AUTOFOCUS_SECS_PER_CAPTURE;
                }
                if job.steps.contains(StepPipeline::GUIDE) && settings.dither_enabled {
                    total_imaging += (to_go * DITHER_SECS) / settings.dither_frames.max(1) as f64;
                }
            }
        }
    }

    job.captured_frames = progress.capture_map;
    job.sequence_count = captures_per_repeat * job.repeats_required;
    if remember {
        job.completed_count = progress.total_completed;
    }

    let heuristics = if job.light_frames_required {
        time_heuristics(job.steps, settings)
    } else {
        0.0
    };
    job.estimated_startup_secs = heuristics as i64;

    let fixed_start = match job.startup_condition {
        StartupCondition::At { time } => Some(time),
        _ => None,
    };

    job.estimated_time = match (job.completion_condition(), fixed_start) {
        (CompletionCondition::Loop, _) => {
            tracing::debug!("Job '{}' is configured to loop until the scheduler is stopped manually.", job.name);
            ESTIMATE_UNBOUNDED
        }
        (CompletionCondition::At { time }, Some(start)) => (time - start).num_seconds(),
        (CompletionCondition::At { time }, None) => (time - now).num_seconds(),
        _ if total_imaging <= 0.0 => {
            tracing::debug!(
                "Job '{}' will not run, complete with {}/{} captures.",
                job.name,
                job.completed_count,
                job.sequence_count
            );
            0
        }
        _ => {
            let secs = (total_imaging + heuristics).ceil() as i64;
            tracing::info!("Job '{}' estimated to take {}s to complete.", job.name, secs);
            secs
        }
    };
    Ok(())
}
