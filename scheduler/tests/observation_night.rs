//! End-to-end runs of the scheduler against the simulated observatory

use chrono::{DateTime, TimeZone, Utc};
use nightshade_scheduler::{
    CaptureSequence, CompletionCondition, GeoLocation, JobState, MemorySequenceSource, ObservationJob, SchedulerProcess,
    SchedulerSettings, SchedulerState, SequenceStep, SimulatedClock, SimulatedObservatory, SkyPoint, StepPipeline,
};
use nightshade_scheduler::device::methods;
use std::sync::Arc;
use std::time::Duration;

const MAX_ITERATIONS: usize = 1000;

fn midnight_palo_alto() -> DateTime<Utc> {
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

struct Night {
    process: SchedulerProcess,
    obs: SimulatedObservatory,
    clock: Arc<SimulatedClock>,
}

fn night(settings: SchedulerSettings) -> Night {
    let clock = Arc::new(SimulatedClock::new(midnight_palo_alto()));
    let source = Arc::new(MemorySequenceSource::new());
    source.insert(
        "/seq/m51.json",
        CaptureSequence::new(vec![SequenceStep::light("/data/M51/Light", 60.0, 3)]),
    );
    let obs = SimulatedObservatory::with_capture_sink(source.clone());
    let process = SchedulerProcess::new(settings, obs.modules(), clock.clone(), source);
    Night { process, obs, clock }
}

fn m51(steps: StepPipeline) -> ObservationJob {
    ObservationJob::new("M51", SkyPoint::from_degrees(202.47, 47.19))
        .with_sequence("/seq/m51.json")
        .with_steps(steps)
}

fn log_lines(process: &SchedulerProcess) -> Vec<String> {
    process.log().entries().map(|e| e.message.clone()).collect()
}

/// Iterate until `done` holds, moving simulated time along with each wait
async fn run_until(night: &mut Night, done: impl Fn(&SchedulerProcess) -> bool) -> bool {
    for _ in 0..MAX_ITERATIONS {
        if done(&night.process) {
            return true;
        }
        let wait = night.process.run_iteration().await.unwrap_or(Duration::from_secs(1));
        let step = wait.min(Duration::from_secs(3600));
        night.clock.advance(chrono::Duration::milliseconds(step.as_millis() as i64));
    }
    done(&night.process)
}

#[tokio::test]
async fn test_tracked_job_runs_to_completion() {
    let mut night = night(settings());
    let id = night.process.add_job(m51(StepPipeline::TRACK));

    night.process.start_scheduler().await;
    assert_eq!(night.process.state(), SchedulerState::Running);

    let completed = run_until(&mut night, |p| p.job(id).map(|j| j.state()) == Some(JobState::Complete)).await;
    assert!(completed, "job did not complete, log: {:?}", log_lines(&night.process));

    let log = night.process.log();
    assert!(log.contains("Ekos started."));
    assert!(log.contains("INDI devices connected."));
    assert!(log.contains("Job 'M51' is slewing to target."));
    assert!(log.contains("Job 'M51' is complete."));
    assert_eq!(night.obs.mount.call_count(methods::SLEW), 1);
    assert!(night.obs.capture.call_count(methods::START) >= 1);
}

#[tokio::test]
async fn test_full_pipeline_runs_every_step() {
    let mut night = night(settings());
    let id = night.process.add_job(m51(StepPipeline::all()));

    night.process.start_scheduler().await;
    let completed = run_until(&mut night, |p| p.job(id).map(|j| j.state()) == Some(JobState::Complete)).await;
    assert!(completed, "job did not complete, log: {:?}", log_lines(&night.process));

    assert!(night.obs.focus.call_count(methods::START) >= 1);
    assert!(night.obs.align.call_count(methods::CAPTURE_AND_SOLVE) >= 1);
    assert!(night.obs.guide.call_count(methods::GUIDE) >= 1);
    assert!(night.process.log().contains("Job 'M51' alignment is complete."));
}

#[tokio::test]
async fn test_repeated_job_counts_batches() {
    let mut night = night(settings());
    night
        .process
        .add_job(m51(StepPipeline::TRACK).with_completion(CompletionCondition::Repeat { count: 2 }));

    night.process.start_scheduler().await;
    let finished = run_until(&mut night, |p| {
        p.log().contains("Job 'M51' is complete after #2 batches.")
    })
    .await;
    assert!(finished, "batches did not finish, log: {:?}", log_lines(&night.process));
    assert!(night.process.log().contains("Job 'M51' is repeating, #1 batches remaining."));
    assert_eq!(night.obs.mount.call_count(methods::SLEW), 2);
}

#[tokio::test]
async fn test_saved_schedule_runs_after_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("night.json");

    let mut planner = night(settings());
    planner.process.add_job(m51(StepPipeline::TRACK));
    planner.process.save_schedule(&path).unwrap();

    let mut night = night(SchedulerSettings::default());
    assert_eq!(night.process.load_schedule(&path).unwrap(), 1);
    assert_eq!(night.process.settings().location.latitude, 37.44);
    let id = night.process.jobs()[0].id;

    night.process.start_scheduler().await;
    let completed = run_until(&mut night, |p| p.job(id).map(|j| j.state()) == Some(JobState::Complete)).await;
    assert!(completed, "job did not complete, log: {:?}", log_lines(&night.process));
}
