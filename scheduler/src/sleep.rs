//! Sleep/wake decisions for a job that is selected but not yet due

use crate::config::SchedulerSettings;
use crate::job::{ObservationJob, StepPipeline};
use crate::session::{ParkWaitState, StartupState};
use chrono::{DateTime, Duration, Utc};

/// Real milliseconds until `until`, plus one second of margin, at the given clock scale
pub fn wakeup_interval_ms(now: DateTime<Utc>, until: DateTime<Utc>, scale: f64) -> i64 {
    let secs = (until - now).num_seconds().max(0);
    let scale = if scale.is_finite() && scale > 0.0 { scale } else { 1.0 };
    (((secs + 1) * 1000) as f64 / scale).round() as i64
}

/// What to do while waiting for the selected job
#[derive(Debug, Clone, PartialEq)]
pub enum SleepDecision {
    /// The job is due, go ahead
    Proceed,
    /// Shut the observatory down and start up again at `wakeup`
    PreemptiveShutdown { wakeup: DateTime<Utc> },
    /// Park the mount until the job is ready
    ParkAndWait,
    /// Idle until `until`
    Sleep { until: DateTime<Utc>, interval_ms: i64 },
}

/// The decision and the log lines explaining it
#[derive(Debug, Clone, PartialEq)]
pub struct SleepPlan {
    pub decision: SleepDecision,
    pub messages: Vec<String>,
}

impl SleepPlan {
    fn proceed() -> Self {
        Self {
            decision: SleepDecision::Proceed,
            messages: Vec::new(),
        }
    }
}

/// Conditions the decision depends on besides the job itself
#[derive(Debug, Clone, Copy)]
pub struct SleepContext {
    pub now: DateTime<Utc>,
    pub scale: f64,
    pub startup: StartupState,
    pub park_wait: ParkWaitState,
}

/// Decide how to wait for `job`
pub fn plan_sleep(job: &ObservationJob, settings: &SchedulerSettings, ctx: &SleepContext) -> SleepPlan {
    let Some(startup) = job.startup_time else {
        return SleepPlan::proceed();
    };
    let wait = (startup - ctx.now).num_seconds();
    let lead = settings.lead_time_secs();
    if wait <= lead {
        return SleepPlan::proceed();
    }

    let when = startup.format("%Y-%m-%d %H:%M:%S");
    let startup_done = ctx.startup == StartupState::Complete;

    if startup_done && settings.preemptive_shutdown && wait > settings.preemptive_shutdown_secs() {
        return SleepPlan {
            decision: SleepDecision::PreemptiveShutdown { wakeup: startup },
            messages: vec![format!(
                "Job '{}' scheduled for execution at {}. Observatory scheduled for shutdown until next job is ready.",
                job.name, when
            )],
        };
    }

    if startup_done
        && ctx.park_wait == ParkWaitState::Idle
        && job.steps.contains(StepPipeline::TRACK)
        && settings.procedure.park_mount
    {
        return SleepPlan {
            decision: SleepDecision::ParkAndWait,
            messages: vec![format!(
                "Job '{}' scheduled for execution at {}. Parking the mount until the job is ready.",
                job.name, when
            )],
        };
    }

    let until = startup + Duration::seconds(1);
    let mut messages = vec![format!(
        "Sleeping until observation job {} is ready at {}...",
        job.name,
        until.format("%Y-%m-%d %H:%M:%S")
    )];
    if wait > lead * 12 && !settings.preemptive_shutdown {
        let hours = wait / 3600;
        let mins = (wait % 3600) / 60;
        messages.push(format!(
            "Warning: Next observation job is scheduled in {}h{:02}m; it is recommended to enable pre-emptive shutdown.",
            hours, mins
        ));
    }
    SleepPlan {
        decision: SleepDecision::Sleep {
            until,
            interval_ms: wakeup_interval_ms(ctx.now, startup, ctx.scale),
        },
        messages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::astro::SkyPoint;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 4, 17, 7, 0, 0).unwrap()
    }

    fn ctx(startup: StartupState) -> SleepContext {
        SleepContext {
            now: now(),
            scale: 1.0,
            startup,
            park_wait: ParkWaitState::Idle,
        }
    }

    fn job_at(offset_secs: i64) -> ObservationJob {
        let mut job = ObservationJob::new("M51", SkyPoint::new(13.5, 47.2));
        job.startup_time = Some(now() + Duration::seconds(offset_secs));
        job
    }

    #[test]
    fn test_wakeup_interval() {
        let until = now() + Duration::seconds(99);
        assert_eq!(wakeup_interval_ms(now(), until, 1.0), 100_000);
        assert_eq!(wakeup_interval_ms(now(), until, 10.0), 10_000);
        assert_eq!(wakeup_interval_ms(now(), until, 0.0), 100_000);
        assert_eq!(wakeup_interval_ms(now(), now() - Duration::seconds(5), 1.0), 1000);
    }

    #[test]
    fn test_due_job_proceeds() {
        let settings = SchedulerSettings::default();
        let plan = plan_sleep(&job_at(60), &settings, &ctx(StartupState::Idle));
        assert_eq!(plan.decision, SleepDecision::Proceed);
        assert!(plan.messages.is_empty());
    }

    #[test]
    fn test_sleep_until_job() {
        let settings = SchedulerSettings::default();
        let job = job_at(3600).with_steps(StepPipeline::NONE);
        let plan = plan_sleep(&job, &settings, &ctx(StartupState::Complete));
        match plan.decision {
            SleepDecision::Sleep { until, interval_ms } => {
                assert_eq!(until, now() + Duration::seconds(3601));
                assert_eq!(interval_ms, 3_601_000);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(plan.messages[0].starts_with("Sleeping until observation job M51"));
        assert_eq!(plan.messages.len(), 1);
    }

    #[test]
    fn test_long_sleep_warns() {
        let settings = SchedulerSettings::default();
        let job = job_at(5 * 3600).with_steps(StepPipeline::NONE);
        let plan = plan_sleep(&job, &settings, &ctx(StartupState::Idle));
        assert_eq!(plan.messages.len(), 2);
        assert!(plan.messages[1].contains("5h00m"));
    }

    #[test]
    fn test_preemptive_shutdown() {
        let settings = SchedulerSettings {
            preemptive_shutdown: true,
            preemptive_shutdown_hours: 2.0,
            ..SchedulerSettings::default()
        };
        let job = job_at(3 * 3600);
        let plan = plan_sleep(&job, &settings, &ctx(StartupState::Complete));
        assert_eq!(
            plan.decision,
            SleepDecision::PreemptiveShutdown {
                wakeup: now() + Duration::hours(3)
            }
        );

        // Startup not complete: nothing to shut down
        let plan = plan_sleep(&job, &settings, &ctx(StartupState::Idle));
        assert!(matches!(plan.decision, SleepDecision::Sleep { .. }));
    }

    #[test]
    fn test_park_and_wait_needs_tracking() {
        let mut settings = SchedulerSettings::default();
        settings.procedure.park_mount = true;

        let tracked = job_at(1800).with_steps(StepPipeline::TRACK);
        let plan = plan_sleep(&tracked, &settings, &ctx(StartupState::Complete));
        assert_eq!(plan.decision, SleepDecision::ParkAndWait);

        let untracked = job_at(1800).with_steps(StepPipeline::NONE);
        let plan = plan_sleep(&untracked, &settings, &ctx(StartupState::Complete));
        assert!(matches!(plan.decision, SleepDecision::Sleep { .. }));
    }
}
