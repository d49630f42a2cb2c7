//! Diagnostic logging setup

use crate::error::{SchedulerError, SchedulerResult};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber: console output, plus a daily rolling
/// `scheduler.log` when `log_dir` is given. Keep the returned guard alive for
/// as long as file logging is wanted.
pub fn init_logging(log_dir: Option<&Path>) -> SchedulerResult<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let console_layer = fmt::layer().with_target(false).with_ansi(true);

    let Some(dir) = log_dir else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init()
            .map_err(|e| SchedulerError::InvalidConfig(format!("logging already initialised: {}", e)))?;
        tracing::info!("Scheduler logging initialized (console only)");
        return Ok(None);
    };

    std::fs::create_dir_all(dir)?;
    let file_appender = tracing_appender::rolling::daily(dir, "scheduler.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer().with_target(true).with_ansi(false).with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| SchedulerError::InvalidConfig(format!("logging already initialised: {}", e)))?;

    tracing::info!("Scheduler logging initialized, log directory: {}", dir.display());
    Ok(Some(guard))
}
