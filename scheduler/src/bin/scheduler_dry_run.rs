//! Run a schedule file against the simulated observatory, printing the
//! scheduler log as it goes.

use anyhow::{Context, Result};
use clap::Parser;
use nightshade_scheduler::sequence::SequenceSource;
use nightshade_scheduler::{
    init_logging, Clock, FileSequenceSource, MemorySequenceSource, ScheduleDocument, SchedulerEvent,
    SchedulerHandle, SchedulerProcess, SchedulerSettings, SimulatedObservatory, SystemClock,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// Dry run of an observation schedule
#[derive(Debug, Parser)]
#[command(name = "scheduler-dry-run")]
struct Cli {
    /// Schedule file (JSON)
    schedule: PathBuf,

    /// Scheduler settings (JSON); defaults apply when omitted
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Simulated seconds per real second
    #[arg(long, default_value_t = 60.0)]
    scale: f64,

    /// Give up after this many real seconds
    #[arg(long, default_value_t = 600)]
    timeout_secs: u64,

    /// Directory for the rolling log file
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_dir.as_deref())?;

    let settings = match &cli.settings {
        Some(path) => SchedulerSettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => SchedulerSettings::default(),
    };
    let document = ScheduleDocument::read(&cli.schedule)
        .with_context(|| format!("reading schedule {}", cli.schedule.display()))?;

    // Sequences are read once; the simulated camera records its captures in memory
    let files = FileSequenceSource::new();
    let sequences = Arc::new(MemorySequenceSource::new());
    for def in &document.jobs {
        let sequence = files
            .load_sequence(&def.sequence_file)
            .with_context(|| format!("loading sequence of job '{}'", def.name))?;
        sequences.insert(def.sequence_file.clone(), sequence);
    }

    let observatory = SimulatedObservatory::with_capture_sink(sequences.clone());
    let clock = Arc::new(SystemClock::new());
    clock.set_scale(cli.scale);

    let process = SchedulerProcess::new(settings, observatory.modules(), clock, sequences);
    let handle = SchedulerHandle::spawn(process);
    let mut events = handle.subscribe();

    let count = handle.load_schedule(&cli.schedule).await?;
    println!("Loaded {} jobs from {}", count, cli.schedule.display());
    handle.start().await?;

    let deadline = tokio::time::sleep(Duration::from_secs(cli.timeout_secs));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => {
                println!("Dry run timed out after {} seconds", cli.timeout_secs);
                break;
            }
            event = events.recv() => match event {
                Ok(SchedulerEvent::Log { timestamp, message }) => {
                    println!("{} {}", timestamp.format("%Y-%m-%d %H:%M:%S"), message);
                }
                Ok(SchedulerEvent::Stopped) | Err(RecvError::Closed) => break,
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => tracing::warn!("Missed {} scheduler events", missed),
            }
        }
    }

    for job in handle.jobs().await? {
        println!("{:<24} {}", job.name, job.state);
    }
    handle.shutdown().await?;
    Ok(())
}
