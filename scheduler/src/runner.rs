//! Background task driving a [`SchedulerProcess`]
//!
//! The process is owned by a single tokio task. Callers talk to it through a
//! [`SchedulerHandle`]: commands go in over an mpsc channel, events come out
//! of the broadcast channel.

use crate::device::{ModuleKind, ModuleStatus, WeatherStatus};
use crate::error::{SchedulerError, SchedulerResult};
use crate::events::SchedulerEvent;
use crate::job::{JobDefinition, JobStage, JobState, ObservationJob};
use crate::process::SchedulerProcess;
use crate::session::SchedulerState;
use std::path::PathBuf;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Commands accepted by the scheduler task
#[derive(Debug)]
pub enum SchedulerCommand {
    Start,
    Stop,
    Pause,
    /// Evaluate the queue without executing anything
    Evaluate,
    SetClockScale(f64),
    ModuleStatus(ModuleStatus),
    WeatherStatus(WeatherStatus),
    DeviceReady { module: ModuleKind, ready: bool },
    StartupProcedure,
    ShutdownProcedure,
    AddJob {
        definition: JobDefinition,
        reply: oneshot::Sender<Uuid>,
    },
    Jobs {
        reply: oneshot::Sender<Vec<JobSummary>>,
    },
    LoadSchedule {
        path: PathBuf,
        reply: oneshot::Sender<SchedulerResult<usize>>,
    },
    SaveSchedule {
        path: PathBuf,
        reply: oneshot::Sender<SchedulerResult<()>>,
    },
    /// Stop the task
    Shutdown,
}

/// Snapshot of one queued job
#[derive(Debug, Clone, PartialEq)]
pub struct JobSummary {
    pub id: Uuid,
    pub name: String,
    pub state: JobState,
    pub stage: JobStage,
}

/// Handle to a running scheduler task
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
    event_tx: broadcast::Sender<SchedulerEvent>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Move `process` onto its own task. Must be called from within a tokio runtime.
    pub fn spawn(process: SchedulerProcess) -> Self {
        let (command_tx, command_rx) = mpsc::channel(32);
        let event_tx = process.events.sender();
        let task = tokio::spawn(run(process, command_rx));
        Self {
            command_tx,
            event_tx,
            task,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    pub async fn send(&self, command: SchedulerCommand) -> SchedulerResult<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SchedulerError::ChannelClosed)
    }

    pub async fn start(&self) -> SchedulerResult<()> {
        self.send(SchedulerCommand::Start).await
    }

    pub async fn stop(&self) -> SchedulerResult<()> {
        self.send(SchedulerCommand::Stop).await
    }

    pub async fn pause(&self) -> SchedulerResult<()> {
        self.send(SchedulerCommand::Pause).await
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand) -> SchedulerResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| SchedulerError::ChannelClosed)
    }

    pub async fn add_job(&self, definition: JobDefinition) -> SchedulerResult<Uuid> {
        self.request(|reply| SchedulerCommand::AddJob { definition, reply }).await
    }

    pub async fn jobs(&self) -> SchedulerResult<Vec<JobSummary>> {
        self.request(|reply| SchedulerCommand::Jobs { reply }).await
    }

    pub async fn load_schedule(&self, path: impl Into<PathBuf>) -> SchedulerResult<usize> {
        let path = path.into();
        self.request(|reply| SchedulerCommand::LoadSchedule { path, reply }).await?
    }

    pub async fn save_schedule(&self, path: impl Into<PathBuf>) -> SchedulerResult<()> {
        let path = path.into();
        self.request(|reply| SchedulerCommand::SaveSchedule { path, reply }).await?
    }

    /// Stop the task and wait for it to exit
    pub async fn shutdown(self) -> SchedulerResult<()> {
        let _ = self.command_tx.send(SchedulerCommand::Shutdown).await;
        self.task.await.map_err(|e| SchedulerError::Io(std::io::Error::other(e)))
    }
}

async fn run(mut process: SchedulerProcess, mut command_rx: mpsc::Receiver<SchedulerCommand>) {
    tracing::info!("Scheduler task started");
    let mut deadline: Option<Instant> = None;

    loop {
        let wake_at = deadline;
        let tick = async move {
            match wake_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            command = command_rx.recv() => {
                let Some(command) = command else {
                    break;
                };
                if matches!(command, SchedulerCommand::Shutdown) {
                    break;
                }
                apply(&mut process, command).await;

                // Commands that set up an iteration reschedule the loop
                if process.session.iteration_setup {
                    process.session.iteration_setup = false;
                    deadline = process.next_interval().map(|d| Instant::now() + d);
                } else if deadline.is_none() {
                    deadline = process.next_interval().map(|d| Instant::now() + d);
                }
            }
            _ = tick => {
                deadline = process.run_iteration().await.map(|d| Instant::now() + d);
            }
        }
    }

    if process.state() != SchedulerState::Idle {
        process.stop_scheduler().await;
    }
    tracing::info!("Scheduler task exiting");
}

async fn apply(process: &mut SchedulerProcess, command: SchedulerCommand) {
    tracing::debug!("Scheduler command: {:?}", command);
    match command {
        SchedulerCommand::Start => process.start_scheduler().await,
        SchedulerCommand::Stop => process.stop_scheduler().await,
        SchedulerCommand::Pause => process.pause_scheduler(),
        SchedulerCommand::Evaluate => {
            process.evaluate_jobs(true);
        }
        SchedulerCommand::SetClockScale(scale) => process.set_clock_scale(scale),
        SchedulerCommand::ModuleStatus(status) => process.on_module_status(status).await,
        SchedulerCommand::WeatherStatus(status) => process.set_weather_status(status).await,
        SchedulerCommand::DeviceReady { module, ready } => process.set_device_ready(module, ready),
        SchedulerCommand::StartupProcedure => process.run_startup_procedure().await,
        SchedulerCommand::ShutdownProcedure => process.run_shutdown_procedure().await,
        SchedulerCommand::AddJob { definition, reply } => {
            let id = process.add_job(ObservationJob::from_definition(&definition));
            let _ = reply.send(id);
        }
        SchedulerCommand::Jobs { reply } => {
            let jobs = process
                .jobs()
                .iter()
                .map(|j| JobSummary {
                    id: j.id,
                    name: j.name.clone(),
                    state: j.state(),
                    stage: j.stage,
                })
                .collect();
            let _ = reply.send(jobs);
        }
        SchedulerCommand::LoadSchedule { path, reply } => {
            let _ = reply.send(process.load_schedule(&path));
        }
        SchedulerCommand::SaveSchedule { path, reply } => {
            let _ = reply.send(process.save_schedule(&path));
        }
        SchedulerCommand::Shutdown => {}
    }
}
