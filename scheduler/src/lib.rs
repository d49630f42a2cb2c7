//! Observation Scheduler
//!
//! Picks, out of a queue of observation jobs, the one to run next under
//! altitude, twilight, moon and weather constraints, then drives the
//! observatory through startup, slew, focus, alignment, guiding, capture and
//! shutdown using pluggable device modules.

pub mod astro;
pub mod clock;
pub mod config;
pub mod constraints;
pub mod device;
pub mod engine;
pub mod error;
pub mod estimate;
pub mod events;
pub mod job;
pub mod logging;
pub mod mosaic;
pub mod persistence;
pub mod process;
pub mod runner;
pub mod script;
pub mod sequence;
pub mod session;
pub mod sleep;

mod pipeline;
mod procedures;

pub use astro::SkyPoint;
pub use clock::{Clock, SharedClock, SimulatedClock, SystemClock};
pub use config::{ErrorHandlingStrategy, GeoLocation, ProcedureConfig, SchedulerSettings, SchedulerTimeouts};
pub use device::{DeviceModule, DeviceModules, ModuleKind, ModuleStatus, SimulatedModule, SimulatedObservatory};
pub use engine::{EvaluationOutcome, JobEvaluator};
pub use error::{DeviceError, DeviceResult, SchedulerError, SchedulerResult};
pub use events::{LogEntry, SchedulerEvent};
pub use job::{CompletionCondition, JobDefinition, JobStage, JobState, ObservationJob, StartupCondition, StepPipeline};
pub use logging::init_logging;
pub use mosaic::{mosaic_jobs, mosaic_tiles, MosaicGrid, MosaicTile};
pub use persistence::ScheduleDocument;
pub use process::SchedulerProcess;
pub use runner::{JobSummary, SchedulerCommand, SchedulerHandle};
pub use sequence::{CaptureSequence, FileSequenceSource, MemorySequenceSource, SequenceSource, SequenceStep};
pub use session::SchedulerState;

/// Attempts allowed for every retried operation before giving up
pub const MAX_FAILURE_ATTEMPTS: u8 = 5;
