//! Capture sequence collaborator
//!
//! The scheduler does not capture anything itself; it only needs to know what
//! a job's sequence file asks for and how many of those frames already exist.

use crate::error::{SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameType {
    Light,
    Dark,
    Bias,
    Flat,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadMode {
    #[default]
    Local,
    Remote,
    Both,
}

/// One sub-sequence of a capture sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceStep {
    pub exposure_secs: f64,
    pub count: u32,
    #[serde(default)]
    pub delay_ms: u64,
    pub frame_type: FrameType,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub upload_mode: UploadMode,
    /// Storage path prefix of the produced files
    pub signature: String,
}

impl SequenceStep {
    pub fn light(signature: impl Into<String>, exposure_secs: f64, count: u32) -> Self {
        Self {
            exposure_secs,
            count,
            delay_ms: 0,
            frame_type: FrameType::Light,
            filter: None,
            upload_mode: UploadMode::Local,
            signature: signature.into(),
        }
    }

    pub fn with_frame_type(mut self, frame_type: FrameType) -> Self {
        self.frame_type = frame_type;
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_upload_mode(mut self, mode: UploadMode) -> Self {
        self.upload_mode = mode;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CaptureSequence {
    /// Autofocus runs between captures
    #[serde(default)]
    pub autofocus_in_sequence: bool,
    pub steps: Vec<SequenceStep>,
}

impl CaptureSequence {
    pub fn new(steps: Vec<SequenceStep>) -> Self {
        Self {
            autofocus_in_sequence: false,
            steps,
        }
    }

    pub fn parse(path: &Path, contents: &str) -> SchedulerResult<Self> {
        let sequence: CaptureSequence =
            serde_json::from_str(contents).map_err(|e| SchedulerError::InvalidSequence {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        if sequence.steps.is_empty() {
            return Err(SchedulerError::InvalidSequence {
                path: path.display().to_string(),
                reason: "sequence has no steps".to_string(),
            });
        }
        Ok(sequence)
    }

    pub fn first_filter(&self) -> Option<&str> {
        self.steps.iter().find_map(|s| s.filter.as_deref())
    }
}

/// Access to capture sequences and the frames they already produced
pub trait SequenceSource: Send + Sync {
    fn load_sequence(&self, path: &Path) -> SchedulerResult<CaptureSequence>;

    /// Number of files already captured under a storage signature
    fn count_captured(&self, signature: &str) -> u32;
}

pub type SharedSequenceSource = Arc<dyn SequenceSource>;

/// Sequences stored as JSON files, captures counted on disk
#[derive(Debug, Clone, Default)]
pub struct FileSequenceSource;

impl FileSequenceSource {
    pub fn new() -> Self {
        Self
    }
}

impl SequenceSource for FileSequenceSource {
    fn load_sequence(&self, path: &Path) -> SchedulerResult<CaptureSequence> {
        let contents = std::fs::read_to_string(path).map_err(|e| SchedulerError::SequenceInaccessible {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        CaptureSequence::parse(path, &contents)
    }

    fn count_captured(&self, signature: &str) -> u32 {
        let signature = PathBuf::from(signature);
        let (Some(dir), Some(prefix)) = (signature.parent(), signature.file_name()) else {
            return 0;
        };
        let prefix = prefix.to_string_lossy();

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("Cannot list {}: {}", dir.display(), e);
                return 0;
            }
        };

        entries
            .filter_map(Result::ok)
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter(|e| e.file_name().to_string_lossy().starts_with(prefix.as_ref()))
            .count() as u32
    }
}

/// In-memory sequences and capture counts, for dry runs and tests
#[derive(Default)]
pub struct MemorySequenceSource {
    sequences: Mutex<HashMap<PathBuf, CaptureSequence>>,
    captured: Mutex<HashMap<String, u32>>,
}

impl MemorySequenceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, sequence: CaptureSequence) {
        if let Ok(mut sequences) = self.sequences.lock() {
            sequences.insert(path.into(), sequence);
        }
    }

    pub fn set_captured(&self, signature: impl Into<String>, count: u32) {
        if let Ok(mut captured) = self.captured.lock() {
            captured.insert(signature.into(), count);
        }
    }

    pub fn add_captured(&self, signature: &str, count: u32) {
        if let Ok(mut captured) = self.captured.lock() {
            *captured.entry(signature.to_string()).or_insert(0) += count;
        }
    }
}

impl SequenceSource for MemorySequenceSource {
    fn load_sequence(&self, path: &Path) -> SchedulerResult<CaptureSequence> {
        self.sequences
            .lock()
            .ok()
            .and_then(|s| s.get(path).cloned())
            .ok_or_else(|| SchedulerError::SequenceInaccessible {
                path: path.display().to_string(),
                reason: "no such sequence".to_string(),
            })
    }

    fn count_captured(&self, signature: &str) -> u32 {
        self.captured
            .lock()
            .ok()
            .and_then(|c| c.get(signature).copied())
            .unwrap_or(0)
    }
}
