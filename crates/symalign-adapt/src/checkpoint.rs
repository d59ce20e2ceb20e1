//! Checksummed, atomically written checkpoints of the adaptation state

use crate::adapter::AdapterSpec;
use crate::budget::ParameterBudget;
use crate::state::AdaptationState;
use crate::{AdaptError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use xxhash_rust::xxh3::xxh3_64;

/// Checkpoint settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Where periodic checkpoints are written
    pub path: Option<PathBuf>,
    /// Write every N committed steps (0 disables periodic writes)
    pub interval: u64,
    /// Resume from this checkpoint at init
    pub resume_from: Option<PathBuf>,
    /// Treat an unreadable resume checkpoint as fatal
    pub strict_resume: bool,
}

impl CheckpointConfig {
    /// Periodic checkpoints to `path`
    pub fn every(path: impl Into<PathBuf>, interval: u64) -> Self {
        Self {
            path: Some(path.into()),
            interval,
            ..Default::default()
        }
    }

    /// Set resume path
    pub fn resume_from(mut self, path: impl Into<PathBuf>) -> Self {
        self.resume_from = Some(path.into());
        self
    }

    /// Set strict resume
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict_resume = strict;
        self
    }
}

/// What a checkpoint restores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointBody {
    pub adapter_spec: AdapterSpec,
    /// Budget the spec was resolved from, if any
    pub budget: Option<ParameterBudget>,
    pub state: AdaptationState,
}

/// On-disk record
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    format_version: u32,
    /// xxh3-64 of the compact JSON of `body`
    checksum: u64,
    body: CheckpointBody,
}

/// Current checkpoint format version
pub const FORMAT_VERSION: u32 = 1;

fn checksum(body: &CheckpointBody) -> Result<u64> {
    let bytes = serde_json::to_vec(body)?;
    Ok(xxh3_64(&bytes))
}

/// Reads and writes checkpoint files
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Store writing to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Checkpoint path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Save atomically: write to a temp file, then rename over the target
    pub fn save(&self, body: &CheckpointBody) -> Result<()> {
        let envelope = Envelope {
            format_version: FORMAT_VERSION,
            checksum: checksum(body)?,
            body: body.clone(),
        };

        let temp_path = self.path.with_extension("tmp");
        {
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &envelope)?;
            writer.flush()?;
        }
        fs::rename(&temp_path, &self.path)?;

        info!(
            path = %self.path.display(),
            step = body.state.step,
            "Checkpoint written"
        );
        Ok(())
    }

    /// Load and verify a checkpoint
    pub fn load(path: &Path) -> Result<CheckpointBody> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let envelope: Envelope = serde_json::from_reader(reader)
            .map_err(|e| AdaptError::CheckpointCorruption(format!("failed to parse checkpoint: {}", e)))?;

        if envelope.format_version != FORMAT_VERSION {
            return Err(AdaptError::CheckpointCorruption(format!(
                "checkpoint version mismatch: expected {}, got {}",
                FORMAT_VERSION, envelope.format_version
            )));
        }

        let actual = checksum(&envelope.body)?;
        if actual != envelope.checksum {
            return Err(AdaptError::CheckpointCorruption(format!(
                "checksum mismatch: stored {:016x}, computed {:016x}",
                envelope.checksum, actual
            )));
        }

        Ok(envelope.body)
    }
}
