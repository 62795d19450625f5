//! Reader for the Pico sensor snapshot file
//!
//! The udev hook drops a JSON object keyed by slot index; each entry is
//! one sensor reading. The file is consumed on read so a stale snapshot
//! is never applied twice.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One sensor reading as the Pico firmware reports it. Only the fields
/// the mapping consumes are modeled; unknown keys are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorReading {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "currentLevel")]
    pub current_level: Option<f64>,
    #[serde(default, rename = "currentVolume")]
    pub current_volume: Option<f64>,
    #[serde(default)]
    pub voltage: Option<f64>,
    #[serde(default)]
    pub current: Option<f64>,
    #[serde(default, rename = "stateOfCharge")]
    pub state_of_charge: Option<f64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default, rename = "capacity.timeRemaining")]
    pub time_remaining: Option<f64>,
}

/// Readings keyed by their slot index ("0", "1", ...).
pub type Snapshot = BTreeMap<String, SensorReading>;

pub struct SnapshotReader {
    path: PathBuf,
}

impl SnapshotReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Latest snapshot, or `None` when the sensor has not produced one
    /// since the last read.
    pub fn read(&self) -> Result<Option<Snapshot>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).context(format!("failed to read {}", self.path.display()));
            }
        };
        let snapshot: Snapshot = serde_json::from_str(&contents)
            .context(format!("failed to parse {}", self.path.display()))?;
        if let Err(e) = fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "could not remove consumed snapshot");
        }
        Ok(Some(snapshot))
    }
}
