//! JSON snapshot of the store and queue

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::CoreError;
use crate::machine::{Machine, ReservationRecord};
use crate::store::MachineStore;
use crate::task::Task;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub version: u32,
    pub taken_at: DateTime<Utc>,
    pub machines: Vec<Machine>,
    #[serde(default)]
    pub reservation_history: HashMap<String, Vec<ReservationRecord>>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl EngineSnapshot {
    pub const VERSION: u32 = 1;

    #[must_use]
    pub fn new(
        machines: Vec<Machine>,
        reservation_history: HashMap<String, Vec<ReservationRecord>>,
        tasks: Vec<Task>,
    ) -> Self {
        Self {
            version: Self::VERSION,
            taken_at: Utc::now(),
            machines,
            reservation_history,
            tasks,
        }
    }

    /// Write atomically: temp file in the same directory, then rename
    ///
    /// # Errors
    /// Returns `CoreError::Persistence` on serialization or I/O failure
    pub async fn save(&self, path: &Path) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec_pretty(self).map_err(persistence)?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(persistence)?;
        }
        let tmp = temp_path(path);
        tokio::fs::write(&tmp, &bytes).await.map_err(persistence)?;
        tokio::fs::rename(&tmp, path).await.map_err(persistence)?;
        debug!(
            path = %path.display(),
            machines = self.machines.len(),
            tasks = self.tasks.len(),
            "Snapshot written"
        );
        Ok(())
    }

    /// Read a snapshot; a missing file is `Ok(None)`
    ///
    /// # Errors
    /// Returns `CoreError::Persistence` if the file exists but cannot be read
    /// or parsed, or has an unsupported version
    pub async fn load(path: &Path) -> Result<Option<Self>, CoreError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(persistence(e)),
        };
        let snapshot: Self = serde_json::from_slice(&bytes).map_err(persistence)?;
        if snapshot.version != Self::VERSION {
            return Err(CoreError::Persistence(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        info!(
            path = %path.display(),
            taken_at = %snapshot.taken_at,
            machines = snapshot.machines.len(),
            tasks = snapshot.tasks.len(),
            "Snapshot loaded"
        );
        Ok(Some(snapshot))
    }

    /// Rebuild the store; tasks are returned for the scheduler
    ///
    /// # Errors
    /// Returns `CoreError::Validation` if a stored machine breaks the
    /// compatibility invariant
    pub fn into_parts(self, event_capacity: usize) -> Result<(MachineStore, Vec<Task>), CoreError> {
        let store = MachineStore::restore(self.machines, self.reservation_history, event_capacity)?;
        Ok((store, self.tasks))
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn persistence(error: impl std::fmt::Display) -> CoreError {
    CoreError::Persistence(error.to_string())
}
