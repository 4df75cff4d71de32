//! JSON-backed spill store.
//!
//! `JsonSpillStore` keeps the events a destination could not deliver before
//! shutdown in a single JSON file, so the next run can pick them up again.
//!
//! ### Design
//! - One file per destination: `<dir>/<destination>.json`.
//! - Written once at shutdown, read and removed once at start. There is no
//!   incremental persistence while the agent runs.
//! - Writes go to a temporary file that is then renamed over the target.
//!
//! ### Caveats
//! - A corrupt file is logged and discarded rather than failing start.
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use crate::agent::AgentError;
use crate::event::Event;

/// An event waiting in the spill file along with its failed attempt count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpilledEvent {
    pub attempts: u32,
    pub event: Event,
}

/// On-disk representation of one destination's unsent events.
#[derive(Debug, Serialize, Deserialize)]
struct SpillFile {
    destination: String,
    events: Vec<SpilledEvent>,
}

#[derive(Debug, Clone)]
pub struct JsonSpillStore {
    destination: String,
    path: PathBuf,
}

impl JsonSpillStore {
    pub fn new(dir: impl AsRef<Path>, destination: &str) -> Self {
        let file_name: String = destination
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();

        Self {
            destination: destination.to_string(),
            path: dir.as_ref().join(format!("{file_name}.json")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the spill file with `events`. An empty list removes the file.
    pub fn save(&self, events: &[SpilledEvent]) -> Result<(), AgentError> {
        if events.is_empty() {
            return self.remove();
        }

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }

        let file = SpillFile {
            destination: self.destination.clone(),
            events: events.to_vec(),
        };
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&file)?)?;
        fs::rename(&tmp, &self.path)?;

        Ok(())
    }

    /// Reads and removes the spill file. A missing file yields an empty list.
    pub fn take(&self) -> Result<Vec<SpilledEvent>, AgentError> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        self.remove()?;

        match serde_json::from_slice::<SpillFile>(&contents) {
            Ok(file) => Ok(file.events),
            Err(e) => {
                log::warn!(
                    "Discarding unreadable spill file {}: {}",
                    self.path.display(),
                    e
                );
                Ok(Vec::new())
            }
        }
    }

    fn remove(&self) -> Result<(), AgentError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
