//! Intent records for operations that touch more than one file.
//!
//! Before the store moves an original and its shadow it writes the planned
//! moves and deletes to `<config>/journal/<id>.json`. The record is removed
//! once every step succeeded. Records found at startup belong to operations
//! that were interrupted and are rolled forward.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::filesystem::move_file;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("journal record is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PlannedMove {
    pub from: PathBuf,
    pub to: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Intent {
    pub id: Uuid,
    pub operation: String,
    pub created: DateTime<Utc>,
    pub moves: Vec<PlannedMove>,
    pub deletes: Vec<PathBuf>,
}

impl Intent {
    pub fn new(operation: &str) -> Self {
        Intent {
            id: Uuid::new_v4(),
            operation: operation.to_string(),
            created: Utc::now(),
            moves: Vec::new(),
            deletes: Vec::new(),
        }
    }

    pub fn move_file(mut self, from: PathBuf, to: PathBuf) -> Self {
        self.moves.push(PlannedMove { from, to });
        self
    }

    pub fn delete_file(mut self, path: PathBuf) -> Self {
        self.deletes.push(path);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty() && self.deletes.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Journal {
    dir: PathBuf,
}

impl Journal {
    pub fn open(dir: &Path) -> Result<Self, JournalError> {
        fs::create_dir_all(dir)?;
        Ok(Journal {
            dir: dir.to_path_buf(),
        })
    }

    fn record_path(&self, id: &Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn write(&self, intent: &Intent) -> Result<(), JournalError> {
        let path = self.record_path(&intent.id);
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, serde_json::to_vec_pretty(intent)?)?;
        fs::rename(&temp, &path)?;
        Ok(())
    }

    fn remove(&self, intent: &Intent) -> Result<(), JournalError> {
        match fs::remove_file(self.record_path(&intent.id)) {
            Err(why) if why.kind() != io::ErrorKind::NotFound => Err(why.into()),
            _ => Ok(()),
        }
    }

    /// Records `intent`, performs it, and clears the record.
    ///
    /// A failed move undoes the moves already made. If that undo fails too
    /// the record stays behind for [`Journal::recover`].
    pub fn execute(&self, intent: Intent) -> Result<(), JournalError> {
        if intent.is_empty() {
            return Ok(());
        }
        self.write(&intent)?;
        tracing::debug!("journal {} ({}) recorded", intent.id, intent.operation);

        let mut done: Vec<&PlannedMove> = Vec::new();
        for planned in &intent.moves {
            if let Err(why) = move_file(&planned.from, &planned.to) {
                tracing::warn!(
                    "{} failed moving {:?} to {:?}: {}",
                    intent.operation,
                    planned.from,
                    planned.to,
                    why
                );
                let undone = done
                    .iter()
                    .rev()
                    .all(|m| move_file(&m.to, &m.from).is_ok());
                if undone {
                    self.remove(&intent)?;
                } else {
                    tracing::error!(
                        "could not undo {}; journal {} kept for recovery",
                        intent.operation,
                        intent.id
                    );
                }
                return Err(why.into());
            }
            done.push(planned);
        }

        for path in &intent.deletes {
            if let Err(why) = remove_if_present(path) {
                tracing::error!(
                    "{} could not delete {:?}: {}; journal {} kept for recovery",
                    intent.operation,
                    path,
                    why,
                    intent.id
                );
                return Err(why.into());
            }
        }

        self.remove(&intent)?;
        Ok(())
    }

    /// Rolls every leftover record forward and removes it. Returns how many
    /// records were processed.
    pub fn recover(&self) -> Result<usize, JournalError> {
        let mut recovered = 0;

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let intent: Intent = match fs::read(&path)
                .map_err(JournalError::from)
                .and_then(|bytes| Ok(serde_json::from_slice(&bytes)?))
            {
                Ok(intent) => intent,
                Err(why) => {
                    tracing::error!("skipping unreadable journal record {:?}: {}", path, why);
                    continue;
                }
            };

            tracing::warn!(
                "recovering interrupted {} from {} (journal {})",
                intent.operation,
                intent.created,
                intent.id
            );
            roll_forward(&intent)?;
            fs::remove_file(&path)?;
            recovered += 1;
        }

        Ok(recovered)
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(why) if why.kind() != io::ErrorKind::NotFound => Err(why),
        _ => Ok(()),
    }
}

fn roll_forward(intent: &Intent) -> io::Result<()> {
    for planned in &intent.moves {
        match (planned.from.exists(), planned.to.exists()) {
            (true, false) => move_file(&planned.from, &planned.to)?,
            (true, true) => tracing::warn!(
                "both {:?} and {:?} exist, leaving them alone",
                planned.from,
                planned.to
            ),
            // already moved
            (false, _) => {}
        }
    }
    for path in &intent.deletes {
        remove_if_present(path)?;
    }
    Ok(())
}
