//! Single-file JSON store.
//!
//! The queue is written as one versioned document. Writes go to a sibling
//! temp file that is renamed over the target, so a crash mid-write leaves
//! either the old or the new queue on disk, never a torn one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{PersistenceStore, StoredUnit};
use crate::error::{Error, Result};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
struct QueueFile {
    version: u32,
    units: Vec<StoredUnit>,
}

#[derive(Serialize)]
struct QueueFileRef<'a> {
    version: u32,
    units: &'a [StoredUnit],
}

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "outbox".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl PersistenceStore for JsonFileStore {
    async fn load(&self) -> Result<Vec<StoredUnit>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no queue file yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let file: QueueFile = serde_json::from_str(&content)?;
        if file.version != FORMAT_VERSION {
            return Err(Error::Persistence(format!(
                "unsupported queue file version {} in {}",
                file.version,
                self.path.display()
            )));
        }
        Ok(file.units)
    }

    async fn save(&self, units: &[StoredUnit]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let body = serde_json::to_vec_pretty(&QueueFileRef {
            version: FORMAT_VERSION,
            units,
        })?;

        let tmp = self.temp_path();
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), units = units.len(), "queue file written");
        Ok(())
    }
}
