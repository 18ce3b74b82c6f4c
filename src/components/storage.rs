//! Queue Storage
//!
//! Persists the upload queue as a single JSON document. Writes go to a sibling temporary file
//! that is then renamed over the target, so a crash leaves either the old or the new queue.

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{api::controller::QueueStore, model::queue::QueueItem};
use anyhow::{anyhow, Context, Result};
use log::trace;
use serde::{Deserialize, Serialize};

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct QueueFileRef<'a> {
    version: u32,
    items: &'a [QueueItem],
}

#[derive(Deserialize)]
struct QueueFile {
    version: u32,
    items: Vec<QueueItem>,
}

/// [`QueueStore`] backed by a JSON file.
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
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl QueueStore for JsonFileStore {
    fn load(&self) -> Result<Vec<QueueItem>> {
        if !self.path.exists() {
            trace!("no queue at {}, starting empty", self.path.display());
            return Ok(Vec::new());
        }
        let json = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read queue {}", self.path.display()))?;
        let file: QueueFile = serde_json::from_str(&json)
            .with_context(|| format!("corrupt queue {}", self.path.display()))?;
        if file.version != FORMAT_VERSION {
            return Err(anyhow!(
                "unsupported queue format version {} in {}",
                file.version,
                self.path.display()
            ));
        }
        Ok(file.items)
    }

    fn save(&self, items: &[QueueItem]) -> Result<()> {
        let json = serde_json::to_string_pretty(&QueueFileRef {
            version: FORMAT_VERSION,
            items,
        })?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.temp_path();
        fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        trace!("persisted {} queue items", items.len());
        Ok(())
    }
}
