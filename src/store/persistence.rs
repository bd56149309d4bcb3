// src/store/persistence.rs

//! Durability backends for the state store.
//!
//! Backends are logs: every store mutation appends only the records it
//! changed, and [`Persistence::compact`] rewrites the log as one line per
//! live record. The store compacts on open and whenever the log has grown
//! well past the number of live records, so appends stay proportional to
//! the change and the log stays proportional to the state.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::fs::{FileSystem, RealFileSystem};
use crate::store::model::{DagRun, InstanceKey, RunKey, StoreRecord, StoreSnapshot, TaskInstance};

/// Where the store writes its records.
///
/// Both writes are called while the store lock is held and must not return
/// before the data is durable for this backend.
pub trait Persistence: Send + Sync + Debug {
    /// Everything stored, folded to the newest version per key, or `None`
    /// if nothing was ever written.
    fn load(&self) -> Result<Option<StoreSnapshot>>;

    /// Record `records` as the newest versions of their keys.
    fn append(&self, records: &[StoreRecord]) -> Result<()>;

    /// Replace everything stored with `snapshot`.
    fn compact(&self, snapshot: &StoreSnapshot) -> Result<()>;
}

/// Records folded by key; later versions replace earlier ones.
#[derive(Debug, Clone, Default)]
struct Image {
    runs: BTreeMap<RunKey, DagRun>,
    instances: BTreeMap<InstanceKey, TaskInstance>,
}

impl Image {
    fn from_snapshot(snapshot: &StoreSnapshot) -> Self {
        let mut image = Image::default();
        for run in &snapshot.runs {
            image.runs.insert(run.key(), run.clone());
        }
        for instance in &snapshot.instances {
            image.instances.insert(instance.key(), instance.clone());
        }
        image
    }

    fn apply(&mut self, record: &StoreRecord) {
        match record {
            StoreRecord::Run(run) => {
                self.runs.insert(run.key(), run.clone());
            }
            StoreRecord::Instance(instance) => {
                self.instances.insert(instance.key(), instance.clone());
            }
        }
    }

    fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            runs: self.runs.values().cloned().collect(),
            instances: self.instances.values().cloned().collect(),
        }
    }
}

/// Keeps the folded records in memory. Clones share them, so dropping a
/// store and opening a new one on a clone behaves like a process restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    image: Arc<Mutex<Option<Image>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored records, e.g. to seed a store in a test.
    pub fn seed(&self, snapshot: StoreSnapshot) {
        *self.image.lock().unwrap_or_else(|e| e.into_inner()) = Some(Image::from_snapshot(&snapshot));
    }
}

impl Persistence for MemoryPersistence {
    fn load(&self) -> Result<Option<StoreSnapshot>> {
        Ok(self
            .image
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(Image::snapshot))
    }

    fn append(&self, records: &[StoreRecord]) -> Result<()> {
        let mut image = self.image.lock().unwrap_or_else(|e| e.into_inner());
        let image = image.get_or_insert_with(Image::default);
        for record in records {
            image.apply(record);
        }
        Ok(())
    }

    fn compact(&self, snapshot: &StoreSnapshot) -> Result<()> {
        self.seed(snapshot.clone());
        Ok(())
    }
}

/// Name of the log file inside a state directory.
pub const STATE_FILE: &str = "state.jsonl";

/// JSON-lines log on disk: one [`StoreRecord`] per line.
///
/// Appends go to the end of the file; compaction replaces the file
/// atomically. A torn last line (a crash mid-append) is dropped on load.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
}

impl JsonFilePersistence {
    /// Log file `state.jsonl` inside `state_dir`, on the real filesystem.
    pub fn in_dir(state_dir: impl AsRef<Path>) -> Self {
        Self::with_fs(Arc::new(RealFileSystem), state_dir.as_ref().join(STATE_FILE))
    }

    pub fn with_fs(fs: Arc<dyn FileSystem>, path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn encode(records: impl IntoIterator<Item = StoreRecord>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for record in records {
        serde_json::to_writer(&mut out, &record)?;
        out.push(b'\n');
    }
    Ok(out)
}

impl Persistence for JsonFilePersistence {
    fn load(&self) -> Result<Option<StoreSnapshot>> {
        if !self.fs.exists(&self.path) {
            debug!(path = %self.path.display(), "no state file yet; starting empty");
            return Ok(None);
        }
        let contents = self.fs.read_to_string(&self.path)?;
        let complete = contents.ends_with('\n');
        let lines: Vec<&str> = contents.lines().collect();

        let mut image = Image::default();
        for (n, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StoreRecord>(line) {
                Ok(record) => image.apply(&record),
                Err(err) if !complete && n + 1 == lines.len() => {
                    warn!(path = %self.path.display(), error = %err, "dropping torn last line of state file");
                }
                Err(err) => {
                    return Err(anyhow!("{}:{}: {err}", self.path.display(), n + 1).into());
                }
            }
        }

        debug!(
            path = %self.path.display(),
            lines = lines.len(),
            runs = image.runs.len(),
            instances = image.instances.len(),
            "loaded state file"
        );
        Ok(Some(image.snapshot()))
    }

    fn append(&self, records: &[StoreRecord]) -> Result<()> {
        let bytes = encode(records.iter().cloned())?;
        self.fs.append(&self.path, &bytes)?;
        Ok(())
    }

    fn compact(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let records = snapshot
            .runs
            .iter()
            .cloned()
            .map(StoreRecord::Run)
            .chain(snapshot.instances.iter().cloned().map(StoreRecord::Instance));
        let bytes = encode(records)?;
        self.fs.write_atomic(&self.path, &bytes)?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "state file compacted");
        Ok(())
    }
}
