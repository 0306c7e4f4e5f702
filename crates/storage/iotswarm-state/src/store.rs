//! Corruption-tolerant checkpoint store
//!
//! State lives in two files, a primary and a backup. Every write first
//! rotates the last committed snapshot into the backup, then atomically
//! replaces the primary. A crash at any point therefore leaves at least one
//! decodable copy. Loading falls back to the backup when the primary is
//! missing or damaged and repairs the primary from it.

use crate::{
    codec,
    snapshot::{CheckpointRecord, Snapshot, UpdateOutcome},
};
use chrono::{DateTime, Utc};
use iotswarm_core::{IotSwarmError, IotSwarmResult};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, info, warn};

/// Locations of the primary and backup snapshot files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub primary: PathBuf,
    pub backup: PathBuf,
}

impl StatePaths {
    /// `<dir>/<name>.ckpt` and `<dir>/<name>.ckpt.bak`
    pub fn in_dir(dir: impl AsRef<Path>, name: &str) -> Self {
        let dir = dir.as_ref();
        Self {
            primary: dir.join(format!("{name}.ckpt")),
            backup: dir.join(format!("{name}.ckpt.bak")),
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

/// What was found in one snapshot slot at load time
enum Slot {
    Missing,
    Valid { snapshot: Snapshot, bytes: Vec<u8> },
    Damaged(String),
}

async fn read_slot(path: &Path) -> Slot {
    match fs::read(path).await {
        Ok(bytes) => match codec::decode(&bytes) {
            Ok(snapshot) => Slot::Valid { snapshot, bytes },
            Err(e) => Slot::Damaged(e.to_string()),
        },
        Err(e) if e.kind() == ErrorKind::NotFound => Slot::Missing,
        Err(e) => Slot::Damaged(format!("unreadable: {e}")),
    }
}

fn write_error(path: &Path, err: std::io::Error) -> IotSwarmError {
    IotSwarmError::state_write(format!("{}: {err}", path.display()))
}

/// Write `bytes` to a temporary file, sync it, rename it over `path` and
/// sync the parent directory
async fn write_atomic(path: &Path, bytes: &[u8]) -> IotSwarmResult<()> {
    let tmp = tmp_path(path);
    {
        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| write_error(&tmp, e))?;
        file.write_all(bytes).await.map_err(|e| write_error(&tmp, e))?;
        file.sync_all().await.map_err(|e| write_error(&tmp, e))?;
    }

    fs::rename(&tmp, path)
        .await
        .map_err(|e| write_error(path, e))?;

    // Directory sync is not supported everywhere; the rename already happened
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent).await {
            if let Err(e) = dir.sync_all().await {
                debug!(dir = %parent.display(), error = %e, "Directory sync skipped");
            }
        }
    }

    Ok(())
}

struct Inner {
    snapshot: Snapshot,
    /// Encoding of the snapshot last written to (or read from) disk
    committed: Option<Vec<u8>>,
}

/// Durable mapping of (table, site) to the last forwarded reading time
pub struct CheckpointStore {
    paths: StatePaths,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

impl CheckpointStore {
    /// Open the store named `name` inside `dir`, creating the directory
    pub async fn open(dir: impl AsRef<Path>, name: &str) -> IotSwarmResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .await
            .map_err(|e| write_error(dir, e))?;
        Self::open_paths(StatePaths::in_dir(dir, name)).await
    }

    /// Load state from explicit primary and backup locations
    ///
    /// Fails with [`IotSwarmError::StateCorruption`] when at least one file
    /// exists but neither decodes, and with [`IotSwarmError::StateWrite`] when
    /// the primary cannot be repaired from the backup.
    pub async fn open_paths(paths: StatePaths) -> IotSwarmResult<Self> {
        let primary = read_slot(&paths.primary).await;

        let (snapshot, committed) = match primary {
            Slot::Valid { snapshot, bytes } => {
                debug!(path = %paths.primary.display(), pairs = snapshot.len(), "Loaded checkpoint state");
                (snapshot, Some(bytes))
            }
            primary => {
                let primary_problem = match &primary {
                    Slot::Damaged(reason) => {
                        warn!(path = %paths.primary.display(), reason = %reason, "Primary checkpoint file is damaged, trying backup");
                        Some(reason.clone())
                    }
                    _ => None,
                };

                match read_slot(&paths.backup).await {
                    Slot::Valid { snapshot, bytes } => {
                        write_atomic(&paths.primary, &bytes).await?;
                        info!(
                            primary = %paths.primary.display(),
                            backup = %paths.backup.display(),
                            pairs = snapshot.len(),
                            "Restored checkpoint state from backup and repaired primary"
                        );
                        (snapshot, Some(bytes))
                    }
                    Slot::Missing if primary_problem.is_none() => {
                        info!(path = %paths.primary.display(), "No checkpoint state found, starting empty");
                        (Snapshot::default(), None)
                    }
                    backup => {
                        let backup_problem = match backup {
                            Slot::Damaged(reason) => reason,
                            _ => "missing".to_string(),
                        };
                        return Err(IotSwarmError::corruption(format!(
                            "no usable checkpoint state: primary {} ({}), backup {} ({})",
                            paths.primary.display(),
                            primary_problem.unwrap_or_else(|| "missing".to_string()),
                            paths.backup.display(),
                            backup_problem
                        )));
                    }
                }
            }
        };

        Ok(Self {
            paths,
            inner: Mutex::new(Inner {
                snapshot,
                committed,
            }),
        })
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub async fn get(&self, table: &str, site_id: &str) -> Option<CheckpointRecord> {
        self.inner.lock().await.snapshot.get(table, site_id).cloned()
    }

    /// Every checkpoint recorded for `table`, ordered by site
    pub async fn records(&self, table: &str) -> Vec<CheckpointRecord> {
        self.inner
            .lock()
            .await
            .snapshot
            .tables
            .get(table)
            .map(|sites| sites.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Copy of the last committed state
    pub async fn snapshot(&self) -> Snapshot {
        self.inner.lock().await.snapshot.clone()
    }

    /// Advance the checkpoint for `(table, site_id)` to `candidate` unless the
    /// stored value already dominates, persisting before returning
    ///
    /// On a write failure the in-memory state stays at the last committed
    /// snapshot and [`IotSwarmError::StateWrite`] is returned.
    pub async fn update(
        &self,
        table: &str,
        site_id: &str,
        candidate: DateTime<Utc>,
    ) -> IotSwarmResult<UpdateOutcome> {
        let mut inner = self.inner.lock().await;

        let mut next = inner.snapshot.clone();
        let outcome = next.apply(table, site_id, candidate, Utc::now());
        if outcome == UpdateOutcome::Unchanged {
            return Ok(outcome);
        }

        let encoded = codec::encode(&next)?;
        let previous = match &inner.committed {
            Some(bytes) => bytes.clone(),
            None => codec::encode(&Snapshot::default())?,
        };

        write_atomic(&self.paths.backup, &previous).await?;
        write_atomic(&self.paths.primary, &encoded).await?;

        inner.snapshot = next;
        inner.committed = Some(encoded);

        metrics::counter!("iotswarm_checkpoint_writes_total").increment(1);
        debug!(table, site_id, checkpoint = %candidate, "Checkpoint advanced");
        Ok(outcome)
    }
}
