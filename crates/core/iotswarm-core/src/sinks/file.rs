//! Filesystem object-store sink
//!
//! Every payload becomes one JSON object at
//! `<root>/<topic>/<first-row-time>.json`. Objects are written to a temporary
//! file, synced and renamed into place, so readers never see a partial object.

use crate::{
    error::{IotSwarmError, IotSwarmResult},
    payload::Payload,
    traits::Sink,
};
use async_trait::async_trait;
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::{fs, io::AsyncWriteExt};
use tracing::debug;

/// Writes payloads as JSON objects below a root directory
#[derive(Debug, Clone)]
pub struct FileSink {
    root: PathBuf,
}

impl FileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Object path for a payload published under `topic`
    pub fn object_path(&self, topic: &str, payload: &Payload) -> IotSwarmResult<PathBuf> {
        let relative = Path::new(topic);
        let safe = !topic.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(IotSwarmError::config(format!(
                "topic '{topic}' is not a relative object prefix"
            )));
        }

        let first = payload
            .data
            .first()
            .map(|row| row.time)
            .unwrap_or_else(Utc::now);
        let file_name = format!("{}.json", first.format("%Y%m%dT%H%M%S%.3fZ"));

        Ok(self.root.join(relative).join(file_name))
    }
}

fn io_error(path: &Path, err: std::io::Error) -> IotSwarmError {
    match err.kind() {
        ErrorKind::PermissionDenied => {
            IotSwarmError::auth(format!("{}: {err}", path.display()))
        }
        _ => IotSwarmError::publish(format!("{}: {err}", path.display())),
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn publish(&self, topic: &str, payload: &Payload) -> IotSwarmResult<()> {
        let path = self.object_path(topic, payload)?;
        let bytes = payload.to_json_bytes()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }

        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp).await.map_err(|e| io_error(&tmp, e))?;
            file.write_all(&bytes).await.map_err(|e| io_error(&tmp, e))?;
            file.sync_all().await.map_err(|e| io_error(&tmp, e))?;
        }
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(&path, e))?;

        debug!(topic, path = %path.display(), bytes = bytes.len(), "Object written");
        Ok(())
    }
}
