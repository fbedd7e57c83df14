//! Durable snapshot of the pending queue and unflushed batches.
//!
//! Two JSON files under the data directory:
//! `pending_messages.json` holds `[[conversation, [{message, timestamp}]]]`
//! and `user_timers.json` holds `{conversation: {messages, lastMessageTime}}`.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use {
    parley_common::ConversationId,
    serde::{Serialize, de::DeserializeOwned},
    tokio::fs,
    tracing::{debug, warn},
};

use crate::{
    batch::BatchRecord,
    error::{Error, Result},
    pending::PendingRecord,
};

pub const PENDING_FILE: &str = "pending_messages.json";
pub const BATCHES_FILE: &str = "user_timers.json";

pub type PendingSnapshot = Vec<(ConversationId, Vec<PendingRecord>)>;
pub type BatchSnapshot = HashMap<ConversationId, BatchRecord>;

/// Everything persisted between runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub pending: PendingSnapshot,
    pub batches: BatchSnapshot,
}

pub struct SnapshotStore {
    pending_path: PathBuf,
    batches_path: PathBuf,
}

impl SnapshotStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            pending_path: data_dir.join(PENDING_FILE),
            batches_path: data_dir.join(BATCHES_FILE),
        }
    }

    /// Load each file on its own. A missing file yields empty state; an
    /// unreadable one is moved aside to `*.corrupt` so the next save cannot
    /// overwrite it, and also yields empty state.
    pub async fn load(&self) -> Snapshot {
        Snapshot {
            pending: load_or_quarantine(&self.pending_path).await,
            batches: load_or_quarantine(&self.batches_path).await,
        }
    }

    pub async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        atomic_write_json(&self.pending_path, &snapshot.pending).await?;
        atomic_write_json(&self.batches_path, &snapshot.batches).await?;
        debug!(
            pending = snapshot.pending.len(),
            batches = snapshot.batches.len(),
            "snapshot saved"
        );
        Ok(())
    }
}

async fn load_or_quarantine<T: DeserializeOwned + Default>(path: &Path) -> T {
    match read_json(path).await {
        Ok(value) => value.unwrap_or_default(),
        Err(e) => {
            let aside = path.with_extension("json.corrupt");
            match fs::rename(path, &aside).await {
                Ok(()) => warn!(
                    error = %e,
                    moved_to = %aside.display(),
                    "snapshot file unreadable, starting without it"
                ),
                Err(rename) => warn!(
                    error = %e,
                    rename_error = %rename,
                    path = %path.display(),
                    "snapshot file unreadable and could not be moved aside"
                ),
            }
            T::default()
        },
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        return Ok(None);
    }
    let data = fs::read_to_string(path)
        .await
        .map_err(|e| Error::persistence(format!("reading {}", path.display()), e))?;
    let value = serde_json::from_str(&data)
        .map_err(|e| Error::persistence(format!("parsing {}", path.display()), e))?;
    Ok(Some(value))
}

/// Write to a temp file, then rename over the target.
async fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::persistence(format!("creating {}", parent.display()), e))?;
    }
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| Error::persistence("serializing snapshot", e))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json.as_bytes())
        .await
        .map_err(|e| Error::persistence(format!("writing {}", tmp.display()), e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| Error::persistence(format!("replacing {}", path.display()), e))?;
    Ok(())
}
