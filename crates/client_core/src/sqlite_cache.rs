use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;
use storage::Storage;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::cache::KeyValueStore;

enum CacheWrite {
    Put { key: String, value: String },
    Delete { key: String },
    Flush(oneshot::Sender<()>),
}

/// Durable [`KeyValueStore`] backed by the device SQLite database.
///
/// All entries are loaded when the store opens so reads stay synchronous;
/// writes update memory immediately and reach SQLite in order through a
/// background writer.
pub struct SqliteKeyValueStore {
    entries: RwLock<HashMap<String, String>>,
    writes: mpsc::UnboundedSender<CacheWrite>,
}

impl SqliteKeyValueStore {
    pub async fn open(database_url: &str) -> Result<Arc<Self>> {
        let storage = Storage::new(database_url)
            .await
            .with_context(|| format!("failed to open local cache at '{database_url}'"))?;
        let entries: HashMap<String, String> =
            storage.load_cache_entries().await?.into_iter().collect();
        info!(entries = entries.len(), "cache: hydrated local cache");

        let (writes, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(storage, rx));

        Ok(Arc::new(Self {
            entries: RwLock::new(entries),
            writes,
        }))
    }

    /// Waits until every write issued before this call reached SQLite.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.writes
            .send(CacheWrite::Flush(tx))
            .map_err(|_| anyhow!("local cache writer has stopped"))?;
        rx.await
            .map_err(|_| anyhow!("local cache writer stopped before flushing"))
    }

    fn enqueue(&self, write: CacheWrite) {
        if self.writes.send(write).is_err() {
            warn!("cache: writer has stopped; change kept in memory only");
        }
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.entries.write().insert(key.to_string(), value.clone());
        self.enqueue(CacheWrite::Put {
            key: key.to_string(),
            value,
        });
    }

    fn remove(&self, key: &str) {
        self.entries.write().remove(key);
        self.enqueue(CacheWrite::Delete {
            key: key.to_string(),
        });
    }
}

async fn run_writer(storage: Storage, mut rx: mpsc::UnboundedReceiver<CacheWrite>) {
    while let Some(write) = rx.recv().await {
        match write {
            CacheWrite::Put { key, value } => {
                if let Err(error) = storage.put_cache_entry(&key, &value).await {
                    warn!(%key, error = %error, "cache: failed to persist entry");
                }
            }
            CacheWrite::Delete { key } => {
                if let Err(error) = storage.delete_cache_entry(&key).await {
                    warn!(%key, error = %error, "cache: failed to delete entry");
                }
            }
            CacheWrite::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
