//! Client-side synchronization for group plans: chat polling, presence,
//! shared plan extras and media migration over a remote store and a
//! device-local cache.

use std::sync::Arc;

use anyhow::{Context, Result};
use shared::domain::UserId;
use tracing::info;

pub mod breaker;
pub mod cache;
pub mod chat;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod media;
pub mod memory;
pub mod presence;
pub mod reconcile;
pub mod remote;
pub mod sqlite_cache;
pub mod timer;

pub use cache::{CacheKey, KeyValueStore, LocalCache, MemoryKeyValueStore};
pub use chat::{
    ChatAction, ChatSettings, ChatSyncEngine, ChatView, Notice, OutgoingMessage, PollState,
    SyncEvent, UnreadCounter,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_settings, SyncSettings};
pub use error::{Capability, SyncError, SyncResult};
pub use http::{BackendEndpoint, HttpObjectStorage, HttpPostStore, HttpRemoteStore};
pub use media::{MediaMigrator, MigrationOutcome};
pub use presence::{PresenceTracker, DEFAULT_ONLINE_WINDOW};
pub use reconcile::{MergeStrategy, ReconciliationEngine, RemoteWinsElseSeed, Resolution};
pub use remote::{ObjectStorage, PostStore, RemoteStore};
pub use sqlite_cache::SqliteKeyValueStore;

/// Remote seams a [`PlanSyncClient`] is assembled from.
#[derive(Clone)]
pub struct Backends {
    pub remote: Arc<dyn RemoteStore>,
    pub posts: Arc<dyn PostStore>,
    pub objects: Arc<dyn ObjectStorage>,
}

impl Backends {
    pub fn http(endpoint: BackendEndpoint) -> Self {
        Self {
            remote: Arc::new(HttpRemoteStore::new(endpoint.clone())),
            posts: Arc::new(HttpPostStore::new(endpoint.clone())),
            objects: Arc::new(HttpObjectStorage::new(endpoint)),
        }
    }
}

/// One device's sync stack: chat, extras and media sharing a cache and clock.
pub struct PlanSyncClient {
    settings: SyncSettings,
    backends: Backends,
    chat: Arc<ChatSyncEngine>,
    extras: Arc<ReconciliationEngine>,
    cache_store: Option<Arc<SqliteKeyValueStore>>,
}

impl PlanSyncClient {
    /// HTTP backend from `settings.backend_url`, durable cache at
    /// `settings.cache_database_url`.
    pub async fn connect(settings: SyncSettings) -> Result<Self> {
        let endpoint = BackendEndpoint::new(&settings.backend_url)?;
        let store = SqliteKeyValueStore::open(&settings.cache_database_url)
            .await
            .context("failed to open device cache")?;
        info!(
            backend_url = %settings.backend_url,
            cache = %settings.cache_database_url,
            "client: connected"
        );
        let mut client = Self::new_with_dependencies(
            settings,
            Backends::http(endpoint),
            LocalCache::new(store.clone()),
            Arc::new(SystemClock),
        );
        client.cache_store = Some(store);
        Ok(client)
    }

    pub fn new_with_dependencies(
        settings: SyncSettings,
        backends: Backends,
        cache: LocalCache,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let presence = Arc::new(PresenceTracker::new(backends.remote.clone(), clock.clone()));
        let chat = ChatSyncEngine::new_with_dependencies(
            backends.remote.clone(),
            cache.clone(),
            clock.clone(),
            presence,
            ChatSettings::from(&settings),
        );
        let extras = ReconciliationEngine::new(backends.remote.clone(), cache, clock);
        Self {
            settings,
            backends,
            chat,
            extras,
            cache_store: None,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn chat(&self) -> &Arc<ChatSyncEngine> {
        &self.chat
    }

    pub fn extras(&self) -> &Arc<ReconciliationEngine> {
        &self.extras
    }

    pub fn media_migrator(&self, session_user: UserId) -> MediaMigrator {
        MediaMigrator::new(
            self.backends.posts.clone(),
            self.backends.objects.clone(),
            session_user,
        )
    }

    /// Stops timers and waits for queued extras pushes and cache writes.
    pub async fn shutdown(&self) -> Result<()> {
        self.chat.shutdown();
        self.extras.flush().await;
        if let Some(store) = &self.cache_store {
            store.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
