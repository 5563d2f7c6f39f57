use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use shared::{
    domain::{GroupId, ItemId, MemberRef, UserId},
    models::{Comment, ExtrasBlob, Note, SubItem},
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    cache::{CacheKey, LocalCache},
    clock::Clock,
    error::SyncResult,
    remote::RemoteStore,
};

pub const MIN_DEADLINE_MINUTES: i64 = 1;
pub const MAX_DEADLINE_MINUTES: i64 = 7 * 24 * 60;

/// Outcome of comparing the cached blob with the remote one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub value: ExtrasBlob,
    /// Whether `value` must be written to the remote store.
    pub seed_remote: bool,
}

pub trait MergeStrategy: Send + Sync {
    fn reconcile(&self, local: Option<ExtrasBlob>, remote: Option<ExtrasBlob>) -> Resolution;
}

/// Remote is authoritative when it exists; otherwise the local value (or an
/// empty blob) becomes the remote's first value.
#[derive(Debug, Default, Clone, Copy)]
pub struct RemoteWinsElseSeed;

impl MergeStrategy for RemoteWinsElseSeed {
    fn reconcile(&self, local: Option<ExtrasBlob>, remote: Option<ExtrasBlob>) -> Resolution {
        match remote {
            Some(value) => Resolution {
                value,
                seed_remote: false,
            },
            None => Resolution {
                value: local.unwrap_or_default(),
                seed_remote: true,
            },
        }
    }
}

enum PushJob {
    Upsert {
        group_id: GroupId,
        item_id: ItemId,
        blob: ExtrasBlob,
    },
    Flush(oneshot::Sender<()>),
}

/// Local-first store for per-item plan extras.
///
/// Mutations apply to the cache synchronously and queue a full-blob push.
/// Conflicts between devices resolve last-writer-wins per blob.
pub struct ReconciliationEngine {
    remote: Arc<dyn RemoteStore>,
    cache: LocalCache,
    clock: Arc<dyn Clock>,
    strategy: Arc<dyn MergeStrategy>,
    pushes: mpsc::UnboundedSender<PushJob>,
    // Mutation count per cache key. Holding the lock serializes
    // read-modify-write so queued pushes follow mutation order.
    writes: Mutex<HashMap<String, u64>>,
}

impl ReconciliationEngine {
    pub fn new(remote: Arc<dyn RemoteStore>, cache: LocalCache, clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::new_with_strategy(remote, cache, clock, Arc::new(RemoteWinsElseSeed))
    }

    /// Starts the push worker, so it must be called from within a tokio runtime.
    pub fn new_with_strategy(
        remote: Arc<dyn RemoteStore>,
        cache: LocalCache,
        clock: Arc<dyn Clock>,
        strategy: Arc<dyn MergeStrategy>,
    ) -> Arc<Self> {
        let (pushes, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_push_worker(remote.clone(), rx));
        Arc::new(Self {
            remote,
            cache,
            clock,
            strategy,
            pushes,
            writes: Mutex::new(HashMap::new()),
        })
    }

    pub fn read(&self, group_id: &GroupId, item_id: &ItemId) -> ExtrasBlob {
        self.cache
            .read(&CacheKey::extras(group_id, item_id))
            .unwrap_or_default()
    }

    /// Brings the cache in line with the remote blob. Local pushes still in
    /// flight are delivered first so they are not shadowed by an older remote
    /// value. A mutation made while the fetch is in flight is kept: its own
    /// push is already queued behind the fetched value.
    pub async fn sync(&self, group_id: &GroupId, item_id: &ItemId) -> SyncResult<ExtrasBlob> {
        self.flush().await;

        let key = CacheKey::extras(group_id, item_id);
        let revision = self.revision(&key);
        let remote = self.remote.fetch_extras(group_id, item_id).await?;
        let local = self.cache.read(&key);
        let resolution = self.strategy.reconcile(local, remote);

        if resolution.seed_remote {
            self.remote
                .upsert_extras(group_id, item_id, &resolution.value)
                .await?;
            info!(%group_id, %item_id, "extras: seeded remote from local value");
        }

        let writes = self.writes.lock();
        if writes.get(key.as_str()).copied().unwrap_or(0) != revision {
            debug!(%group_id, %item_id, "extras: local change during sync; keeping it");
            return Ok(self.cache.read(&key).unwrap_or_default());
        }
        self.cache.write(&key, &resolution.value);
        Ok(resolution.value)
    }

    /// Waits for every push queued before this call.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.pushes.send(PushJob::Flush(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Records `user_id`'s dinner vote. `false` once voting closed or when
    /// `item` is not on the menu.
    pub fn vote_menu_item(
        &self,
        group_id: &GroupId,
        item_id: &ItemId,
        user_id: &UserId,
        item: &str,
    ) -> bool {
        self.mutate(group_id, item_id, |blob, now| {
            let dinner = &mut blob.dinner;
            if dinner.is_closed(now) || !dinner.items.iter().any(|known| known == item) {
                return false;
            }
            dinner
                .votes_by_user
                .insert(user_id.clone(), item.to_string());
            true
        })
    }

    pub fn add_menu_item(&self, group_id: &GroupId, item_id: &ItemId, item: &str) -> bool {
        let item = item.trim();
        if item.is_empty() {
            return false;
        }
        self.mutate(group_id, item_id, |blob, _| {
            if blob.dinner.items.iter().any(|known| known == item) {
                return false;
            }
            blob.dinner.items.push(item.to_string());
            true
        })
    }

    /// Removes `item` along with every vote cast for it.
    pub fn remove_menu_item(&self, group_id: &GroupId, item_id: &ItemId, item: &str) -> bool {
        self.mutate(group_id, item_id, |blob, _| {
            let before = blob.dinner.items.len();
            blob.dinner.items.retain(|known| known != item);
            if blob.dinner.items.len() == before {
                return false;
            }
            blob.dinner.votes_by_user.retain(|_, voted| voted != item);
            true
        })
    }

    /// Closes dinner voting `minutes` from now, clamped to one minute..seven days.
    pub fn set_dinner_deadline(
        &self,
        group_id: &GroupId,
        item_id: &ItemId,
        minutes: i64,
    ) -> DateTime<Utc> {
        let minutes = minutes.clamp(MIN_DEADLINE_MINUTES, MAX_DEADLINE_MINUTES);
        let mut closes_at = self.clock.now();
        self.mutate(group_id, item_id, |blob, now| {
            closes_at = now + Duration::minutes(minutes);
            blob.dinner.closes_at = Some(closes_at);
            true
        });
        closes_at
    }

    pub fn clear_dinner_deadline(&self, group_id: &GroupId, item_id: &ItemId) -> bool {
        self.mutate(group_id, item_id, |blob, _| {
            blob.dinner.closes_at.take().is_some()
        })
    }

    pub fn set_wifi(&self, group_id: &GroupId, item_id: &ItemId, wifi: &str) {
        self.mutate(group_id, item_id, |blob, _| {
            blob.facility.wifi = wifi.trim().to_string();
            true
        });
    }

    pub fn set_parking(&self, group_id: &GroupId, item_id: &ItemId, parking: &str) {
        self.mutate(group_id, item_id, |blob, _| {
            blob.facility.parking = parking.trim().to_string();
            true
        });
    }

    pub fn add_facility_note(
        &self,
        group_id: &GroupId,
        item_id: &ItemId,
        author: Option<&UserId>,
        text: &str,
    ) -> Option<String> {
        let note = self.new_note(author, text)?;
        let id = note.id.clone();
        self.mutate(group_id, item_id, |blob, _| {
            blob.facility.notes.push(note);
            true
        });
        Some(id)
    }

    pub fn add_event_note(
        &self,
        group_id: &GroupId,
        item_id: &ItemId,
        author: Option<&UserId>,
        text: &str,
    ) -> Option<String> {
        let note = self.new_note(author, text)?;
        let id = note.id.clone();
        self.mutate(group_id, item_id, |blob, _| {
            blob.event_notes.notes.push(note);
            true
        });
        Some(id)
    }

    pub fn remove_event_note(&self, group_id: &GroupId, item_id: &ItemId, note_id: &str) -> bool {
        self.mutate(group_id, item_id, |blob, _| {
            let before = blob.event_notes.notes.len();
            blob.event_notes.notes.retain(|note| note.id != note_id);
            blob.event_notes.notes.len() != before
        })
    }

    pub fn set_about(&self, group_id: &GroupId, item_id: &ItemId, about: &str) {
        self.mutate(group_id, item_id, |blob, _| {
            blob.about = about.to_string();
            true
        });
    }

    pub fn add_sub_item(&self, group_id: &GroupId, item_id: &ItemId, title: &str) -> Option<String> {
        let title = title.trim();
        if title.is_empty() {
            return None;
        }
        let id = Uuid::new_v4().to_string();
        self.mutate(group_id, item_id, |blob, _| {
            blob.sub_items.push(SubItem {
                id: id.clone(),
                title: title.to_string(),
                done: false,
            });
            true
        });
        Some(id)
    }

    pub fn toggle_sub_item(&self, group_id: &GroupId, item_id: &ItemId, sub_item_id: &str) -> bool {
        self.mutate(group_id, item_id, |blob, _| {
            match blob.sub_items.iter_mut().find(|sub| sub.id == sub_item_id) {
                Some(sub) => {
                    sub.done = !sub.done;
                    true
                }
                None => false,
            }
        })
    }

    pub fn add_comment(
        &self,
        group_id: &GroupId,
        item_id: &ItemId,
        author: &MemberRef,
        text: &str,
    ) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        self.mutate(group_id, item_id, |blob, now| {
            blob.comments.push(Comment {
                id: Uuid::new_v4().to_string(),
                author: author.clone(),
                text: text.to_string(),
                created_at: now,
            });
            true
        })
    }

    fn revision(&self, key: &CacheKey) -> u64 {
        self.writes.lock().get(key.as_str()).copied().unwrap_or(0)
    }

    fn new_note(&self, author: Option<&UserId>, text: &str) -> Option<Note> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        Some(Note {
            id: Uuid::new_v4().to_string(),
            text: text.to_string(),
            created_by: author.cloned(),
            created_at: self.clock.now(),
        })
    }

    /// Applies `apply` to the cached blob; when it reports a change the blob
    /// is written back and queued for the remote.
    fn mutate(
        &self,
        group_id: &GroupId,
        item_id: &ItemId,
        apply: impl FnOnce(&mut ExtrasBlob, DateTime<Utc>) -> bool,
    ) -> bool {
        let mut writes = self.writes.lock();
        let key = CacheKey::extras(group_id, item_id);
        let mut blob: ExtrasBlob = self.cache.read(&key).unwrap_or_default();
        if !apply(&mut blob, self.clock.now()) {
            return false;
        }
        self.cache.write(&key, &blob);
        *writes.entry(key.as_str().to_string()).or_default() += 1;

        let job = PushJob::Upsert {
            group_id: group_id.clone(),
            item_id: item_id.clone(),
            blob,
        };
        if self.pushes.send(job).is_err() {
            warn!(%group_id, %item_id, "extras: push worker stopped; change kept locally");
        }
        true
    }
}

async fn run_push_worker(remote: Arc<dyn RemoteStore>, mut rx: mpsc::UnboundedReceiver<PushJob>) {
    while let Some(job) = rx.recv().await {
        match job {
            PushJob::Upsert {
                group_id,
                item_id,
                blob,
            } => match remote.upsert_extras(&group_id, &item_id, &blob).await {
                Ok(()) => debug!(%group_id, %item_id, "extras: pushed blob"),
                Err(error) => {
                    warn!(%group_id, %item_id, %error, "extras: push failed; remote keeps its previous value")
                }
            },
            PushJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
