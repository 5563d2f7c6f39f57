use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shared::{
    domain::{GroupId, UserId},
    models::PresenceRecord,
};
use tracing::{debug, warn};

use crate::{
    breaker::CircuitBreaker,
    clock::Clock,
    error::{Capability, SyncError, SyncResult},
    remote::RemoteStore,
};

pub const DEFAULT_ONLINE_WINDOW: Duration = Duration::from_secs(45);

/// Heartbeat emission and online-set computation over presence records.
///
/// Each capability has its own breaker: the first failure disables it for the
/// lifetime of this tracker, so a backend without presence support is asked
/// once instead of on every timer tick.
pub struct PresenceTracker {
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    write_breaker: CircuitBreaker,
    read_breaker: CircuitBreaker,
    last_emitted: Mutex<HashMap<(GroupId, UserId), DateTime<Utc>>>,
}

impl PresenceTracker {
    pub fn new(remote: Arc<dyn RemoteStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            remote,
            clock,
            write_breaker: CircuitBreaker::default(),
            read_breaker: CircuitBreaker::default(),
            last_emitted: Mutex::new(HashMap::new()),
        }
    }

    pub fn heartbeat_disabled(&self) -> bool {
        self.write_breaker.is_tripped()
    }

    pub fn lookup_disabled(&self) -> bool {
        self.read_breaker.is_tripped()
    }

    pub async fn heartbeat(&self, group_id: &GroupId, user_id: &UserId) -> SyncResult<()> {
        if self.write_breaker.is_tripped() {
            return Err(SyncError::CapabilityUnavailable(Capability::PresenceWrite));
        }

        let key = (group_id.clone(), user_id.clone());
        let now = self.clock.now();
        let last_seen_at = {
            let emitted = self.last_emitted.lock();
            emitted.get(&key).map_or(now, |previous| now.max(*previous))
        };

        let record = PresenceRecord {
            group_id: group_id.clone(),
            user_id: user_id.clone(),
            last_seen_at,
        };
        match self.remote.upsert_presence(record).await {
            Ok(()) => {
                let mut emitted = self.last_emitted.lock();
                let entry = emitted.entry(key).or_insert(last_seen_at);
                *entry = (*entry).max(last_seen_at);
                debug!(%group_id, %user_id, "presence: heartbeat sent");
                Ok(())
            }
            Err(error) => {
                if self.write_breaker.trip() {
                    warn!(
                        %group_id,
                        %user_id,
                        %error,
                        "presence: heartbeat failed; disabling heartbeats for this session"
                    );
                }
                Err(SyncError::Remote(error))
            }
        }
    }

    /// Users seen within `window`. Empty once the lookup breaker has tripped.
    pub async fn online_members(&self, group_id: &GroupId, window: Duration) -> BTreeSet<UserId> {
        if self.read_breaker.is_tripped() {
            return BTreeSet::new();
        }

        let now = self.clock.now();
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        let since = now - window;
        match self.remote.list_presence(group_id, since).await {
            Ok(records) => records
                .into_iter()
                .filter(|record| &record.group_id == group_id && now - record.last_seen_at < window)
                .map(|record| record.user_id)
                .collect(),
            Err(error) => {
                if self.read_breaker.trip() {
                    warn!(
                        %group_id,
                        %error,
                        "presence: lookup failed; reporting nobody online for this session"
                    );
                }
                BTreeSet::new()
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
