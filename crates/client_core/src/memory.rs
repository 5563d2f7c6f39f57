//! In-process implementations of the remote seams. Several clients can share
//! one instance to act as separate devices against the same backend.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shared::{
    domain::{GroupId, ItemId, MessageId, PostId, UserId},
    models::{ChatMessage, ExtrasBlob, MemberProfile, Post, PresenceRecord, Reactions},
    protocol::NewMessage,
};

use crate::{
    clock::{Clock, SystemClock},
    remote::{ObjectStorage, PostStore, RemoteStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    ListMessages,
    InsertMessage,
    SetReactions,
    SetPollVotes,
    ListMembers,
    UpsertPresence,
    ListPresence,
    FetchExtras,
    UpsertExtras,
}

#[derive(Default)]
struct RemoteState {
    messages: HashMap<GroupId, Vec<ChatMessage>>,
    members: HashMap<GroupId, Vec<MemberProfile>>,
    presence: HashMap<(GroupId, UserId), DateTime<Utc>>,
    extras: HashMap<(GroupId, ItemId), ExtrasBlob>,
    failing: HashSet<RemoteOp>,
    latency: HashMap<RemoteOp, Duration>,
    calls: HashMap<RemoteOp, usize>,
}

pub struct InMemoryRemoteStore {
    clock: Arc<dyn Clock>,
    state: Mutex<RemoteState>,
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl InMemoryRemoteStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(RemoteState::default()),
        }
    }

    pub fn add_member(&self, group_id: &GroupId, profile: MemberProfile) {
        let mut state = self.state.lock();
        let members = state.members.entry(group_id.clone()).or_default();
        members.retain(|existing| existing.user_id != profile.user_id);
        members.push(profile);
    }

    /// Makes every later call of `op` fail until [`Self::recover`].
    pub fn fail(&self, op: RemoteOp) {
        self.state.lock().failing.insert(op);
    }

    pub fn recover(&self, op: RemoteOp) {
        self.state.lock().failing.remove(&op);
    }

    /// Delays calls of `op` issued from now on.
    pub fn set_latency(&self, op: RemoteOp, latency: Duration) {
        self.state.lock().latency.insert(op, latency);
    }

    pub fn calls(&self, op: RemoteOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn message_count(&self, group_id: &GroupId) -> usize {
        self.state
            .lock()
            .messages
            .get(group_id)
            .map_or(0, Vec::len)
    }

    pub fn extras(&self, group_id: &GroupId, item_id: &ItemId) -> Option<ExtrasBlob> {
        self.state
            .lock()
            .extras
            .get(&(group_id.clone(), item_id.clone()))
            .cloned()
    }

    async fn begin(&self, op: RemoteOp) -> Result<()> {
        let (failing, latency) = {
            let mut state = self.state.lock();
            *state.calls.entry(op).or_default() += 1;
            (state.failing.contains(&op), state.latency.get(&op).copied())
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if failing {
            return Err(anyhow!("injected failure for {op:?}"));
        }
        Ok(())
    }

    fn rewrite_message(
        &self,
        group_id: &GroupId,
        message_id: &MessageId,
        apply: impl FnOnce(&mut ChatMessage) -> Result<()>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let message = state
            .messages
            .get_mut(group_id)
            .and_then(|messages| messages.iter_mut().find(|m| &m.id == message_id))
            .ok_or_else(|| anyhow!("message {message_id} not found in group {group_id}"))?;
        apply(message)
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn list_messages(&self, group_id: &GroupId) -> Result<Vec<ChatMessage>> {
        self.begin(RemoteOp::ListMessages).await?;
        Ok(self
            .state
            .lock()
            .messages
            .get(group_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_message(
        &self,
        group_id: &GroupId,
        message: NewMessage,
    ) -> Result<ChatMessage> {
        self.begin(RemoteOp::InsertMessage).await?;
        let stored = ChatMessage {
            id: MessageId::generate(),
            group_id: group_id.clone(),
            text: message.text,
            created_at: self.clock.now(),
            created_by: message.created_by,
            reply_to: message.reply_to,
            image_url: message.image_url,
            poll: message.poll,
            reactions: Reactions::new(),
        };
        self.state
            .lock()
            .messages
            .entry(group_id.clone())
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn set_reactions(
        &self,
        group_id: &GroupId,
        message_id: &MessageId,
        reactions: Reactions,
    ) -> Result<()> {
        self.begin(RemoteOp::SetReactions).await?;
        self.rewrite_message(group_id, message_id, |message| {
            message.reactions = reactions;
            Ok(())
        })
    }

    async fn set_poll_votes(
        &self,
        group_id: &GroupId,
        message_id: &MessageId,
        votes: BTreeMap<UserId, String>,
    ) -> Result<()> {
        self.begin(RemoteOp::SetPollVotes).await?;
        self.rewrite_message(group_id, message_id, |message| {
            let poll = message
                .poll
                .as_mut()
                .ok_or_else(|| anyhow!("message {message_id} has no poll"))?;
            poll.votes = votes;
            Ok(())
        })
    }

    async fn list_members(&self, group_id: &GroupId) -> Result<Vec<MemberProfile>> {
        self.begin(RemoteOp::ListMembers).await?;
        Ok(self
            .state
            .lock()
            .members
            .get(group_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert_presence(&self, record: PresenceRecord) -> Result<()> {
        self.begin(RemoteOp::UpsertPresence).await?;
        let mut state = self.state.lock();
        let last_seen = state
            .presence
            .entry((record.group_id, record.user_id))
            .or_insert(record.last_seen_at);
        if record.last_seen_at > *last_seen {
            *last_seen = record.last_seen_at;
        }
        Ok(())
    }

    async fn list_presence(
        &self,
        group_id: &GroupId,
        since: DateTime<Utc>,
    ) -> Result<Vec<PresenceRecord>> {
        self.begin(RemoteOp::ListPresence).await?;
        Ok(self
            .state
            .lock()
            .presence
            .iter()
            .filter(|((group, _), last_seen)| group == group_id && **last_seen > since)
            .map(|((group, user), last_seen)| PresenceRecord {
                group_id: group.clone(),
                user_id: user.clone(),
                last_seen_at: *last_seen,
            })
            .collect())
    }

    async fn fetch_extras(
        &self,
        group_id: &GroupId,
        item_id: &ItemId,
    ) -> Result<Option<ExtrasBlob>> {
        self.begin(RemoteOp::FetchExtras).await?;
        Ok(self.extras(group_id, item_id))
    }

    async fn upsert_extras(
        &self,
        group_id: &GroupId,
        item_id: &ItemId,
        blob: &ExtrasBlob,
    ) -> Result<()> {
        self.begin(RemoteOp::UpsertExtras).await?;
        self.state
            .lock()
            .extras
            .insert((group_id.clone(), item_id.clone()), blob.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUpload {
    pub scope: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
pub struct InMemoryObjectStorage {
    uploads: Mutex<Vec<StoredUpload>>,
    failing: Mutex<bool>,
}

impl InMemoryObjectStorage {
    pub fn uploads(&self) -> Vec<StoredUpload> {
        self.uploads.lock().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }
}

#[async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn upload(&self, bytes: Vec<u8>, scope: &str, content_type: &str) -> Result<String> {
        if *self.failing.lock() {
            return Err(anyhow!("object storage rejected upload"));
        }
        let mut uploads = self.uploads.lock();
        uploads.push(StoredUpload {
            scope: scope.to_string(),
            content_type: content_type.to_string(),
            bytes,
        });
        Ok(format!("memory://{scope}/{}", uploads.len()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PostOp {
    FetchImageRefs,
    SaveImageRefs,
    SetPrimaryImage,
}

#[derive(Default)]
pub struct InMemoryPostStore {
    posts: Mutex<HashMap<PostId, Post>>,
    failing: Mutex<HashSet<PostOp>>,
}

impl InMemoryPostStore {
    pub fn insert(&self, post: Post) {
        self.posts.lock().insert(post.id.clone(), post);
    }

    pub fn post(&self, post_id: &PostId) -> Option<Post> {
        self.posts.lock().get(post_id).cloned()
    }

    pub fn fail(&self, op: PostOp) {
        self.failing.lock().insert(op);
    }

    pub fn recover(&self, op: PostOp) {
        self.failing.lock().remove(&op);
    }

    fn check(&self, op: PostOp) -> Result<()> {
        if self.failing.lock().contains(&op) {
            return Err(anyhow!("injected failure for {op:?}"));
        }
        Ok(())
    }

    fn with_post<T>(&self, post_id: &PostId, apply: impl FnOnce(&mut Post) -> T) -> Result<T> {
        let mut posts = self.posts.lock();
        let post = posts
            .get_mut(post_id)
            .ok_or_else(|| anyhow!("post {post_id} not found"))?;
        Ok(apply(post))
    }
}

#[async_trait]
impl PostStore for InMemoryPostStore {
    async fn fetch_image_refs(&self, post_id: &PostId) -> Result<Option<Vec<String>>> {
        self.check(PostOp::FetchImageRefs)?;
        self.with_post(post_id, |post| post.image_refs.clone())
    }

    async fn save_image_refs(&self, post_id: &PostId, urls: &[String]) -> Result<()> {
        self.check(PostOp::SaveImageRefs)?;
        self.with_post(post_id, |post| post.image_refs = Some(urls.to_vec()))
    }

    async fn set_primary_image(&self, post_id: &PostId, url: &str) -> Result<()> {
        self.check(PostOp::SetPrimaryImage)?;
        self.with_post(post_id, |post| post.image_url = Some(url.to_string()))
    }
}
