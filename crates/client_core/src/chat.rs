use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shared::{
    domain::{GroupId, MemberRef, MessageId, UserId},
    models::{ChatMessage, MemberProfile, Poll},
    protocol::NewMessage,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    cache::{CacheKey, LocalCache},
    clock::{Clock, SystemClock},
    config::SyncSettings,
    error::{SyncError, SyncResult},
    presence::PresenceTracker,
    remote::RemoteStore,
    timer::IntervalTask,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatSettings {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub online_window: Duration,
    pub notice_ttl: Duration,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self::from(&SyncSettings::default())
    }
}

impl From<&SyncSettings> for ChatSettings {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            heartbeat_interval: settings.heartbeat_interval(),
            online_window: settings.online_window(),
            notice_ttl: settings.notice_ttl(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatView {
    pub group_id: Option<GroupId>,
    pub messages: Vec<ChatMessage>,
    pub members: Vec<MemberProfile>,
    pub online: BTreeSet<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Polling,
}

/// Message as composed by the user, before the store assigns id and time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub text: String,
    pub image_url: Option<String>,
    pub reply_to: Option<MessageId>,
    pub poll: Option<Poll>,
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatAction {
    Send,
    React,
    Vote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub id: u64,
    pub action: ChatAction,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    ViewUpdated { view: ChatView, unread: usize },
    Notice(Notice),
    NoticeDismissed { id: u64 },
}

/// Count-based unread tracking for the chat surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnreadCounter {
    surface_open: bool,
    last_seen_count: usize,
}

impl UnreadCounter {
    pub fn show(&mut self, live: usize) {
        self.surface_open = true;
        self.last_seen_count = self.last_seen_count.max(live);
    }

    pub fn hide(&mut self) {
        self.surface_open = false;
    }

    /// Called with every freshly fetched count.
    pub fn observe(&mut self, live: usize) {
        if self.surface_open {
            self.last_seen_count = self.last_seen_count.max(live);
        }
    }

    pub fn unread(&self, live: usize) -> usize {
        if self.surface_open {
            0
        } else {
            live.saturating_sub(self.last_seen_count)
        }
    }

    pub fn is_open(&self) -> bool {
        self.surface_open
    }

    pub fn last_seen_count(&self) -> usize {
        self.last_seen_count
    }
}

#[derive(Default)]
struct ChatState {
    group_id: Option<GroupId>,
    // Bumped whenever the group changes; responses carry the value they were issued under.
    generation: u64,
    identity: Option<MemberRef>,
    view: ChatView,
    unread: UnreadCounter,
    poller: Option<IntervalTask>,
    heartbeat: Option<IntervalTask>,
    notices: Vec<Notice>,
}

impl ChatState {
    fn unread_count(&self) -> usize {
        self.unread.unread(self.view.messages.len())
    }
}

pub struct ChatSyncEngine {
    remote: Arc<dyn RemoteStore>,
    cache: LocalCache,
    clock: Arc<dyn Clock>,
    presence: Arc<PresenceTracker>,
    settings: ChatSettings,
    events: broadcast::Sender<SyncEvent>,
    next_notice_id: AtomicU64,
    state: Mutex<ChatState>,
}

impl ChatSyncEngine {
    pub fn new(remote: Arc<dyn RemoteStore>, cache: LocalCache, settings: ChatSettings) -> Arc<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let presence = Arc::new(PresenceTracker::new(remote.clone(), clock.clone()));
        Self::new_with_dependencies(remote, cache, clock, presence, settings)
    }

    pub fn new_with_dependencies(
        remote: Arc<dyn RemoteStore>,
        cache: LocalCache,
        clock: Arc<dyn Clock>,
        presence: Arc<PresenceTracker>,
        settings: ChatSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            remote,
            cache,
            clock,
            presence,
            settings,
            events,
            next_notice_id: AtomicU64::new(1),
            state: Mutex::new(ChatState::default()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    /// Starts polling `group_id`. Switching groups stops the previous group's
    /// timers and resets the view to the new group's cached messages.
    /// Must be called from within a tokio runtime.
    pub fn open(self: &Arc<Self>, group_id: GroupId) {
        let (view, unread) = {
            let mut state = self.state.lock();
            if state.group_id.as_ref() != Some(&group_id) {
                state.generation += 1;
                state.poller = None;
                state.heartbeat = None;
                state.unread = UnreadCounter {
                    surface_open: state.unread.is_open(),
                    last_seen_count: 0,
                };
                let cached: Vec<ChatMessage> = self
                    .cache
                    .read(&CacheKey::messages(&group_id))
                    .unwrap_or_default();
                let live = cached.len();
                state.view = ChatView {
                    group_id: Some(group_id.clone()),
                    messages: cached,
                    ..ChatView::default()
                };
                state.unread.observe(live);
                state.group_id = Some(group_id.clone());
                info!(%group_id, cached = live, "chat: opened group");
            }

            if state.poller.is_none() {
                state.poller = self.spawn_poller(&group_id, state.generation);
            }
            if state.heartbeat.is_none() {
                if let Some(identity) = state.identity.clone() {
                    state.heartbeat = self.spawn_heartbeat(&group_id, identity.user_id);
                }
            }
            (state.view.clone(), state.unread_count())
        };
        let _ = self.events.send(SyncEvent::ViewUpdated { view, unread });
    }

    /// Stops polling. The heartbeat keeps running while an identity is set.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.poller.take().is_some() {
            debug!(group_id = ?state.group_id, "chat: polling stopped");
        }
    }

    pub fn state(&self) -> PollState {
        if self.state.lock().poller.is_some() {
            PollState::Polling
        } else {
            PollState::Idle
        }
    }

    pub fn group_id(&self) -> Option<GroupId> {
        self.state.lock().group_id.clone()
    }

    pub fn view(&self) -> ChatView {
        self.state.lock().view.clone()
    }

    /// Marks the chat surface visible; everything fetched so far counts as seen.
    pub fn show(&self) {
        let mut state = self.state.lock();
        let live = state.view.messages.len();
        state.unread.show(live);
    }

    pub fn hide(&self) {
        self.state.lock().unread.hide();
    }

    pub fn unread_count(&self) -> usize {
        self.state.lock().unread_count()
    }

    /// Sets who is chatting. `Some` (re)starts the heartbeat for the current
    /// group, `None` stops it.
    pub fn set_identity(self: &Arc<Self>, identity: Option<MemberRef>) {
        let mut state = self.state.lock();
        state.heartbeat = None;
        state.identity = identity.clone();
        if let (Some(identity), Some(group_id)) = (identity, state.group_id.clone()) {
            state.heartbeat = self.spawn_heartbeat(&group_id, identity.user_id);
        }
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.poller = None;
        state.heartbeat = None;
        info!(group_id = ?state.group_id, "chat: shut down");
    }

    /// Runs one poll cycle for the current group and waits for it.
    pub async fn refresh_now(&self) -> SyncResult<()> {
        let (group_id, generation) = self.current_group()?;
        self.poll_cycle(&group_id, generation).await?;
        Ok(())
    }

    pub async fn send(&self, outgoing: OutgoingMessage) -> SyncResult<ChatMessage> {
        let result = self.try_send(outgoing).await;
        self.report(ChatAction::Send, result)
    }

    pub async fn toggle_reaction(&self, message_id: &MessageId, emoji: &str) -> SyncResult<()> {
        let result = self.try_toggle_reaction(message_id, emoji).await;
        self.report(ChatAction::React, result)
    }

    pub async fn vote_poll(&self, message_id: &MessageId, option_id: &str) -> SyncResult<()> {
        let result = self.try_vote_poll(message_id, option_id).await;
        self.report(ChatAction::Vote, result)
    }

    /// Notices that have not yet expired.
    pub fn notices(&self) -> Vec<Notice> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(self.settings.notice_ttl)
            .unwrap_or(chrono::Duration::zero());
        let mut state = self.state.lock();
        state.notices.retain(|notice| now - notice.raised_at < ttl);
        state.notices.clone()
    }

    pub fn dismiss_notice(&self, id: u64) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let before = state.notices.len();
            state.notices.retain(|notice| notice.id != id);
            state.notices.len() != before
        };
        if removed {
            let _ = self.events.send(SyncEvent::NoticeDismissed { id });
        }
        removed
    }

    async fn try_send(&self, outgoing: OutgoingMessage) -> SyncResult<ChatMessage> {
        let text = outgoing.text.trim().to_string();
        let image_url = outgoing.image_url.filter(|url| !url.trim().is_empty());
        if text.is_empty() && image_url.is_none() {
            return Err(SyncError::validation("message needs text or an image"));
        }
        let (group_id, generation) = self.current_group()?;
        let created_by = self.current_identity()?;

        let stored = self
            .remote
            .insert_message(
                &group_id,
                NewMessage {
                    text,
                    created_by,
                    reply_to: outgoing.reply_to,
                    image_url,
                    poll: outgoing.poll,
                },
            )
            .await?;
        info!(%group_id, message_id = %stored.id, "chat: message sent");
        self.refetch(&group_id, generation).await;
        Ok(stored)
    }

    async fn try_toggle_reaction(&self, message_id: &MessageId, emoji: &str) -> SyncResult<()> {
        if emoji.trim().is_empty() {
            return Err(SyncError::validation("reaction emoji is empty"));
        }
        let (group_id, generation) = self.current_group()?;
        let identity = self.current_identity()?;
        let message = self.find_message(message_id)?;

        let reactions = message.toggled_reactions(emoji, &identity.user_id);
        self.remote
            .set_reactions(&group_id, message_id, reactions)
            .await?;
        self.refetch(&group_id, generation).await;
        Ok(())
    }

    async fn try_vote_poll(&self, message_id: &MessageId, option_id: &str) -> SyncResult<()> {
        let (group_id, generation) = self.current_group()?;
        let identity = self.current_identity()?;
        let message = self.find_message(message_id)?;
        let Some(poll) = message.poll else {
            return Err(SyncError::validation(format!(
                "message {message_id} has no poll"
            )));
        };
        if poll.is_closed(self.clock.now()) {
            return Err(SyncError::validation("poll is closed"));
        }
        if !poll.has_option(option_id) {
            return Err(SyncError::validation(format!(
                "poll has no option '{option_id}'"
            )));
        }

        let mut votes = poll.votes;
        votes.insert(identity.user_id, option_id.to_string());
        self.remote
            .set_poll_votes(&group_id, message_id, votes)
            .await?;
        self.refetch(&group_id, generation).await;
        Ok(())
    }

    fn report<T>(&self, action: ChatAction, result: SyncResult<T>) -> SyncResult<T> {
        if let Err(error) = &result {
            self.raise_notice(action, error.to_string());
        }
        result
    }

    fn raise_notice(&self, action: ChatAction, message: String) {
        let notice = Notice {
            id: self.next_notice_id.fetch_add(1, Ordering::Relaxed),
            action,
            message,
            raised_at: self.clock.now(),
        };
        warn!(action = ?action, message = %notice.message, "chat: action failed");
        self.state.lock().notices.push(notice.clone());
        let _ = self.events.send(SyncEvent::Notice(notice));
    }

    fn current_group(&self) -> SyncResult<(GroupId, u64)> {
        let state = self.state.lock();
        state
            .group_id
            .clone()
            .map(|group_id| (group_id, state.generation))
            .ok_or_else(|| SyncError::validation("no group is open"))
    }

    fn current_identity(&self) -> SyncResult<MemberRef> {
        self.state
            .lock()
            .identity
            .clone()
            .ok_or_else(|| SyncError::validation("no identity set"))
    }

    fn find_message(&self, message_id: &MessageId) -> SyncResult<ChatMessage> {
        self.state
            .lock()
            .view
            .messages
            .iter()
            .find(|message| &message.id == message_id)
            .cloned()
            .ok_or_else(|| SyncError::validation(format!("unknown message {message_id}")))
    }

    /// Follow-up fetch after a successful mutation. A failure here only
    /// delays the update until the next tick.
    async fn refetch(&self, group_id: &GroupId, generation: u64) {
        if let Err(error) = self.poll_cycle(group_id, generation).await {
            debug!(%group_id, %error, "chat: refetch after mutation failed");
        }
    }

    async fn poll_cycle(&self, group_id: &GroupId, generation: u64) -> Result<()> {
        let (messages, members, online) = tokio::join!(
            self.remote.list_messages(group_id),
            self.remote.list_members(group_id),
            self.presence
                .online_members(group_id, self.settings.online_window),
        );
        let messages = messages?;
        let members = members?;
        self.apply(group_id, generation, messages, members, online);
        Ok(())
    }

    fn apply(
        &self,
        group_id: &GroupId,
        generation: u64,
        messages: Vec<ChatMessage>,
        members: Vec<MemberProfile>,
        online: BTreeSet<UserId>,
    ) {
        let (view, unread) = {
            let mut state = self.state.lock();
            if state.generation != generation || state.group_id.as_ref() != Some(group_id) {
                debug!(%group_id, "chat: discarding response for a previous group");
                return;
            }
            state.unread.observe(messages.len());
            self.cache.write(&CacheKey::messages(group_id), &messages);
            state.view = ChatView {
                group_id: Some(group_id.clone()),
                messages,
                members,
                online,
            };
            (state.view.clone(), state.unread_count())
        };
        let _ = self.events.send(SyncEvent::ViewUpdated { view, unread });
    }

    fn spawn_poller(
        self: &Arc<Self>,
        group_id: &GroupId,
        generation: u64,
    ) -> Option<IntervalTask> {
        let engine: Weak<Self> = Arc::downgrade(self);
        let polled = group_id.clone();
        let task = IntervalTask::spawn("chat-poll", self.settings.poll_interval, move || {
            let engine = engine.clone();
            let group_id = polled.clone();
            async move {
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                if let Err(error) = engine.poll_cycle(&group_id, generation).await {
                    debug!(%group_id, %error, "chat: background poll failed; keeping stale view");
                }
            }
        });
        task.map_err(|error| warn!(%group_id, %error, "chat: polling not started"))
            .ok()
    }

    fn spawn_heartbeat(
        self: &Arc<Self>,
        group_id: &GroupId,
        user_id: UserId,
    ) -> Option<IntervalTask> {
        let presence = Arc::downgrade(&self.presence);
        let beating = group_id.clone();
        let period = self.settings.heartbeat_interval;
        let task = IntervalTask::spawn("presence-heartbeat", period, move || {
            let presence = presence.clone();
            let group_id = beating.clone();
            let user_id = user_id.clone();
            async move {
                let Some(presence) = presence.upgrade() else {
                    return;
                };
                if let Err(error) = presence.heartbeat(&group_id, &user_id).await {
                    debug!(%group_id, %user_id, %error, "presence: heartbeat skipped");
                }
            }
        });
        task.map_err(|error| warn!(%group_id, %error, "presence: heartbeat not started"))
            .ok()
    }
}

#[cfg(test)]
#[path = "tests/chat_tests.rs"]
mod tests;
