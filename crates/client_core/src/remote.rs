use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{GroupId, ItemId, MessageId, PostId, UserId},
    models::{ChatMessage, ExtrasBlob, MemberProfile, PresenceRecord, Reactions},
    protocol::NewMessage,
};

/// Shared backend holding every group's records. Calls are independent: no
/// atomicity is assumed across them.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Oldest first.
    async fn list_messages(&self, group_id: &GroupId) -> Result<Vec<ChatMessage>>;
    async fn insert_message(&self, group_id: &GroupId, message: NewMessage)
        -> Result<ChatMessage>;
    async fn set_reactions(
        &self,
        group_id: &GroupId,
        message_id: &MessageId,
        reactions: Reactions,
    ) -> Result<()>;
    async fn set_poll_votes(
        &self,
        group_id: &GroupId,
        message_id: &MessageId,
        votes: BTreeMap<UserId, String>,
    ) -> Result<()>;
    async fn list_members(&self, group_id: &GroupId) -> Result<Vec<MemberProfile>>;
    async fn upsert_presence(&self, record: PresenceRecord) -> Result<()>;
    /// Records seen strictly after `since`.
    async fn list_presence(
        &self,
        group_id: &GroupId,
        since: DateTime<Utc>,
    ) -> Result<Vec<PresenceRecord>>;
    async fn fetch_extras(&self, group_id: &GroupId, item_id: &ItemId)
        -> Result<Option<ExtrasBlob>>;
    async fn upsert_extras(
        &self,
        group_id: &GroupId,
        item_id: &ItemId,
        blob: &ExtrasBlob,
    ) -> Result<()>;
}

/// External binary object storage returning publicly resolvable URLs.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, scope: &str, content_type: &str) -> Result<String>;
}

/// Post image bookkeeping used by media migration.
#[async_trait]
pub trait PostStore: Send + Sync {
    async fn fetch_image_refs(&self, post_id: &PostId) -> Result<Option<Vec<String>>>;
    async fn save_image_refs(&self, post_id: &PostId, urls: &[String]) -> Result<()>;
    async fn set_primary_image(&self, post_id: &PostId, url: &str) -> Result<()>;
}
