use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, StatusCode};
use shared::{
    domain::{GroupId, ItemId, MessageId, PostId, UserId},
    models::{ChatMessage, ExtrasBlob, MemberProfile, PresenceRecord, Reactions},
    protocol::{
        ImageRefsUpdate, NewMessage, ObjectUploadQuery, ObjectUploadResponse, PollVotesUpdate,
        PresenceQuery, PresenceUpsert, PrimaryImageUpdate, ReactionsUpdate,
    },
};
use url::Url;

use crate::remote::{ObjectStorage, PostStore, RemoteStore};

/// Base URL plus the shared reqwest client; cheap to clone.
#[derive(Clone)]
pub struct BackendEndpoint {
    http: Client,
    base: Url,
}

impl BackendEndpoint {
    pub fn new(server_url: &str) -> Result<Self> {
        Self::with_client(Client::new(), server_url)
    }

    pub fn with_client(http: Client, server_url: &str) -> Result<Self> {
        let base = Url::parse(server_url.trim())
            .with_context(|| format!("invalid backend url '{server_url}'"))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(anyhow!("backend url must start with http:// or https://"));
        }
        Ok(Self { http, base })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("backend url '{}' cannot carry a path", self.base))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

pub struct HttpRemoteStore {
    endpoint: BackendEndpoint,
}

impl HttpRemoteStore {
    pub fn new(endpoint: BackendEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn list_messages(&self, group_id: &GroupId) -> Result<Vec<ChatMessage>> {
        let url = self.endpoint.url(&["groups", group_id.as_str(), "messages"])?;
        let messages = self
            .endpoint
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(messages)
    }

    async fn insert_message(
        &self,
        group_id: &GroupId,
        message: NewMessage,
    ) -> Result<ChatMessage> {
        let url = self.endpoint.url(&["groups", group_id.as_str(), "messages"])?;
        let stored = self
            .endpoint
            .http
            .post(url)
            .json(&message)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(stored)
    }

    async fn set_reactions(
        &self,
        group_id: &GroupId,
        message_id: &MessageId,
        reactions: Reactions,
    ) -> Result<()> {
        let url = self.endpoint.url(&[
            "groups",
            group_id.as_str(),
            "messages",
            message_id.as_str(),
            "reactions",
        ])?;
        self.endpoint
            .http
            .put(url)
            .json(&ReactionsUpdate { reactions })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn set_poll_votes(
        &self,
        group_id: &GroupId,
        message_id: &MessageId,
        votes: BTreeMap<UserId, String>,
    ) -> Result<()> {
        let url = self.endpoint.url(&[
            "groups",
            group_id.as_str(),
            "messages",
            message_id.as_str(),
            "votes",
        ])?;
        self.endpoint
            .http
            .put(url)
            .json(&PollVotesUpdate { votes })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn list_members(&self, group_id: &GroupId) -> Result<Vec<MemberProfile>> {
        let url = self.endpoint.url(&["groups", group_id.as_str(), "members"])?;
        let members = self
            .endpoint
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(members)
    }

    async fn upsert_presence(&self, record: PresenceRecord) -> Result<()> {
        let url = self.endpoint.url(&[
            "groups",
            record.group_id.as_str(),
            "presence",
            record.user_id.as_str(),
        ])?;
        self.endpoint
            .http
            .put(url)
            .json(&PresenceUpsert {
                last_seen_at: record.last_seen_at,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn list_presence(
        &self,
        group_id: &GroupId,
        since: DateTime<Utc>,
    ) -> Result<Vec<PresenceRecord>> {
        let url = self.endpoint.url(&["groups", group_id.as_str(), "presence"])?;
        let records = self
            .endpoint
            .http
            .get(url)
            .query(&PresenceQuery { since })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(records)
    }

    async fn fetch_extras(
        &self,
        group_id: &GroupId,
        item_id: &ItemId,
    ) -> Result<Option<ExtrasBlob>> {
        let url = self
            .endpoint
            .url(&["groups", group_id.as_str(), "extras", item_id.as_str()])?;
        let response = self.endpoint.http.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let blob = response.error_for_status()?.json().await?;
        Ok(Some(blob))
    }

    async fn upsert_extras(
        &self,
        group_id: &GroupId,
        item_id: &ItemId,
        blob: &ExtrasBlob,
    ) -> Result<()> {
        let url = self
            .endpoint
            .url(&["groups", group_id.as_str(), "extras", item_id.as_str()])?;
        self.endpoint
            .http
            .put(url)
            .json(blob)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

pub struct HttpObjectStorage {
    endpoint: BackendEndpoint,
}

impl HttpObjectStorage {
    pub fn new(endpoint: BackendEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn upload(&self, bytes: Vec<u8>, scope: &str, content_type: &str) -> Result<String> {
        let url = self.endpoint.url(&["objects"])?;
        let response: ObjectUploadResponse = self
            .endpoint
            .http
            .post(url)
            .query(&ObjectUploadQuery {
                scope: scope.to_string(),
                content_type: content_type.to_string(),
            })
            .header(header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.url)
    }
}

pub struct HttpPostStore {
    endpoint: BackendEndpoint,
}

impl HttpPostStore {
    pub fn new(endpoint: BackendEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl PostStore for HttpPostStore {
    async fn fetch_image_refs(&self, post_id: &PostId) -> Result<Option<Vec<String>>> {
        let url = self.endpoint.url(&["posts", post_id.as_str(), "image_refs"])?;
        let refs = self
            .endpoint
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(refs)
    }

    async fn save_image_refs(&self, post_id: &PostId, urls: &[String]) -> Result<()> {
        let url = self.endpoint.url(&["posts", post_id.as_str(), "image_refs"])?;
        self.endpoint
            .http
            .put(url)
            .json(&ImageRefsUpdate {
                urls: urls.to_vec(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn set_primary_image(&self, post_id: &PostId, url: &str) -> Result<()> {
        let endpoint = self
            .endpoint
            .url(&["posts", post_id.as_str(), "primary_image"])?;
        self.endpoint
            .http
            .put(endpoint)
            .json(&PrimaryImageUpdate {
                url: url.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
