use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::warn;
use uuid::Uuid;

use shared::{
    domain::{GroupId, ItemId, MessageId, PostId, UserId},
    models::{ChatMessage, ExtrasBlob, MemberProfile, Post, PresenceRecord, Reactions},
    protocol::NewMessage,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub id: String,
    pub scope: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to `sqlite::memory:` is a separate database.
        let pool_options = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn load_cache_entries(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT cache_key, value FROM local_cache")
            .fetch_all(&self.pool)
            .await
            .context("failed to load local cache entries")?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>(0), row.get::<String, _>(1)))
            .collect())
    }

    pub async fn put_cache_entry(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO local_cache (cache_key, value) VALUES (?, ?)
             ON CONFLICT(cache_key) DO UPDATE SET value=excluded.value, updated_at=CURRENT_TIMESTAMP",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to write local cache entry '{key}'"))?;
        Ok(())
    }

    pub async fn delete_cache_entry(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM local_cache WHERE cache_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete local cache entry '{key}'"))?;
        Ok(())
    }

    pub async fn upsert_member(&self, group_id: &GroupId, user_id: &UserId, name: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO members (group_id, user_id, name) VALUES (?, ?, ?)
             ON CONFLICT(group_id, user_id) DO UPDATE SET name=excluded.name",
        )
        .bind(group_id.as_str())
        .bind(user_id.as_str())
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_members(&self, group_id: &GroupId) -> Result<Vec<MemberProfile>> {
        let rows = sqlx::query("SELECT user_id, name FROM members WHERE group_id = ? ORDER BY name")
            .bind(group_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| MemberProfile {
                user_id: UserId(row.get::<String, _>(0)),
                name: row.get::<String, _>(1),
            })
            .collect())
    }

    pub async fn insert_message(&self, group_id: &GroupId, new: NewMessage) -> Result<ChatMessage> {
        let message = ChatMessage {
            id: MessageId::generate(),
            group_id: group_id.clone(),
            text: new.text,
            created_at: Utc::now(),
            created_by: new.created_by,
            reply_to: new.reply_to,
            image_url: new.image_url,
            poll: new.poll,
            reactions: Reactions::new(),
        };
        let body = serde_json::to_string(&message)?;
        sqlx::query(
            "INSERT INTO messages (id, group_id, created_at_ms, body) VALUES (?, ?, ?, ?)",
        )
        .bind(message.id.as_str())
        .bind(group_id.as_str())
        .bind(message.created_at.timestamp_millis())
        .bind(body)
        .execute(&self.pool)
        .await
        .context("failed to insert message")?;
        Ok(message)
    }

    /// Messages for a group, oldest first.
    pub async fn list_messages(&self, group_id: &GroupId) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT body FROM messages WHERE group_id = ? ORDER BY created_at_ms ASC, seq ASC",
        )
        .bind(group_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.get(0);
            match serde_json::from_str::<ChatMessage>(&body) {
                Ok(message) => messages.push(message),
                Err(error) => warn!(%group_id, %error, "storage: skipping undecodable message row"),
            }
        }
        Ok(messages)
    }

    /// Returns `false` when the message does not exist in the group.
    pub async fn update_message_reactions(
        &self,
        group_id: &GroupId,
        message_id: &MessageId,
        reactions: Reactions,
    ) -> Result<bool> {
        self.rewrite_message(group_id, message_id, |message| {
            message.reactions = reactions;
        })
        .await
    }

    /// Returns `false` when the message does not exist or carries no poll.
    pub async fn update_poll_votes(
        &self,
        group_id: &GroupId,
        message_id: &MessageId,
        votes: BTreeMap<UserId, String>,
    ) -> Result<bool> {
        let mut had_poll = false;
        let found = self
            .rewrite_message(group_id, message_id, |message| {
                if let Some(poll) = message.poll.as_mut() {
                    poll.votes = votes;
                    had_poll = true;
                }
            })
            .await?;
        Ok(found && had_poll)
    }

    async fn rewrite_message(
        &self,
        group_id: &GroupId,
        message_id: &MessageId,
        apply: impl FnOnce(&mut ChatMessage),
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT body FROM messages WHERE id = ? AND group_id = ?")
            .bind(message_id.as_str())
            .bind(group_id.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let mut message: ChatMessage = serde_json::from_str(&row.get::<String, _>(0))
            .with_context(|| format!("message {message_id} has an undecodable body"))?;
        apply(&mut message);
        sqlx::query("UPDATE messages SET body = ? WHERE id = ?")
            .bind(serde_json::to_string(&message)?)
            .bind(message_id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Upsert keeping `last_seen_at` non-decreasing.
    pub async fn upsert_presence(
        &self,
        group_id: &GroupId,
        user_id: &UserId,
        last_seen_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO presence (group_id, user_id, last_seen_at_ms) VALUES (?, ?, ?)
             ON CONFLICT(group_id, user_id)
             DO UPDATE SET last_seen_at_ms = MAX(last_seen_at_ms, excluded.last_seen_at_ms)",
        )
        .bind(group_id.as_str())
        .bind(user_id.as_str())
        .bind(last_seen_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_presence_since(
        &self,
        group_id: &GroupId,
        since: DateTime<Utc>,
    ) -> Result<Vec<PresenceRecord>> {
        let rows = sqlx::query(
            "SELECT user_id, last_seen_at_ms FROM presence
             WHERE group_id = ? AND last_seen_at_ms > ?",
        )
        .bind(group_id.as_str())
        .bind(since.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| PresenceRecord {
                group_id: group_id.clone(),
                user_id: UserId(row.get::<String, _>(0)),
                last_seen_at: millis_to_datetime(row.get::<i64, _>(1)),
            })
            .collect())
    }

    pub async fn load_extras(&self, group_id: &GroupId, item_id: &ItemId) -> Result<Option<ExtrasBlob>> {
        let row = sqlx::query("SELECT blob FROM plan_extras WHERE group_id = ? AND item_id = ?")
            .bind(group_id.as_str())
            .bind(item_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            serde_json::from_str::<ExtrasBlob>(&row.get::<String, _>(0))
                .with_context(|| format!("extras for {group_id}/{item_id} are undecodable"))
        })
        .transpose()
    }

    pub async fn save_extras(&self, group_id: &GroupId, item_id: &ItemId, blob: &ExtrasBlob) -> Result<()> {
        sqlx::query(
            "INSERT INTO plan_extras (group_id, item_id, blob, updated_at_ms) VALUES (?, ?, ?, ?)
             ON CONFLICT(group_id, item_id) DO UPDATE SET blob=excluded.blob, updated_at_ms=excluded.updated_at_ms",
        )
        .bind(group_id.as_str())
        .bind(item_id.as_str())
        .bind(serde_json::to_string(blob)?)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_post(&self, post: &Post) -> Result<()> {
        sqlx::query(
            "INSERT INTO posts (id, group_id, owner_id, body) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET body=excluded.body",
        )
        .bind(post.id.as_str())
        .bind(post.group_id.as_str())
        .bind(post.owner_id.as_str())
        .bind(serde_json::to_string(post)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_post(&self, post_id: &PostId) -> Result<Option<Post>> {
        let row = sqlx::query("SELECT body FROM posts WHERE id = ?")
            .bind(post_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            serde_json::from_str::<Post>(&row.get::<String, _>(0))
                .with_context(|| format!("post {post_id} has an undecodable body"))
        })
        .transpose()
    }

    pub async fn save_image_refs(&self, post_id: &PostId, urls: Vec<String>) -> Result<bool> {
        self.rewrite_post(post_id, |post| post.image_refs = Some(urls))
            .await
    }

    pub async fn set_primary_image(&self, post_id: &PostId, url: String) -> Result<bool> {
        self.rewrite_post(post_id, |post| post.image_url = Some(url))
            .await
    }

    async fn rewrite_post(&self, post_id: &PostId, apply: impl FnOnce(&mut Post)) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT body FROM posts WHERE id = ?")
            .bind(post_id.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let mut post: Post = serde_json::from_str(&row.get::<String, _>(0))
            .with_context(|| format!("post {post_id} has an undecodable body"))?;
        apply(&mut post);
        sqlx::query("UPDATE posts SET body = ? WHERE id = ?")
            .bind(serde_json::to_string(&post)?)
            .bind(post_id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn store_object(&self, scope: &str, content_type: &str, bytes: &[u8]) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO objects (id, scope, content_type, bytes, created_at_ms) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id.as_str())
        .bind(scope)
        .bind(content_type)
        .bind(bytes)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .context("failed to store object")?;
        Ok(id)
    }

    pub async fn load_object(&self, object_id: &str) -> Result<Option<StoredObject>> {
        let row = sqlx::query(
            "SELECT id, scope, content_type, bytes, created_at_ms FROM objects WHERE id = ?",
        )
        .bind(object_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| StoredObject {
            id: row.get(0),
            scope: row.get(1),
            content_type: row.get(2),
            bytes: row.get(3),
            created_at: millis_to_datetime(row.get::<i64, _>(4)),
        }))
    }
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
