use std::{collections::HashSet, sync::Arc};

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::Mutex;
use shared::{
    domain::{PostId, UserId},
    models::Post,
};
use tracing::{debug, info, warn};

use crate::remote::{ObjectStorage, PostStore};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    NotOwner,
    AlreadyAttempted,
    AlreadyMigrated,
    NothingToMigrate,
    Migrated { urls: Vec<String> },
    Failed,
}

/// Inline `data:` image decoded for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlinePayload {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl InlinePayload {
    pub fn is_inline(source: &str) -> bool {
        source.starts_with("data:")
    }

    /// Parses `data:<type>;base64,<payload>`.
    pub fn parse(source: &str) -> Result<Self> {
        let rest = source
            .strip_prefix("data:")
            .ok_or_else(|| anyhow!("not a data url"))?;
        let (meta, payload) = rest
            .split_once(',')
            .ok_or_else(|| anyhow!("data url has no payload separator"))?;
        let content_type = meta
            .strip_suffix(";base64")
            .ok_or_else(|| anyhow!("only base64 data urls are supported"))?;
        let content_type = if content_type.is_empty() {
            DEFAULT_CONTENT_TYPE.to_string()
        } else {
            content_type.to_string()
        };
        let bytes = STANDARD
            .decode(payload.trim())
            .context("data url payload is not valid base64")?;
        Ok(Self {
            content_type,
            bytes,
        })
    }
}

/// Moves inline post images to object storage, at most once per post per
/// session. The image reference list is written last and marks completion.
pub struct MediaMigrator {
    posts: Arc<dyn PostStore>,
    objects: Arc<dyn ObjectStorage>,
    session_user: UserId,
    attempted: Mutex<HashSet<PostId>>,
}

impl MediaMigrator {
    pub fn new(
        posts: Arc<dyn PostStore>,
        objects: Arc<dyn ObjectStorage>,
        session_user: UserId,
    ) -> Self {
        Self {
            posts,
            objects,
            session_user,
            attempted: Mutex::new(HashSet::new()),
        }
    }

    pub async fn migrate(&self, post: &Post) -> MigrationOutcome {
        if post.owner_id != self.session_user {
            return MigrationOutcome::NotOwner;
        }
        if !self.attempted.lock().insert(post.id.clone()) {
            return MigrationOutcome::AlreadyAttempted;
        }
        if post.image_refs.is_some() {
            return MigrationOutcome::AlreadyMigrated;
        }
        if !post
            .inline_images
            .iter()
            .any(|source| InlinePayload::is_inline(source))
        {
            return MigrationOutcome::NothingToMigrate;
        }

        match self.externalize(post).await {
            Ok(Some(urls)) => {
                info!(post_id = %post.id, images = urls.len(), "media: migrated inline images");
                MigrationOutcome::Migrated { urls }
            }
            Ok(None) => MigrationOutcome::AlreadyMigrated,
            Err(error) => {
                warn!(
                    post_id = %post.id,
                    error = %format!("{error:#}"),
                    "media: migration aborted; keeping inline images"
                );
                MigrationOutcome::Failed
            }
        }
    }

    pub async fn migrate_all(&self, posts: &[Post]) -> Vec<MigrationOutcome> {
        let mut outcomes = Vec::with_capacity(posts.len());
        for post in posts {
            outcomes.push(self.migrate(post).await);
        }
        outcomes
    }

    async fn externalize(&self, post: &Post) -> Result<Option<Vec<String>>> {
        if self
            .posts
            .fetch_image_refs(&post.id)
            .await
            .context("failed to check existing image refs")?
            .is_some()
        {
            debug!(post_id = %post.id, "media: post already externalized elsewhere");
            return Ok(None);
        }

        let scope = format!("groups/{}/posts", post.group_id);
        let mut urls = Vec::with_capacity(post.inline_images.len());
        for (index, source) in post.inline_images.iter().enumerate() {
            if !InlinePayload::is_inline(source) {
                urls.push(source.clone());
                continue;
            }
            let payload = InlinePayload::parse(source)
                .with_context(|| format!("image {index} could not be decoded"))?;
            let url = self
                .objects
                .upload(payload.bytes, &scope, &payload.content_type)
                .await
                .with_context(|| format!("image {index} upload failed"))?;
            urls.push(url);
        }

        if let Some(primary) = urls.first() {
            self.posts
                .set_primary_image(&post.id, primary)
                .await
                .context("failed to set primary image")?;
        }
        self.posts
            .save_image_refs(&post.id, &urls)
            .await
            .context("failed to save image refs")?;
        Ok(Some(urls))
    }
}

#[cfg(test)]
#[path = "tests/media_tests.rs"]
mod tests;
