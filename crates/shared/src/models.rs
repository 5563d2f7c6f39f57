use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{GroupId, MemberRef, MessageId, PostId, UserId};

/// emoji -> users who reacted with it.
pub type Reactions = BTreeMap<String, BTreeSet<UserId>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub group_id: GroupId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub created_by: MemberRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll: Option<Poll>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reactions: Reactions,
}

impl ChatMessage {
    /// Reactions after `user_id` toggles `emoji`. Empty emoji buckets are dropped.
    pub fn toggled_reactions(&self, emoji: &str, user_id: &UserId) -> Reactions {
        let mut reactions = self.reactions.clone();
        let users = reactions.entry(emoji.to_string()).or_default();
        if !users.remove(user_id) {
            users.insert(user_id.clone());
        }
        reactions.retain(|_, users| !users.is_empty());
        reactions
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollOption {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Poll {
    pub question: String,
    pub options: Vec<PollOption>,
    /// user -> option id
    #[serde(default)]
    pub votes: BTreeMap<UserId, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closes_at: Option<DateTime<Utc>>,
}

impl Poll {
    pub fn is_closed(&self, now: DateTime<Utc>) -> bool {
        self.closes_at.is_some_and(|closes_at| now > closes_at)
    }

    pub fn has_option(&self, option_id: &str) -> bool {
        self.options.iter().any(|option| option.id == option_id)
    }

    pub fn tally(&self) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> = self
            .options
            .iter()
            .map(|option| (option.id.clone(), 0))
            .collect();
        for option_id in self.votes.values() {
            if let Some(count) = counts.get_mut(option_id) {
                *count += 1;
            }
        }
        counts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub group_id: GroupId,
    pub user_id: UserId,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberProfile {
    pub user_id: UserId,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DinnerPlan {
    pub items: Vec<String>,
    /// user -> menu item
    pub votes_by_user: BTreeMap<UserId, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closes_at: Option<DateTime<Utc>>,
}

impl DinnerPlan {
    pub fn is_closed(&self, now: DateTime<Utc>) -> bool {
        self.closes_at.is_some_and(|closes_at| now > closes_at)
    }

    pub fn tally(&self) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> =
            self.items.iter().map(|item| (item.clone(), 0)).collect();
        for item in self.votes_by_user.values() {
            if let Some(count) = counts.get_mut(item) {
                *count += 1;
            }
        }
        counts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FacilityInfo {
    pub wifi: String,
    pub parking: String,
    pub notes: Vec<Note>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventNotes {
    pub notes: Vec<Note>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub author: MemberRef,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Shared per-item plan state. Always written as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtrasBlob {
    pub dinner: DinnerPlan,
    pub facility: FacilityInfo,
    pub event_notes: EventNotes,
    pub about: String,
    pub sub_items: Vec<SubItem>,
    pub comments: Vec<Comment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: PostId,
    pub group_id: GroupId,
    pub owner_id: UserId,
    /// Image sources as authored: `data:` payloads or external URLs.
    #[serde(default)]
    pub inline_images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Externalized image references, present once migration completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_refs: Option<Vec<String>>,
}
