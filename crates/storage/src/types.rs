use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use super::ids::{ChatId, MessageId, OwnerId};

/// Title a chat carries until its first message renames it.
pub const DEFAULT_CHAT_TITLE: &str = "New Chat";

/// Who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Author {
    User,
    Respondent,
}

impl Author {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Respondent => "respondent",
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Self::User)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRecord {
    pub id: ChatId,
    pub owner_id: OwnerId,
    pub title: String,
    pub created_at_unix_millis: u64,
    pub updated_at_unix_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChat {
    pub owner_id: OwnerId,
    pub title: String,
}

impl NewChat {
    pub fn new(owner_id: OwnerId, title: impl Into<String>) -> Self {
        Self {
            owner_id,
            title: title.into(),
        }
    }
}

/// Partial chat update. Applying any patch also advances `updated_at`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChatPatch {
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub content: String,
    pub author: Author,
    pub attachment_ref: Option<String>,
    pub created_at_unix_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub content: String,
    pub author: Author,
    pub attachment_ref: Option<String>,
}

impl NewMessage {
    pub fn user(
        chat_id: ChatId,
        content: impl Into<String>,
        attachment_ref: Option<String>,
    ) -> Self {
        Self {
            chat_id,
            content: content.into(),
            author: Author::User,
            attachment_ref,
        }
    }

    pub fn respondent(chat_id: ChatId, content: impl Into<String>) -> Self {
        Self {
            chat_id,
            content: content.into(),
            author: Author::Respondent,
            attachment_ref: None,
        }
    }
}

/// Most recently updated first; equal stamps fall back to the newer id first.
pub fn cmp_recent_first(left: &ChatRecord, right: &ChatRecord) -> Ordering {
    right
        .updated_at_unix_millis
        .cmp(&left.updated_at_unix_millis)
        .then_with(|| right.id.cmp(&left.id))
}

pub fn sort_chats_recent_first(chats: &mut [ChatRecord]) {
    chats.sort_by(cmp_recent_first);
}

pub fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| {
            u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
        })
}
