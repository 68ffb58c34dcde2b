use granny_storage::{ChatId, MessageRecord};

use crate::identity::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeLevel {
    Info,
    Error,
}

/// Transient user-facing message. Hosts decide how to present it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub level: NoticeLevel,
    pub title: String,
    pub description: String,
}

impl Notification {
    pub fn info(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            title: title.into(),
            description: description.into(),
        }
    }

    pub fn error(description: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            title: "Error".to_string(),
            description: description.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.level, NoticeLevel::Error)
    }
}

/// Emitted after the session snapshot changes or something needs the user's attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Notice(Notification),
    IdentityChanged(Option<Identity>),
    ChatsReplaced,
    ChatSelected(ChatId),
    MessagesReplaced(ChatId),
    MessageAppended(MessageRecord),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_notices_share_one_title() {
        let notice = Notification::error("Failed to load chats");
        assert!(notice.is_error());
        assert_eq!(notice.title, "Error");

        let notice = Notification::info("Signed in", "3 chats");
        assert!(!notice.is_error());
        assert_eq!(notice.level, NoticeLevel::Info);
    }
}
