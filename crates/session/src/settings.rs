use std::time::Duration;

use granny_storage::DEFAULT_CHAT_TITLE;
use serde::{Deserialize, Serialize};

pub const DEFAULT_TITLE_MAX_CHARS: usize = 50;
pub const DEFAULT_REPLY_DELAY_MS: u64 = 1_000;

/// When a send renames its chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TitlePolicy {
    #[default]
    EveryMessage,
    /// Only while the chat still carries the placeholder title.
    FirstMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_placeholder_title")]
    pub placeholder_title: String,
    #[serde(default = "default_title_max_chars")]
    pub title_max_chars: usize,
    #[serde(default = "default_reply_delay_ms")]
    pub reply_delay_ms: u64,
    #[serde(default)]
    pub title_policy: TitlePolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            placeholder_title: default_placeholder_title(),
            title_max_chars: default_title_max_chars(),
            reply_delay_ms: default_reply_delay_ms(),
            title_policy: TitlePolicy::default(),
        }
    }
}

impl SessionSettings {
    pub fn normalized(mut self) -> Self {
        self.placeholder_title = self.placeholder_title.trim().to_string();
        if self.placeholder_title.is_empty() {
            self.placeholder_title = default_placeholder_title();
        }
        self.title_max_chars = self.title_max_chars.max(1);
        self
    }

    pub fn reply_delay(&self) -> Duration {
        Duration::from_millis(self.reply_delay_ms)
    }

    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_title_policy(mut self, title_policy: TitlePolicy) -> Self {
        self.title_policy = title_policy;
        self
    }
}

fn default_placeholder_title() -> String {
    DEFAULT_CHAT_TITLE.to_string()
}

fn default_title_max_chars() -> usize {
    DEFAULT_TITLE_MAX_CHARS
}

fn default_reply_delay_ms() -> u64 {
    DEFAULT_REPLY_DELAY_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let settings: SessionSettings =
            serde_json::from_str(r#"{"title_policy":"first-message"}"#).expect("parse settings");
        assert_eq!(settings.placeholder_title, "New Chat");
        assert_eq!(settings.title_max_chars, 50);
        assert_eq!(settings.reply_delay(), Duration::from_secs(1));
        assert_eq!(settings.title_policy, TitlePolicy::FirstMessage);
    }

    #[test]
    fn normalization_repairs_blank_placeholder_and_zero_width_titles() {
        let settings = SessionSettings {
            placeholder_title: "   ".to_string(),
            title_max_chars: 0,
            ..SessionSettings::default()
        }
        .normalized();

        assert_eq!(settings.placeholder_title, DEFAULT_CHAT_TITLE);
        assert_eq!(settings.title_max_chars, 1);
    }
}
