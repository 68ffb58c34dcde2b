use granny_storage::{ChatId, StorageError};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("no identity is signed in on `{stage}`"))]
    Unauthenticated { stage: &'static str },
    #[snafu(display("no chat is selected on `{stage}`"))]
    NoChatSelected { stage: &'static str },
    #[snafu(display("message content is empty on `{stage}`"))]
    EmptyContent { stage: &'static str },
    #[snafu(display("chat {chat_id} is not in the chat list on `{stage}`"))]
    UnknownChat {
        stage: &'static str,
        chat_id: ChatId,
    },
    #[snafu(display("remote store unavailable on `{stage}`: {source}"))]
    RemoteUnavailable {
        stage: &'static str,
        source: StorageError,
    },
    /// The work completed after its identity or selection moved on; the result was discarded.
    #[snafu(display("result discarded on `{stage}` because the session moved on"))]
    Superseded { stage: &'static str },
}

impl SessionError {
    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded { .. })
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::Unauthenticated { stage }
            | Self::NoChatSelected { stage }
            | Self::EmptyContent { stage }
            | Self::UnknownChat { stage, .. }
            | Self::RemoteUnavailable { stage, .. }
            | Self::Superseded { stage } => stage,
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
