use std::future::Future;
use std::sync::Arc;

use granny_storage::{ChatId, ChatPatch, MessageRecord, NewMessage, OwnerId, RemoteStore};
use snafu::{OptionExt, ResultExt, ensure};

use crate::error::{
    EmptyContentSnafu, NoChatSelectedSnafu, RemoteUnavailableSnafu, SessionResult,
    SupersededSnafu, UnauthenticatedSnafu,
};
use crate::responder::Responder;
use crate::scheduler::{ReplyHandle, ReplyKey, ReplyPhase, ReplyScheduler};
use crate::settings::{SessionSettings, TitlePolicy};
use crate::state::{SessionSnapshot, SharedState};

/// A committed user message and the reply it scheduled.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message: MessageRecord,
    pub reply: ReplyHandle,
}

/// What a send captured when it was called.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Draft {
    chat_id: ChatId,
    owner_id: OwnerId,
    epoch: u64,
    content: String,
    attachment_ref: Option<String>,
}

impl Draft {
    fn capture(
        snapshot: &SessionSnapshot,
        content: &str,
        attachment_ref: Option<String>,
    ) -> SessionResult<Self> {
        let content = content.trim();
        ensure!(
            !content.is_empty(),
            EmptyContentSnafu {
                stage: "send-validate-content",
            }
        );
        let owner_id = snapshot.owner_id().context(UnauthenticatedSnafu {
            stage: "send-validate-identity",
        })?;
        let chat_id = snapshot.selected_chat_id().context(NoChatSelectedSnafu {
            stage: "send-validate-selection",
        })?;

        Ok(Self {
            chat_id,
            owner_id: owner_id.clone(),
            epoch: snapshot.epoch,
            content: content.to_string(),
            attachment_ref: attachment_ref
                .map(|reference| reference.trim().to_string())
                .filter(|reference| !reference.is_empty()),
        })
    }
}

/// Sends user messages and reconciles their automated replies into the session.
#[derive(Clone)]
pub struct MessageDispatcher {
    remote: Arc<dyn RemoteStore>,
    state: SharedState,
    scheduler: ReplyScheduler,
    responder: Arc<dyn Responder>,
    settings: Arc<SessionSettings>,
}

impl MessageDispatcher {
    pub(crate) fn new(
        remote: Arc<dyn RemoteStore>,
        state: SharedState,
        scheduler: ReplyScheduler,
        responder: Arc<dyn Responder>,
        settings: Arc<SessionSettings>,
    ) -> Self {
        Self {
            remote,
            state,
            scheduler,
            responder,
            settings,
        }
    }

    /// Persists `content` as a user message in the selected chat and schedules its reply.
    ///
    /// Preconditions are checked against the session as it is when this is called.
    /// Blank content fails with `EmptyContent` without touching the remote store.
    pub fn send(
        &self,
        content: &str,
        attachment_ref: Option<String>,
    ) -> impl Future<Output = SessionResult<SendReceipt>> + Send + use<> {
        let draft = Draft::capture(&self.state.load(), content, attachment_ref);
        let this = self.clone();
        async move {
            let draft = draft?;
            let message = this.persist_user_message(&draft).await?;
            this.state.append_if_selected(draft.epoch, &message);
            tracing::debug!(
                chat_id = %draft.chat_id,
                message_id = %message.id,
                "user message committed"
            );

            this.touch_chat(&draft).await;
            let reply = this.schedule_reply(&draft, &message);
            Ok(SendReceipt { message, reply })
        }
    }

    async fn persist_user_message(&self, draft: &Draft) -> SessionResult<MessageRecord> {
        let input = NewMessage::user(
            draft.chat_id,
            draft.content.clone(),
            draft.attachment_ref.clone(),
        );
        match self.remote.create_message(input).await {
            Ok(message) => Ok(message),
            Err(source) => {
                ensure!(
                    self.state.load().epoch == draft.epoch,
                    SupersededSnafu {
                        stage: "send-persist-message",
                    }
                );
                tracing::warn!(
                    chat_id = %draft.chat_id,
                    owner_id = %draft.owner_id,
                    error = %source,
                    "failed to send message"
                );
                self.state.notify_error("Failed to send message");
                Err(source).context(RemoteUnavailableSnafu {
                    stage: "send-persist-message",
                })
            }
        }
    }

    /// Bumps the chat's recency and title. Failures are reported but never block the reply.
    async fn touch_chat(&self, draft: &Draft) {
        let patch = ChatPatch {
            title: self.next_title(draft),
        };
        match self.remote.update_chat(draft.chat_id, patch).await {
            Ok(chat) => {
                self.state.replace_chat(draft.epoch, &chat);
            }
            Err(source) => {
                tracing::warn!(chat_id = %draft.chat_id, error = %source, "failed to update chat");
                if self.state.load().epoch == draft.epoch {
                    self.state.notify_error("Failed to update chat");
                }
            }
        }
    }

    fn next_title(&self, draft: &Draft) -> Option<String> {
        let retitle = match self.settings.title_policy {
            TitlePolicy::EveryMessage => true,
            TitlePolicy::FirstMessage => self
                .state
                .load()
                .chat(draft.chat_id)
                .is_none_or(|chat| chat.title == self.settings.placeholder_title),
        };
        retitle.then(|| title_from_content(&draft.content, self.settings.title_max_chars))
    }

    fn schedule_reply(&self, draft: &Draft, trigger: &MessageRecord) -> ReplyHandle {
        let key = ReplyKey {
            chat_id: trigger.chat_id,
            message_id: trigger.id,
        };
        let remote = Arc::clone(&self.remote);
        let responder = Arc::clone(&self.responder);
        let state = self.state.clone();
        let epoch = draft.epoch;
        let prompt = draft.content.clone();

        self.scheduler.schedule(key, move |progress| async move {
            progress.set(ReplyPhase::Persisting);
            let content = responder.respond(&prompt).await;
            match remote
                .create_message(NewMessage::respondent(key.chat_id, content))
                .await
            {
                Ok(reply) => {
                    state.append_if_selected(epoch, &reply);
                    ReplyPhase::Committed(reply.id)
                }
                Err(source) => {
                    tracing::warn!(
                        chat_id = %key.chat_id,
                        message_id = %key.message_id,
                        error = %source,
                        "dropping automated reply"
                    );
                    ReplyPhase::Dropped
                }
            }
        })
    }
}

/// First `max_chars` characters of `content`.
pub fn title_from_content(content: &str, max_chars: usize) -> String {
    content.trim().chars().take(max_chars).collect()
}
