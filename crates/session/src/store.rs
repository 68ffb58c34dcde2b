use std::future::Future;
use std::sync::Arc;

use granny_storage::{ChatId, ChatRecord, MessageRecord, NewChat, RemoteStore};
use snafu::{OptionExt, ResultExt, ensure};
use tokio::sync::mpsc;

use crate::dispatcher::{MessageDispatcher, SendReceipt};
use crate::error::{
    RemoteUnavailableSnafu, SessionResult, SupersededSnafu, UnauthenticatedSnafu,
    UnknownChatSnafu,
};
use crate::events::SessionEvent;
use crate::identity::Identity;
use crate::responder::{CannedResponder, Responder};
use crate::scheduler::ReplyScheduler;
use crate::settings::SessionSettings;
use crate::state::{
    IdentityTicket, SelectionTicket, SessionSnapshot, SharedState, merge_loaded_messages,
    reconcile_chat_list,
};

/// Working copy of the signed-in user's chats and the selected chat's messages.
///
/// Every operation runs its synchronous part when it is called and returns a
/// `'static` future for the remote round-trip. Completions whose identity or
/// selection has moved on are discarded and resolve to `Superseded`.
#[derive(Clone)]
pub struct SessionStore {
    remote: Arc<dyn RemoteStore>,
    state: SharedState,
    scheduler: ReplyScheduler,
    responder: Arc<dyn Responder>,
    settings: Arc<SessionSettings>,
}

impl SessionStore {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        settings: SessionSettings,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let settings = settings.normalized();
        let (state, events) = SharedState::new();
        let store = Self {
            remote,
            state,
            scheduler: ReplyScheduler::new(settings.reply_delay()),
            responder: Arc::new(CannedResponder::default()),
            settings: Arc::new(settings),
        };
        (store, events)
    }

    pub fn with_responder(mut self, responder: Arc<dyn Responder>) -> Self {
        self.responder = responder;
        self
    }

    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.state.load()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.state.load().identity.clone()
    }

    pub fn chats(&self) -> Vec<ChatRecord> {
        self.state.load().chats.clone()
    }

    pub fn selected_chat(&self) -> Option<ChatRecord> {
        self.state.load().selected_chat.clone()
    }

    pub fn messages(&self) -> Vec<MessageRecord> {
        self.state.load().messages.clone()
    }

    pub fn is_loading_messages(&self) -> bool {
        self.state.load().is_loading_messages
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn scheduler(&self) -> &ReplyScheduler {
        &self.scheduler
    }

    /// Chats whose title contains `query`, ignoring case, in list order.
    pub fn search_chats(&self, query: &str) -> Vec<ChatRecord> {
        let needle = query.trim().to_lowercase();
        self.state
            .load()
            .chats
            .iter()
            .filter(|chat| needle.is_empty() || chat.title.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    pub fn dispatcher(&self) -> MessageDispatcher {
        MessageDispatcher::new(
            Arc::clone(&self.remote),
            self.state.clone(),
            self.scheduler.clone(),
            Arc::clone(&self.responder),
            Arc::clone(&self.settings),
        )
    }

    /// Applies a sign-in, sign-out or refresh pushed by the identity provider.
    ///
    /// A different identity discards all session state before anything is reloaded.
    /// Signing out clears the state immediately; the returned future has nothing left to do.
    pub fn react_to_identity_change(
        &self,
        identity: Option<Identity>,
    ) -> impl Future<Output = SessionResult<()>> + Send + use<> {
        let mut changed = false;
        self.state.update(|current| {
            changed = current.identity != identity;
            if !changed {
                return None;
            }
            Some(SessionSnapshot {
                identity: identity.clone(),
                epoch: current.epoch + 1,
                selection: current.selection + 1,
                ..SessionSnapshot::default()
            })
        });

        if changed {
            match &identity {
                Some(identity) => {
                    tracing::info!(owner_id = %identity.user_id, "identity signed in")
                }
                None => tracing::info!("identity signed out"),
            }
            self.state.emit(SessionEvent::IdentityChanged(identity.clone()));
        }

        let reload = identity.is_some().then(|| self.load_chats());
        async move {
            if let Some(reload) = reload {
                reload.await?;
            }
            Ok(())
        }
    }

    /// Replaces the chat list with the remote copy for the current identity.
    ///
    /// On failure the previous list stays and an error notice is emitted.
    pub fn load_chats(&self) -> impl Future<Output = SessionResult<Vec<ChatRecord>>> + Send + use<> {
        let ticket = IdentityTicket::capture(&self.state.load());
        let this = self.clone();
        async move {
            let ticket = ticket.context(UnauthenticatedSnafu {
                stage: "load-chats",
            })?;

            let fetched = match this.remote.list_chats(&ticket.owner_id).await {
                Ok(fetched) => fetched,
                Err(source) => {
                    ensure!(
                        ticket.is_current(&this.state.load()),
                        SupersededSnafu {
                            stage: "load-chats-fetch",
                        }
                    );
                    tracing::warn!(
                        owner_id = %ticket.owner_id,
                        error = %source,
                        "failed to load chats"
                    );
                    this.state.notify_error("Failed to load chats");
                    return Err(source).context(RemoteUnavailableSnafu {
                        stage: "load-chats-fetch",
                    });
                }
            };

            let mut applied = None;
            this.state.update(|current| {
                applied = None;
                if !ticket.is_current(current) {
                    return None;
                }
                let chats = reconcile_chat_list(&fetched, current);
                let selected_chat = current
                    .selected_chat_id()
                    .and_then(|chat_id| chats.iter().find(|chat| chat.id == chat_id))
                    .cloned();
                applied = Some(chats.clone());
                Some(SessionSnapshot {
                    chats,
                    selected_chat,
                    ..current.clone()
                })
            });

            let chats = applied.context(SupersededSnafu {
                stage: "load-chats-apply",
            })?;
            tracing::debug!(owner_id = %ticket.owner_id, count = chats.len(), "chats loaded");
            this.state.emit(SessionEvent::ChatsReplaced);
            Ok(chats)
        }
    }

    /// Creates a chat with the placeholder title, puts it first and selects it.
    pub fn create_chat(&self) -> impl Future<Output = SessionResult<ChatRecord>> + Send + use<> {
        let ticket = IdentityTicket::capture(&self.state.load());
        let this = self.clone();
        async move {
            let ticket = ticket.context(UnauthenticatedSnafu {
                stage: "create-chat",
            })?;

            let input = NewChat::new(
                ticket.owner_id.clone(),
                this.settings.placeholder_title.clone(),
            );
            let chat = match this.remote.create_chat(input).await {
                Ok(chat) => chat,
                Err(source) => {
                    ensure!(
                        ticket.is_current(&this.state.load()),
                        SupersededSnafu {
                            stage: "create-chat-persist",
                        }
                    );
                    tracing::warn!(
                        owner_id = %ticket.owner_id,
                        error = %source,
                        "failed to create chat"
                    );
                    this.state.notify_error("Failed to create new chat");
                    return Err(source).context(RemoteUnavailableSnafu {
                        stage: "create-chat-persist",
                    });
                }
            };

            let applied = this.state.update(|current| {
                if !ticket.is_current(current) {
                    return None;
                }
                let mut chats = current.chats.clone();
                chats.retain(|listed| listed.id != chat.id);
                chats.insert(0, chat.clone());
                Some(SessionSnapshot {
                    chats,
                    selected_chat: Some(chat.clone()),
                    messages: Vec::new(),
                    is_loading_messages: false,
                    selection: current.selection + 1,
                    ..current.clone()
                })
            });
            ensure!(
                applied,
                SupersededSnafu {
                    stage: "create-chat-apply",
                }
            );

            tracing::info!(owner_id = %ticket.owner_id, chat_id = %chat.id, "chat created");
            this.state.emit(SessionEvent::ChatsReplaced);
            this.state.emit(SessionEvent::ChatSelected(chat.id));
            Ok(chat)
        }
    }

    /// Selects `chat` right away and loads its messages.
    ///
    /// The message list is emptied and `is_loading_messages` raised before this returns.
    /// A load that finishes after another selection is discarded.
    pub fn select_chat(
        &self,
        chat: &ChatRecord,
    ) -> impl Future<Output = SessionResult<Vec<MessageRecord>>> + Send + use<> {
        self.select_chat_by_id(chat.id)
    }

    /// Same as [`Self::select_chat`] for a chat id taken from the current list.
    pub fn select_chat_by_id(
        &self,
        chat_id: ChatId,
    ) -> impl Future<Output = SessionResult<Vec<MessageRecord>>> + Send + use<> {
        let mut ticket = None;
        self.state.update(|current| {
            ticket = None;
            let listed = current.chat(chat_id)?;
            let next = SessionSnapshot {
                selected_chat: Some(listed.clone()),
                messages: Vec::new(),
                is_loading_messages: true,
                selection: current.selection + 1,
                ..current.clone()
            };
            ticket = Some(SelectionTicket::capture(&next, chat_id));
            Some(next)
        });

        if ticket.is_some() {
            tracing::debug!(chat_id = %chat_id, "chat selected");
            self.state.emit(SessionEvent::ChatSelected(chat_id));
        }

        let this = self.clone();
        async move {
            let ticket = ticket.context(UnknownChatSnafu {
                stage: "select-chat",
                chat_id,
            })?;
            this.load_selected_messages(ticket).await
        }
    }

    async fn load_selected_messages(
        &self,
        ticket: SelectionTicket,
    ) -> SessionResult<Vec<MessageRecord>> {
        let chat_id = ticket.chat_id;
        match self.remote.list_messages(chat_id).await {
            Ok(loaded) => {
                let mut applied = None;
                self.state.update(|current| {
                    applied = None;
                    if !ticket.is_current(current) {
                        return None;
                    }
                    let messages = merge_loaded_messages(loaded.clone(), &current.messages);
                    applied = Some(messages.clone());
                    Some(SessionSnapshot {
                        messages,
                        is_loading_messages: false,
                        ..current.clone()
                    })
                });

                let messages = applied.context(SupersededSnafu {
                    stage: "select-chat-apply",
                })?;
                tracing::debug!(chat_id = %chat_id, count = messages.len(), "messages loaded");
                self.state.emit(SessionEvent::MessagesReplaced(chat_id));
                Ok(messages)
            }
            Err(source) => {
                let settled = self.state.update(|current| {
                    ticket.is_current(current).then(|| SessionSnapshot {
                        is_loading_messages: false,
                        ..current.clone()
                    })
                });
                ensure!(
                    settled,
                    SupersededSnafu {
                        stage: "select-chat-fetch",
                    }
                );
                tracing::warn!(chat_id = %chat_id, error = %source, "failed to load messages");
                self.state.notify_error("Failed to load messages");
                Err(source).context(RemoteUnavailableSnafu {
                    stage: "select-chat-fetch",
                })
            }
        }
    }

    /// Sends into the selected chat. See [`MessageDispatcher::send`].
    pub fn send(
        &self,
        content: &str,
        attachment_ref: Option<String>,
    ) -> impl Future<Output = SessionResult<SendReceipt>> + Send + use<> {
        self.dispatcher().send(content, attachment_ref)
    }

    /// Sends `content`, first creating a chat when none is selected.
    pub fn submit(
        &self,
        content: &str,
        attachment_ref: Option<String>,
    ) -> impl Future<Output = SessionResult<SendReceipt>> + Send + use<> {
        let needs_chat =
            self.state.load().selected_chat.is_none() && !content.trim().is_empty();
        let create = needs_chat.then(|| self.create_chat());
        let send_now = (!needs_chat).then(|| self.send(content, attachment_ref.clone()));
        let content = content.to_string();
        let this = self.clone();
        async move {
            if let Some(send) = send_now {
                return send.await;
            }
            if let Some(create) = create {
                create.await?;
            }
            this.send(&content, attachment_ref).await
        }
    }
}
