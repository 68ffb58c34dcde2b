use std::sync::Arc;

use arc_swap::ArcSwap;
use granny_storage::{ChatId, ChatRecord, MessageRecord, OwnerId, sort_chats_recent_first};
use tokio::sync::mpsc;

use crate::events::{Notification, SessionEvent};
use crate::identity::Identity;

/// Everything a reader of the session sees, replaced as one value on every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub identity: Option<Identity>,
    /// Most recently updated first.
    pub chats: Vec<ChatRecord>,
    /// Always one of `chats` when present.
    pub selected_chat: Option<ChatRecord>,
    /// Messages of the selected chat, non-decreasing by `created_at`.
    pub messages: Vec<MessageRecord>,
    pub is_loading_messages: bool,
    pub(crate) epoch: u64,
    pub(crate) selection: u64,
}

impl SessionSnapshot {
    pub fn selected_chat_id(&self) -> Option<ChatId> {
        self.selected_chat.as_ref().map(|chat| chat.id)
    }

    pub fn chat(&self, chat_id: ChatId) -> Option<&ChatRecord> {
        self.chats.iter().find(|chat| chat.id == chat_id)
    }

    pub fn owner_id(&self) -> Option<&OwnerId> {
        self.identity.as_ref().map(|identity| &identity.user_id)
    }
}

/// Identity a remote call was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IdentityTicket {
    pub owner_id: OwnerId,
    pub epoch: u64,
}

impl IdentityTicket {
    pub fn capture(snapshot: &SessionSnapshot) -> Option<Self> {
        snapshot.owner_id().map(|owner_id| Self {
            owner_id: owner_id.clone(),
            epoch: snapshot.epoch,
        })
    }

    pub fn is_current(&self, snapshot: &SessionSnapshot) -> bool {
        snapshot.epoch == self.epoch
    }
}

/// Chat selection a message load was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SelectionTicket {
    pub chat_id: ChatId,
    pub epoch: u64,
    pub selection: u64,
}

impl SelectionTicket {
    pub fn capture(snapshot: &SessionSnapshot, chat_id: ChatId) -> Self {
        Self {
            chat_id,
            epoch: snapshot.epoch,
            selection: snapshot.selection,
        }
    }

    pub fn is_current(&self, snapshot: &SessionSnapshot) -> bool {
        snapshot.epoch == self.epoch
            && snapshot.selection == self.selection
            && snapshot.selected_chat_id() == Some(self.chat_id)
    }
}

/// Snapshot cell plus the event channel, shared by the store, the dispatcher and reply tasks.
#[derive(Debug, Clone)]
pub(crate) struct SharedState {
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SharedState {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let state = Self {
            snapshot: Arc::new(ArcSwap::from_pointee(SessionSnapshot::default())),
            events,
        };
        (state, receiver)
    }

    pub fn load(&self) -> Arc<SessionSnapshot> {
        self.snapshot.load_full()
    }

    /// Replaces the snapshot with whatever `apply` derives from the current one.
    ///
    /// `apply` returns `None` to leave the snapshot alone and may run more than once
    /// when writers race, so it must not keep side effects from an earlier attempt.
    pub fn update<F>(&self, mut apply: F) -> bool
    where
        F: FnMut(&SessionSnapshot) -> Option<SessionSnapshot>,
    {
        let mut changed = false;
        self.snapshot.rcu(|current| match apply(current.as_ref()) {
            Some(next) => {
                changed = true;
                Arc::new(next)
            }
            None => {
                changed = false;
                Arc::clone(current)
            }
        });
        changed
    }

    pub fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine; the snapshot stays authoritative.
        let _ = self.events.send(event);
    }

    pub fn notify_error(&self, description: &str) {
        self.emit(SessionEvent::Notice(Notification::error(description)));
    }

    /// Inserts `message` into the visible list while its chat is still selected under `epoch`.
    pub fn append_if_selected(&self, epoch: u64, message: &MessageRecord) -> bool {
        let appended = self.update(|current| {
            if current.epoch != epoch || current.selected_chat_id() != Some(message.chat_id) {
                return None;
            }

            let mut next = current.clone();
            insert_message_ordered(&mut next.messages, message.clone()).then_some(next)
        });

        if appended {
            self.emit(SessionEvent::MessageAppended(message.clone()));
        }
        appended
    }

    /// Swaps in a fresher copy of a listed chat and restores recency order.
    pub fn replace_chat(&self, epoch: u64, chat: &ChatRecord) -> bool {
        let replaced = self.update(|current| {
            if current.epoch != epoch {
                return None;
            }
            let position = current.chats.iter().position(|listed| listed.id == chat.id)?;
            // Late acknowledgments must not roll a chat back.
            if current.chats[position].updated_at_unix_millis > chat.updated_at_unix_millis {
                return None;
            }

            let mut next = current.clone();
            next.chats[position] = chat.clone();
            sort_chats_recent_first(&mut next.chats);
            if next.selected_chat_id() == Some(chat.id) {
                next.selected_chat = Some(chat.clone());
            }
            Some(next)
        });

        if replaced {
            self.emit(SessionEvent::ChatsReplaced);
        }
        replaced
    }
}

/// Inserts after every message with an equal or earlier stamp. Known ids are skipped.
pub(crate) fn insert_message_ordered(
    messages: &mut Vec<MessageRecord>,
    message: MessageRecord,
) -> bool {
    if messages.iter().any(|existing| existing.id == message.id) {
        return false;
    }

    let index = messages
        .partition_point(|existing| existing.created_at_unix_millis <= message.created_at_unix_millis);
    messages.insert(index, message);
    true
}

/// Folds messages appended while a load was in flight into the loaded list.
pub(crate) fn merge_loaded_messages(
    mut loaded: Vec<MessageRecord>,
    local: &[MessageRecord],
) -> Vec<MessageRecord> {
    loaded.sort_by_key(|message| message.created_at_unix_millis);
    for message in local {
        insert_message_ordered(&mut loaded, message.clone());
    }
    loaded
}

/// Fetched chats, keeping newer local copies and the selected chat even if the fetch missed it.
pub(crate) fn reconcile_chat_list(
    fetched: &[ChatRecord],
    current: &SessionSnapshot,
) -> Vec<ChatRecord> {
    let mut chats = fetched
        .iter()
        .map(|chat| {
            current
                .chat(chat.id)
                .filter(|local| local.updated_at_unix_millis > chat.updated_at_unix_millis)
                .unwrap_or(chat)
                .clone()
        })
        .collect::<Vec<_>>();

    if let Some(selected) = &current.selected_chat
        && !chats.iter().any(|chat| chat.id == selected.id)
    {
        chats.push(selected.clone());
    }

    sort_chats_recent_first(&mut chats);
    chats
}
