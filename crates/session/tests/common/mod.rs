#![allow(dead_code)]

use std::sync::Arc;

use granny_session::{CannedResponder, Identity, SessionEvent, SessionSettings, SessionStore};
use granny_storage::{ChatRecord, ChatStore, MemoryStorage, MessageRecord, NewChat, OwnerId};
use tokio::sync::mpsc::UnboundedReceiver;

pub const CANNED_REPLY: &str = "noted, thank you";

pub struct Harness {
    pub remote: Arc<MemoryStorage>,
    pub store: SessionStore,
    pub events: UnboundedReceiver<SessionEvent>,
}

pub fn harness() -> Harness {
    harness_with(SessionSettings::default())
}

pub fn harness_with(settings: SessionSettings) -> Harness {
    let remote = Arc::new(MemoryStorage::new());
    let (store, events) = SessionStore::new(remote.clone(), settings);
    let store = store.with_responder(Arc::new(CannedResponder::new([CANNED_REPLY])));
    Harness {
        remote,
        store,
        events,
    }
}

impl Harness {
    pub async fn sign_in(&self, user_id: &str) -> Identity {
        let identity = Identity::new(user_id);
        self.store
            .react_to_identity_change(Some(identity.clone()))
            .await
            .expect("sign in should load chats");
        identity
    }

    /// Creates a chat straight in the remote store, bypassing the session.
    pub async fn seed_chat(&self, owner: &str, title: &str) -> ChatRecord {
        self.remote
            .create_chat(NewChat::new(OwnerId::new(owner), title))
            .await
            .expect("seed chat")
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    /// Descriptions of the error notices emitted since the last drain.
    pub fn error_notices(&mut self) -> Vec<String> {
        self.drain_events()
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::Notice(notice) if notice.is_error() => Some(notice.description),
                _ => None,
            })
            .collect()
    }
}

pub fn contents(messages: &[MessageRecord]) -> Vec<&str> {
    messages
        .iter()
        .map(|message| message.content.as_str())
        .collect()
}

pub fn assert_chronological(messages: &[MessageRecord]) {
    assert!(
        messages
            .windows(2)
            .all(|pair| pair[0].created_at_unix_millis <= pair[1].created_at_unix_millis),
        "messages out of order: {messages:?}"
    );
}
