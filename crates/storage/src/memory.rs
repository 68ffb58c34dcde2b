use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use snafu::{OptionExt, ensure};

use super::error::{NotFoundSnafu, StorageResult, UnavailableSnafu};
use super::ids::{ChatId, MessageId, OwnerId};
use super::types::{
    ChatPatch, ChatRecord, MessageRecord, NewChat, NewMessage, sort_chats_recent_first,
    unix_timestamp_millis,
};
use super::{ChatStore, MessageStore};

/// One remote call kind, used to script latency and faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    ListChats,
    CreateChat,
    UpdateChat,
    ListMessages,
    CreateMessage,
}

impl StoreOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ListChats => "memory-list-chats",
            Self::CreateChat => "memory-create-chat",
            Self::UpdateChat => "memory-update-chat",
            Self::ListMessages => "memory-list-messages",
            Self::CreateMessage => "memory-create-message",
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    chats: Vec<ChatRecord>,
    messages: Vec<MessageRecord>,
    last_stamp_unix_millis: u64,
    scripted_delays: HashMap<StoreOperation, VecDeque<Duration>>,
    scripted_failures: HashMap<StoreOperation, usize>,
    calls: HashMap<StoreOperation, usize>,
}

impl MemoryState {
    // Server clock: never repeats and never runs backwards.
    fn next_stamp(&mut self) -> u64 {
        let stamp = unix_timestamp_millis().max(self.last_stamp_unix_millis + 1);
        self.last_stamp_unix_millis = stamp;
        stamp
    }
}

#[derive(Debug, Clone, Copy)]
struct CallPlan {
    delay: Duration,
    fail: bool,
}

/// In-process stand-in for the remote store.
///
/// Every call waits on the tokio clock before touching data, so a paused test
/// runtime can reorder completions deterministically through [`Self::delay_next`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
    latency: Duration,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            state: Arc::default(),
            latency,
        }
    }

    /// Overrides the latency of the next `operation` call. Queued overrides apply in order.
    pub fn delay_next(&self, operation: StoreOperation, delay: Duration) {
        self.lock()
            .scripted_delays
            .entry(operation)
            .or_default()
            .push_back(delay);
    }

    /// Makes the next `operation` call fail with [`crate::StorageError::Unavailable`].
    pub fn fail_next(&self, operation: StoreOperation) {
        *self.lock().scripted_failures.entry(operation).or_default() += 1;
    }

    pub fn call_count(&self, operation: StoreOperation) -> usize {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.values().sum()
    }

    pub fn stored_chats(&self) -> Vec<ChatRecord> {
        self.lock().chats.clone()
    }

    pub fn stored_messages(&self, chat_id: ChatId) -> Vec<MessageRecord> {
        self.lock()
            .messages
            .iter()
            .filter(|message| message.chat_id == chat_id)
            .cloned()
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn plan(&self, operation: StoreOperation) -> CallPlan {
        let mut state = self.lock();
        *state.calls.entry(operation).or_default() += 1;

        let delay = state
            .scripted_delays
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
            .unwrap_or(self.latency);

        let fail = match state.scripted_failures.get_mut(&operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };

        CallPlan { delay, fail }
    }

    async fn settle(&self, operation: StoreOperation) -> StorageResult<()> {
        let plan = self.plan(operation);
        if !plan.delay.is_zero() {
            tokio::time::sleep(plan.delay).await;
        }

        ensure!(
            !plan.fail,
            UnavailableSnafu {
                stage: operation.as_str(),
                details: "scripted failure".to_string(),
            }
        );
        Ok(())
    }
}

impl ChatStore for MemoryStorage {
    fn list_chats<'a>(
        &'a self,
        owner_id: &'a OwnerId,
    ) -> BoxFuture<'a, StorageResult<Vec<ChatRecord>>> {
        async move {
            self.settle(StoreOperation::ListChats).await?;
            let mut chats = self
                .lock()
                .chats
                .iter()
                .filter(|chat| &chat.owner_id == owner_id)
                .cloned()
                .collect::<Vec<_>>();
            sort_chats_recent_first(&mut chats);
            Ok(chats)
        }
        .boxed()
    }

    fn create_chat(&self, input: NewChat) -> BoxFuture<'_, StorageResult<ChatRecord>> {
        async move {
            self.settle(StoreOperation::CreateChat).await?;
            let mut state = self.lock();
            let now = state.next_stamp();
            let chat = ChatRecord {
                id: ChatId::new_v7(),
                owner_id: input.owner_id,
                title: input.title,
                created_at_unix_millis: now,
                updated_at_unix_millis: now,
            };
            state.chats.push(chat.clone());
            Ok(chat)
        }
        .boxed()
    }

    fn update_chat(
        &self,
        chat_id: ChatId,
        patch: ChatPatch,
    ) -> BoxFuture<'_, StorageResult<ChatRecord>> {
        async move {
            self.settle(StoreOperation::UpdateChat).await?;
            let mut state = self.lock();
            let now = state.next_stamp();
            let chat = state
                .chats
                .iter_mut()
                .find(|chat| chat.id == chat_id)
                .context(NotFoundSnafu {
                    stage: "memory-update-chat-missing",
                    entity: "chat",
                    id: chat_id.to_string(),
                })?;

            if let Some(title) = patch.title {
                chat.title = title;
            }
            chat.updated_at_unix_millis = now.max(chat.updated_at_unix_millis + 1);
            Ok(chat.clone())
        }
        .boxed()
    }
}

impl MessageStore for MemoryStorage {
    fn list_messages(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        async move {
            self.settle(StoreOperation::ListMessages).await?;
            let mut messages = self.stored_messages(chat_id);
            messages.sort_by_key(|message| message.created_at_unix_millis);
            Ok(messages)
        }
        .boxed()
    }

    fn create_message(&self, input: NewMessage) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        async move {
            self.settle(StoreOperation::CreateMessage).await?;
            let mut state = self.lock();
            ensure!(
                state.chats.iter().any(|chat| chat.id == input.chat_id),
                NotFoundSnafu {
                    stage: "memory-create-message-chat-missing",
                    entity: "chat",
                    id: input.chat_id.to_string(),
                }
            );

            let message = MessageRecord {
                id: MessageId::new_v7(),
                chat_id: input.chat_id,
                content: input.content,
                author: input.author,
                attachment_ref: input.attachment_ref,
                created_at_unix_millis: state.next_stamp(),
            };
            state.messages.push(message.clone());
            Ok(message)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageError;
    use crate::types::Author;

    fn owner() -> OwnerId {
        OwnerId::new("user-1")
    }

    #[tokio::test]
    async fn lists_only_the_owners_chats_newest_first() {
        let storage = MemoryStorage::new();
        let first = storage
            .create_chat(NewChat::new(owner(), "first"))
            .await
            .expect("create first");
        let _foreign = storage
            .create_chat(NewChat::new(OwnerId::new("someone-else"), "foreign"))
            .await
            .expect("create foreign");
        let second = storage
            .create_chat(NewChat::new(owner(), "second"))
            .await
            .expect("create second");

        let listed = storage.list_chats(&owner()).await.expect("list chats");
        assert_eq!(listed, vec![second, first]);
    }

    #[tokio::test]
    async fn update_moves_the_chat_to_the_front() {
        let storage = MemoryStorage::new();
        let older = storage
            .create_chat(NewChat::new(owner(), "older"))
            .await
            .expect("create older");
        let _newer = storage
            .create_chat(NewChat::new(owner(), "newer"))
            .await
            .expect("create newer");

        let updated = storage
            .update_chat(
                older.id,
                ChatPatch {
                    title: Some("renamed".to_string()),
                },
            )
            .await
            .expect("update older");
        assert_eq!(updated.title, "renamed");
        assert!(updated.updated_at_unix_millis > older.updated_at_unix_millis);

        let listed = storage.list_chats(&owner()).await.expect("list chats");
        assert_eq!(listed.first().map(|chat| chat.id), Some(older.id));
    }

    #[tokio::test]
    async fn message_stamps_strictly_increase_within_a_chat() {
        let storage = MemoryStorage::new();
        let chat = storage
            .create_chat(NewChat::new(owner(), "chat"))
            .await
            .expect("create chat");

        for index in 0..5 {
            storage
                .create_message(NewMessage::user(chat.id, format!("m{index}"), None))
                .await
                .expect("create message");
        }

        let messages = storage.list_messages(chat.id).await.expect("list messages");
        assert_eq!(messages.len(), 5);
        assert!(
            messages
                .windows(2)
                .all(|pair| pair[0].created_at_unix_millis < pair[1].created_at_unix_millis)
        );
        assert!(messages.iter().all(|message| message.author == Author::User));
    }

    #[tokio::test]
    async fn scripted_failure_hits_exactly_one_call() {
        let storage = MemoryStorage::new();
        storage.fail_next(StoreOperation::ListChats);

        let error = storage
            .list_chats(&owner())
            .await
            .expect_err("first call is scripted to fail");
        assert!(matches!(error, StorageError::Unavailable { .. }));
        assert!(storage.list_chats(&owner()).await.is_ok());
        assert_eq!(storage.call_count(StoreOperation::ListChats), 2);
    }

    #[tokio::test]
    async fn message_for_unknown_chat_is_not_found() {
        let storage = MemoryStorage::new();
        let error = storage
            .create_message(NewMessage::user(ChatId::new_v7(), "orphan", None))
            .await
            .expect_err("chat does not exist");
        assert!(matches!(error, StorageError::NotFound { entity: "chat", .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn scripted_delays_reorder_completions() {
        let storage = MemoryStorage::new();
        let chat = storage
            .create_chat(NewChat::new(owner(), "chat"))
            .await
            .expect("create chat");

        storage.delay_next(StoreOperation::CreateMessage, Duration::from_millis(300));
        storage.delay_next(StoreOperation::CreateMessage, Duration::from_millis(10));

        let slow = storage.create_message(NewMessage::user(chat.id, "slow", None));
        let fast = storage.create_message(NewMessage::user(chat.id, "fast", None));
        let (slow, fast) = futures::join!(slow, fast);
        let (slow, fast) = (slow.expect("slow"), fast.expect("fast"));

        assert!(fast.created_at_unix_millis < slow.created_at_unix_millis);
    }
}
