pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

use futures::future::BoxFuture;

pub use error::{StorageError, StorageResult};
pub use ids::{ChatId, MessageId, OwnerId};
pub use memory::{MemoryStorage, StoreOperation};
pub use sqlite::SqliteStorage;
pub use types::{
    Author, ChatPatch, ChatRecord, DEFAULT_CHAT_TITLE, MessageRecord, NewChat, NewMessage,
    cmp_recent_first, sort_chats_recent_first, unix_timestamp_millis,
};

/// Chat rows scoped to one owner.
pub trait ChatStore: Send + Sync {
    /// Lists the owner's chats, most recently updated first.
    fn list_chats<'a>(&'a self, owner_id: &'a OwnerId)
    -> BoxFuture<'a, StorageResult<Vec<ChatRecord>>>;
    fn create_chat(&self, input: NewChat) -> BoxFuture<'_, StorageResult<ChatRecord>>;
    /// Applies `patch` and moves `updated_at` to now.
    fn update_chat(
        &self,
        chat_id: ChatId,
        patch: ChatPatch,
    ) -> BoxFuture<'_, StorageResult<ChatRecord>>;
}

pub trait MessageStore: Send + Sync {
    /// Lists a chat's messages in ascending `created_at` order.
    fn list_messages(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>>;
    fn create_message(&self, input: NewMessage) -> BoxFuture<'_, StorageResult<MessageRecord>>;
}

pub trait RemoteStore: ChatStore + MessageStore {}

impl<T> RemoteStore for T where T: ChatStore + MessageStore {}
