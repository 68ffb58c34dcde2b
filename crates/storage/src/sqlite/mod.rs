use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use snafu::{OptionExt, ResultExt, ensure};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu, StorageResult,
};
use super::ids::{ChatId, MessageId, OwnerId};
use super::types::{
    Author, ChatPatch, ChatRecord, MessageRecord, NewChat, NewMessage, unix_timestamp_millis,
};
use super::{ChatStore, MessageStore};

const CHAT_COLUMNS: &str = "id, owner_id, title, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, chat_id, content, author, attachment_ref, created_at";

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // One long-lived connection: `:memory:` databases vanish with their connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "opened sqlite chat store");
        Ok(Self { pool, database_url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    async fn chat_exists(&self, chat_id: ChatId, stage: &'static str) -> StorageResult<bool> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM chats WHERE id = ?")
            .bind(chat_id.to_string())
            .fetch_one(&self.pool)
            .await
            .context(SqliteQuerySnafu { stage })?;
        Ok(count > 0)
    }
}

impl ChatStore for SqliteStorage {
    fn list_chats<'a>(
        &'a self,
        owner_id: &'a OwnerId,
    ) -> BoxFuture<'a, StorageResult<Vec<ChatRecord>>> {
        async move {
            let rows = sqlx::query_as::<_, ChatRow>(&format!(
                "SELECT {CHAT_COLUMNS} FROM chats WHERE owner_id = ? ORDER BY updated_at DESC, id DESC"
            ))
            .bind(owner_id.as_str())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-list-query",
            })?;

            rows.into_iter().map(chat_row_to_record).collect()
        }
        .boxed()
    }

    fn create_chat(&self, input: NewChat) -> BoxFuture<'_, StorageResult<ChatRecord>> {
        async move {
            let chat_id = ChatId::new_v7();
            let now = u64_to_i64(unix_timestamp_millis(), "chat-create-now")?;

            let row = sqlx::query_as::<_, ChatRow>(&format!(
                "INSERT INTO chats (id, owner_id, title, created_at, updated_at) VALUES (?, ?, ?, ?, ?) RETURNING {CHAT_COLUMNS}"
            ))
            .bind(chat_id.to_string())
            .bind(input.owner_id.as_str())
            .bind(input.title)
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-create-insert",
            })?;

            chat_row_to_record(row)
        }
        .boxed()
    }

    fn update_chat(
        &self,
        chat_id: ChatId,
        patch: ChatPatch,
    ) -> BoxFuture<'_, StorageResult<ChatRecord>> {
        async move {
            let now = u64_to_i64(unix_timestamp_millis(), "chat-update-now")?;

            // updated_at only moves forward, even if the wall clock steps back.
            let row = sqlx::query_as::<_, ChatRow>(&format!(
                "UPDATE chats SET title = COALESCE(?, title), updated_at = MAX(?, updated_at + 1) WHERE id = ? RETURNING {CHAT_COLUMNS}"
            ))
            .bind(patch.title)
            .bind(now)
            .bind(chat_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-update-apply",
            })?
            .context(NotFoundSnafu {
                stage: "chat-update-missing",
                entity: "chat",
                id: chat_id.to_string(),
            })?;

            chat_row_to_record(row)
        }
        .boxed()
    }
}

impl MessageStore for SqliteStorage {
    fn list_messages(&self, chat_id: ChatId) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        async move {
            let rows = sqlx::query_as::<_, MessageRow>(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = ? ORDER BY created_at ASC, rowid ASC"
            ))
            .bind(chat_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        }
        .boxed()
    }

    fn create_message(&self, input: NewMessage) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        async move {
            ensure!(
                self.chat_exists(input.chat_id, "message-create-ensure-chat")
                    .await?,
                NotFoundSnafu {
                    stage: "message-create-chat-missing",
                    entity: "chat",
                    id: input.chat_id.to_string(),
                }
            );

            let message_id = MessageId::new_v7();
            let now = u64_to_i64(unix_timestamp_millis(), "message-create-now")?;

            // Stamps are strictly increasing per chat so display order is total.
            let row = sqlx::query_as::<_, MessageRow>(&format!(
                "INSERT INTO messages (id, chat_id, content, author, attachment_ref, created_at) \
                 VALUES (?, ?, ?, ?, ?, MAX(?, COALESCE((SELECT MAX(created_at) FROM messages WHERE chat_id = ?), 0) + 1)) \
                 RETURNING {MESSAGE_COLUMNS}"
            ))
            .bind(message_id.to_string())
            .bind(input.chat_id.to_string())
            .bind(input.content)
            .bind(input.author.as_str())
            .bind(input.attachment_ref)
            .bind(now)
            .bind(input.chat_id.to_string())
            .fetch_one(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-create-insert",
            })?;

            message_row_to_record(row)
        }
        .boxed()
    }
}

#[derive(Debug, FromRow)]
struct ChatRow {
    id: String,
    owner_id: String,
    title: String,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    chat_id: String,
    content: String,
    author: String,
    attachment_ref: Option<String>,
    created_at: i64,
}

fn chat_row_to_record(row: ChatRow) -> StorageResult<ChatRecord> {
    Ok(ChatRecord {
        id: ChatId::parse(&row.id)?,
        owner_id: OwnerId::new(row.owner_id),
        title: row.title,
        created_at_unix_millis: i64_to_u64(row.created_at, "chat-row-created-at")?,
        updated_at_unix_millis: i64_to_u64(row.updated_at, "chat-row-updated-at")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        chat_id: ChatId::parse(&row.chat_id)?,
        content: row.content,
        author: author_from_sql(&row.author)?,
        attachment_ref: row.attachment_ref,
        created_at_unix_millis: i64_to_u64(row.created_at, "message-row-created-at")?,
    })
}

fn author_from_sql(raw: &str) -> StorageResult<Author> {
    match raw {
        "user" => Ok(Author::User),
        "respondent" => Ok(Author::Respondent),
        other => InvariantViolationSnafu {
            stage: "message-row-author",
            details: format!("unknown message author '{other}'"),
        }
        .fail(),
    }
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    u64::try_from(value).ok().context(InvariantViolationSnafu {
        stage,
        details: format!("negative sqlite integer '{value}' cannot map to u64"),
    })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    i64::try_from(value).ok().context(InvariantViolationSnafu {
        stage,
        details: format!("u64 '{value}' cannot map to sqlite i64"),
    })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageError;

    async fn open_temp() -> (tempfile::TempDir, SqliteStorage) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("nested").join("granny.db");
        let storage = SqliteStorage::open(&path.display().to_string())
            .await
            .expect("open sqlite store");
        (dir, storage)
    }

    #[test]
    fn database_locations_normalize_to_sqlite_urls() {
        assert_eq!(normalize_database_url(":memory:"), "sqlite::memory:");
        assert_eq!(
            normalize_database_url("sqlite://already.db"),
            "sqlite://already.db"
        );
        assert_eq!(normalize_database_url("data/chat.db"), "sqlite://data/chat.db");
    }

    #[tokio::test]
    async fn chats_round_trip_and_order_by_recency() {
        let (_dir, storage) = open_temp().await;
        let owner = OwnerId::new("owner-a");

        let first = storage
            .create_chat(NewChat::new(owner.clone(), "first"))
            .await
            .expect("create first");
        let second = storage
            .create_chat(NewChat::new(owner.clone(), "second"))
            .await
            .expect("create second");
        storage
            .create_chat(NewChat::new(OwnerId::new("owner-b"), "foreign"))
            .await
            .expect("create foreign");

        let touched = storage
            .update_chat(
                first.id,
                ChatPatch {
                    title: Some("first, renamed".to_string()),
                },
            )
            .await
            .expect("update first");
        assert_eq!(touched.title, "first, renamed");
        assert!(touched.updated_at_unix_millis > first.updated_at_unix_millis);

        let listed = storage.list_chats(&owner).await.expect("list chats");
        let ids = listed.iter().map(|chat| chat.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn title_is_kept_when_patch_has_none() {
        let (_dir, storage) = open_temp().await;
        let chat = storage
            .create_chat(NewChat::new(OwnerId::new("owner"), "keep me"))
            .await
            .expect("create chat");

        let touched = storage
            .update_chat(chat.id, ChatPatch::default())
            .await
            .expect("touch chat");
        assert_eq!(touched.title, "keep me");
    }

    #[tokio::test]
    async fn messages_come_back_in_creation_order_with_attachments() {
        let (_dir, storage) = open_temp().await;
        let chat = storage
            .create_chat(NewChat::new(OwnerId::new("owner"), "chat"))
            .await
            .expect("create chat");

        let question = storage
            .create_message(NewMessage::user(
                chat.id,
                "what is this rash?",
                Some("https://files.example/rash.jpg".to_string()),
            ))
            .await
            .expect("create question");
        let answer = storage
            .create_message(NewMessage::respondent(chat.id, "let's take a look"))
            .await
            .expect("create answer");
        assert!(answer.created_at_unix_millis > question.created_at_unix_millis);

        let listed = storage.list_messages(chat.id).await.expect("list messages");
        assert_eq!(listed, vec![question, answer]);
        assert_eq!(
            listed[0].attachment_ref.as_deref(),
            Some("https://files.example/rash.jpg")
        );
        assert_eq!(listed[1].author, Author::Respondent);
    }

    #[tokio::test]
    async fn writes_against_missing_chats_are_not_found() {
        let (_dir, storage) = open_temp().await;
        let missing = ChatId::new_v7();

        let update = storage
            .update_chat(missing, ChatPatch::default())
            .await
            .expect_err("update must fail");
        assert!(matches!(update, StorageError::NotFound { entity: "chat", .. }));

        let message = storage
            .create_message(NewMessage::user(missing, "hello", None))
            .await
            .expect_err("insert must fail");
        assert!(matches!(message, StorageError::NotFound { entity: "chat", .. }));
    }

    #[tokio::test]
    async fn in_memory_database_survives_between_calls() {
        let storage = SqliteStorage::open(":memory:")
            .await
            .expect("open in-memory store");
        let owner = OwnerId::new("owner");
        storage
            .create_chat(NewChat::new(owner.clone(), "ephemeral"))
            .await
            .expect("create chat");

        let listed = storage.list_chats(&owner).await.expect("list chats");
        assert_eq!(listed.len(), 1);
    }
}
