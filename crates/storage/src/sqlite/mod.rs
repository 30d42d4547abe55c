use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, FromRow, SqliteConnection};

use super::error::{
    CreateSqliteDirectorySnafu, DecodeJsonSnafu, EncodeJsonSnafu, InvariantViolationSnafu,
    NotFoundSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqlitePragmaSnafu, SqliteQuerySnafu, SqliteRuntimeInitSnafu, SqliteThreadSpawnSnafu,
    StorageError, StorageResult,
};
use super::ids::{ConversationId, MessageId};
use super::types::{Block, Conversation, ConversationSettings, Message, MessageMetadata, MessageRole};
use super::ConversationRepository;

const SELECT_CONVERSATION_COLUMNS: &str = "SELECT id, title, provider, model, temperature, max_tokens, system_prompt, created_at, updated_at, archived FROM conversations";
const SELECT_MESSAGE_COLUMNS: &str = "SELECT id, conversation_id, seq, role, blocks_json, created_at, is_streaming, metadata_json FROM messages";

#[derive(Debug, Clone)]
pub struct SqliteRepository {
    database_url: String,
}

impl SqliteRepository {
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

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        // Calls below use short-lived connections; the bootstrap pool is only for migrations.
        pool.close().await;

        tracing::info!(database_url = %database_url, "opened sqlite conversation repository");
        Ok(Self { database_url })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        // Repository traits are sync, so each call executes on a dedicated worker thread
        // with its own current-thread runtime to avoid nested-runtime blocking panics.
        let worker = std::thread::Builder::new()
            .name(format!("sqlite-repo-{stage}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context(SqliteRuntimeInitSnafu {
                        stage: "sqlite-repo-runtime-build",
                    })?;
                runtime.block_on(op)
            })
            .context(SqliteThreadSpawnSnafu {
                stage: "sqlite-repo-spawn-worker",
            })?;

        match worker.join() {
            Ok(result) => result,
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "sqlite repository worker thread panicked".to_string(),
            }
            .fail(),
        }
    }
}

impl ConversationRepository for SqliteRepository {
    fn create(&self, conversation: &Conversation) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        let conversation = conversation.clone();
        self.run_db_call("conversation-create", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-create-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "conversation-create-begin",
            })?;

            let max_tokens = conversation
                .settings
                .max_tokens
                .map(|value| u64_to_i64(value, "conversation-create-max-tokens"))
                .transpose()?;

            sqlx::query(
                "INSERT INTO conversations (id, title, provider, model, temperature, max_tokens, system_prompt, created_at, updated_at, archived) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(conversation.id.as_str())
            .bind(conversation.title.as_str())
            .bind(conversation.settings.provider.as_str())
            .bind(conversation.settings.model.as_str())
            .bind(conversation.settings.temperature)
            .bind(max_tokens)
            .bind(conversation.settings.system_prompt.clone())
            .bind(u64_to_i64(conversation.created_at_unix_ms, "conversation-create-created-at")?)
            .bind(u64_to_i64(conversation.updated_at_unix_ms, "conversation-create-updated-at")?)
            .bind(conversation.archived)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-create-insert",
            })?;

            insert_messages(&mut tx, &conversation, "conversation-create-insert-message").await?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "conversation-create-commit",
            })?;
            Ok(())
        })
    }

    fn get(&self, conversation_id: &ConversationId) -> StorageResult<Option<Conversation>> {
        let database_url = self.database_url.clone();
        let conversation_id = conversation_id.clone();
        self.run_db_call("conversation-get", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-get-connect").await?;
            let row = sqlx::query_as::<_, ConversationRow>(&format!(
                "{SELECT_CONVERSATION_COLUMNS} WHERE id = ?"
            ))
            .bind(conversation_id.as_str())
            .fetch_optional(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-get-query",
            })?;

            let Some(row) = row else {
                return Ok(None);
            };

            let message_rows = sqlx::query_as::<_, MessageRow>(&format!(
                "{SELECT_MESSAGE_COLUMNS} WHERE conversation_id = ? ORDER BY seq ASC"
            ))
            .bind(conversation_id.as_str())
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-get-messages",
            })?;

            let messages = message_rows
                .into_iter()
                .map(message_row_to_message)
                .collect::<StorageResult<Vec<_>>>()?;
            conversation_row_to_conversation(row, messages).map(Some)
        })
    }

    fn list(&self) -> StorageResult<Vec<Conversation>> {
        let database_url = self.database_url.clone();
        self.run_db_call("conversation-list", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-list-connect").await?;
            let rows = sqlx::query_as::<_, ConversationRow>(&format!(
                "{SELECT_CONVERSATION_COLUMNS} ORDER BY updated_at DESC, id DESC"
            ))
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-list-query",
            })?;

            let message_rows = sqlx::query_as::<_, MessageRow>(&format!(
                "{SELECT_MESSAGE_COLUMNS} ORDER BY conversation_id ASC, seq ASC"
            ))
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-list-messages",
            })?;

            let mut messages_by_conversation: HashMap<String, Vec<Message>> = HashMap::new();
            for row in message_rows {
                let message = message_row_to_message(row)?;
                messages_by_conversation
                    .entry(message.conversation_id.as_str().to_string())
                    .or_default()
                    .push(message);
            }

            rows.into_iter()
                .map(|row| {
                    let messages = messages_by_conversation.remove(&row.id).unwrap_or_default();
                    conversation_row_to_conversation(row, messages)
                })
                .collect()
        })
    }

    fn update(&self, conversation: &Conversation) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        let conversation = conversation.clone();
        self.run_db_call("conversation-update", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-update-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "conversation-update-begin",
            })?;

            let max_tokens = conversation
                .settings
                .max_tokens
                .map(|value| u64_to_i64(value, "conversation-update-max-tokens"))
                .transpose()?;

            let result = sqlx::query(
                "UPDATE conversations SET title = ?, provider = ?, model = ?, temperature = ?, max_tokens = ?, system_prompt = ?, updated_at = ?, archived = ? WHERE id = ?",
            )
            .bind(conversation.title.as_str())
            .bind(conversation.settings.provider.as_str())
            .bind(conversation.settings.model.as_str())
            .bind(conversation.settings.temperature)
            .bind(max_tokens)
            .bind(conversation.settings.system_prompt.clone())
            .bind(u64_to_i64(conversation.updated_at_unix_ms, "conversation-update-updated-at")?)
            .bind(conversation.archived)
            .bind(conversation.id.as_str())
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-update-apply",
            })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "conversation-update-missing",
                    entity: "conversation",
                    id: conversation.id.to_string(),
                }
                .fail();
            }

            // Messages are rewritten wholesale so seq always mirrors in-memory order.
            sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
                .bind(conversation.id.as_str())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-update-clear-messages",
                })?;

            insert_messages(&mut tx, &conversation, "conversation-update-insert-message").await?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "conversation-update-commit",
            })?;
            Ok(())
        })
    }

    fn delete(&self, conversation_id: &ConversationId) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        let conversation_id = conversation_id.clone();
        self.run_db_call("conversation-delete", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-delete-connect").await?;
            let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
                .bind(conversation_id.as_str())
                .execute(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-delete-apply",
                })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "conversation-delete-missing",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            }

            Ok(())
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    title: String,
    provider: String,
    model: String,
    temperature: Option<f64>,
    max_tokens: Option<i64>,
    system_prompt: Option<String>,
    created_at: i64,
    updated_at: i64,
    archived: bool,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    seq: i64,
    role: String,
    blocks_json: String,
    created_at: i64,
    is_streaming: bool,
    metadata_json: Option<String>,
}

async fn insert_messages(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    conversation: &Conversation,
    stage: &'static str,
) -> StorageResult<()> {
    for (index, message) in conversation.messages.iter().enumerate() {
        let blocks_json = serde_json::to_string(&message.blocks).context(EncodeJsonSnafu {
            stage,
            field: "blocks",
        })?;
        let metadata_json = message
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context(EncodeJsonSnafu {
                stage,
                field: "metadata",
            })?;
        let seq = i64::try_from(index).map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("message index '{index}' cannot map to sqlite i64"),
        })?;

        sqlx::query(
            "INSERT INTO messages (id, conversation_id, seq, role, blocks_json, created_at, is_streaming, metadata_json) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message.id.as_str())
        .bind(conversation.id.as_str())
        .bind(seq)
        .bind(message.role.as_str())
        .bind(blocks_json)
        .bind(u64_to_i64(message.created_at_unix_ms, stage)?)
        .bind(message.is_streaming)
        .bind(metadata_json)
        .execute(&mut **tx)
        .await
        .context(SqliteQuerySnafu { stage })?;
    }

    Ok(())
}

fn conversation_row_to_conversation(
    row: ConversationRow,
    messages: Vec<Message>,
) -> StorageResult<Conversation> {
    Ok(Conversation {
        id: ConversationId::parse(&row.id)?,
        title: row.title,
        messages,
        settings: ConversationSettings {
            provider: row.provider,
            model: row.model,
            temperature: row.temperature,
            max_tokens: row
                .max_tokens
                .map(|value| i64_to_u64(value, "conversation-row-max-tokens"))
                .transpose()?,
            system_prompt: row.system_prompt,
        },
        created_at_unix_ms: i64_to_u64(row.created_at, "conversation-row-created-at")?,
        updated_at_unix_ms: i64_to_u64(row.updated_at, "conversation-row-updated-at")?,
        archived: row.archived,
    })
}

fn message_row_to_message(row: MessageRow) -> StorageResult<Message> {
    let blocks = serde_json::from_str::<Vec<Block>>(&row.blocks_json).context(DecodeJsonSnafu {
        stage: "message-row-blocks",
        field: "blocks",
    })?;
    let metadata = row
        .metadata_json
        .as_deref()
        .map(serde_json::from_str::<MessageMetadata>)
        .transpose()
        .context(DecodeJsonSnafu {
            stage: "message-row-metadata",
            field: "metadata",
        })?;
    let role = MessageRole::parse(&row.role).context(InvariantViolationSnafu {
        stage: "message-row-role",
        details: format!("unknown message role '{}' at seq {}", row.role, row.seq),
    })?;

    Ok(Message {
        id: MessageId::parse(&row.id)?,
        conversation_id: ConversationId::parse(&row.conversation_id)?,
        role,
        blocks,
        created_at_unix_ms: i64_to_u64(row.created_at, "message-row-created-at")?,
        is_streaming: row.is_streaming,
        metadata,
    })
}

async fn connect_store_connection(
    database_url: &str,
    stage: &'static str,
) -> StorageResult<SqliteConnection> {
    let mut connection =
        SqliteConnection::connect(database_url)
            .await
            .context(SqliteConnectSnafu {
                stage,
                database_url: database_url.to_string(),
            })?;

    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-repo-pragma-foreign-keys",
            pragma: "foreign_keys",
        })?;
    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-repo-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") {
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

    format!("sqlite://{database_location}")
}
