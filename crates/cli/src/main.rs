use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colloquy_chat::{
    AppSettings, ChannelEventBus, ChatBridge, ChatEvent, ConversationStore, EnvSecretStore,
    GatewayError, Orchestrator, OrchestratorError, SettingsStore, SignalRegistry, StoreError,
};
use colloquy_storage::{
    ConversationRepository, ConversationSummary, MemoryRepository, MessageId, SqliteRepository,
    StorageError,
};
use snafu::{ResultExt, Snafu};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "colloquy", about = "Headless conversation client with streaming replies")]
struct Cli {
    /// Settings file; defaults to <config dir>/colloquy/settings.json
    #[arg(long, env = "COLLOQUY_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path or URL, overriding the settings file
    #[arg(long)]
    database: Option<String>,

    /// Keep conversations in memory only
    #[arg(long)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a conversation using the configured defaults
    New {
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// List conversations, most recent first
    List {
        /// List archived conversations instead
        #[arg(long)]
        deleted: bool,
    },
    /// Print a conversation and its messages
    Show { id: String },
    /// Send a message and stream the reply; Ctrl-C stops the stream
    Send { id: String, content: String },
    Title { id: String, title: String },
    Model { id: String, model: String },
    /// Set the provider; an empty value disables replies
    Provider { id: String, provider: String },
    /// Archive a conversation
    Delete { id: String },
    Restore { id: String },
    /// Permanently remove a conversation
    Purge { id: String },
    /// Check that a provider is reachable with the configured credentials
    TestProvider { provider: String },
}

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("failed to open database on `{stage}`: {source}"))]
    OpenDatabase {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to load conversations on `{stage}`: {source}"))]
    OpenStore {
        stage: &'static str,
        source: StoreError,
    },
    #[snafu(display("{source}"))]
    Chat {
        stage: &'static str,
        source: OrchestratorError,
    },
    #[snafu(display("provider check failed on `{stage}`: {source}"))]
    ProviderCheck {
        stage: &'static str,
        source: GatewayError,
    },
    #[snafu(display("assistant reply failed: {message}"))]
    StreamFailed { stage: &'static str, message: String },
}

type CliResult<T> = Result<T, CliError>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let settings_store = match cli.config.clone() {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::load(),
    };
    let settings = settings_store.settings();
    init_tracing(&settings.log_filter);

    if let Err(error) = run(cli, &settings).await {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli, settings: &AppSettings) -> CliResult<()> {
    let repository: Arc<dyn ConversationRepository> = if cli.ephemeral {
        Arc::new(MemoryRepository::new())
    } else {
        let location = cli
            .database
            .clone()
            .unwrap_or_else(|| settings.database_path.clone());
        Arc::new(
            SqliteRepository::open(&location)
                .await
                .context(OpenDatabaseSnafu {
                    stage: "open-sqlite-repository",
                })?,
        )
    };

    let store = ConversationStore::open(repository).context(OpenStoreSnafu {
        stage: "open-conversation-store",
    })?;
    let bridge = Arc::new(ChatBridge::new(
        settings.provider_registry(),
        Arc::new(EnvSecretStore),
    ));
    let (bus, events) = ChannelEventBus::new();
    let orchestrator = Orchestrator::new(
        Arc::new(store),
        Some(bridge.clone()),
        Arc::new(SignalRegistry::with_bus(Arc::new(bus))),
    );

    match cli.command {
        Command::New {
            title,
            provider,
            model,
        } => {
            let mut conversation_settings = settings.conversation_defaults();
            if let Some(provider) = provider {
                conversation_settings.provider = provider.trim().to_string();
            }
            if let Some(model) = model {
                conversation_settings.model = model.trim().to_string();
            }
            let conversation = orchestrator
                .create_conversation(title.as_deref().unwrap_or_default(), conversation_settings)
                .context(ChatSnafu {
                    stage: "create-conversation",
                })?;
            println!("{}", conversation.id);
        }
        Command::List { deleted } => {
            let summaries = if deleted {
                orchestrator.list_deleted_conversations()
            } else {
                orchestrator.list_conversations()
            };
            for summary in &summaries {
                print_summary(summary);
            }
        }
        Command::Show { id } => {
            let conversation = orchestrator
                .get_conversation(&id)
                .context(ChatSnafu { stage: "show" })?;
            print_summary(&conversation.summary());
            for message in &conversation.messages {
                println!();
                println!("[{}]", message.role.as_str());
                println!("{}", message.text());
                if let Some(metadata) = &message.metadata {
                    println!(
                        "({} {} | {} tokens | {} ms | {})",
                        metadata.provider,
                        metadata.model,
                        metadata.total_tokens,
                        metadata.latency_ms,
                        metadata.finish_reason
                    );
                }
            }
        }
        Command::Send { id, content } => {
            send_and_stream(&orchestrator, events, &id, &content).await?;
        }
        Command::Title { id, title } => orchestrator
            .set_conversation_title(&id, &title)
            .context(ChatSnafu { stage: "set-title" })?,
        Command::Model { id, model } => orchestrator
            .update_conversation_model(&id, &model)
            .context(ChatSnafu {
                stage: "update-model",
            })?,
        Command::Provider { id, provider } => orchestrator
            .update_conversation_provider(&id, &provider)
            .context(ChatSnafu {
                stage: "update-provider",
            })?,
        Command::Delete { id } => orchestrator
            .delete_conversation(&id)
            .context(ChatSnafu {
                stage: "delete-conversation",
            })?,
        Command::Restore { id } => orchestrator
            .restore_conversation(&id)
            .context(ChatSnafu {
                stage: "restore-conversation",
            })?,
        Command::Purge { id } => orchestrator
            .purge_conversation(&id)
            .context(ChatSnafu {
                stage: "purge-conversation",
            })?,
        Command::TestProvider { provider } => {
            bridge
                .test_connection(&provider, CancellationToken::new())
                .await
                .context(ProviderCheckSnafu {
                    stage: "test-provider",
                })?;
            println!("provider '{provider}' is reachable");
        }
    }

    Ok(())
}

fn print_summary(summary: &ConversationSummary) {
    let provider = if summary.provider.is_empty() {
        "-"
    } else {
        summary.provider.as_str()
    };
    println!(
        "{}\t{}\t{}/{}\t{} messages",
        summary.id, summary.title, provider, summary.model, summary.message_count
    );
}

enum Progress {
    Pending,
    Done,
}

/// Follows the stream of one send on the event bus.
struct SendFollower {
    message_id: Option<MessageId>,
    failure: Option<String>,
}

impl SendFollower {
    fn apply(&mut self, event: ChatEvent) -> Progress {
        match event {
            ChatEvent::StreamStarted(started) => {
                tracing::debug!(provider = %started.provider, model = %started.model, "reply started");
                self.message_id = Some(started.message_id);
            }
            ChatEvent::StreamChunk(chunk) if self.is_current(&chunk.message_id) => {
                print!("{}", chunk.delta);
                let _ = std::io::stdout().flush();
            }
            ChatEvent::StreamComplete(complete) if self.is_current(&complete.message_id) => {
                println!();
                if complete.metadata.finish_reason != colloquy_chat::FINISH_REASON_STOP {
                    eprintln!("({})", complete.metadata.finish_reason);
                }
                return Progress::Done;
            }
            ChatEvent::StreamError(error) if self.is_current(&error.message_id) => {
                println!();
                self.failure = Some(match error.status_code {
                    Some(status) => format!("{} (status {status})", error.error),
                    None => error.error,
                });
                return Progress::Done;
            }
            _ => {}
        }
        Progress::Pending
    }

    fn is_current(&self, message_id: &MessageId) -> bool {
        self.message_id.as_ref() == Some(message_id)
    }
}

async fn send_and_stream(
    orchestrator: &Orchestrator,
    mut events: mpsc::UnboundedReceiver<ChatEvent>,
    conversation_id: &str,
    content: &str,
) -> CliResult<()> {
    let ctx = CancellationToken::new();
    orchestrator
        .send_message(&ctx, conversation_id, content)
        .await
        .context(ChatSnafu {
            stage: "send-message",
        })?;

    let mut follower = SendFollower {
        message_id: None,
        failure: None,
    };

    // Everything up to stream-started is published before the send returns.
    let mut progress = Progress::Pending;
    while let Ok(event) = events.try_recv() {
        progress = follower.apply(event);
        if matches!(progress, Progress::Done) {
            break;
        }
    }

    if follower.message_id.is_none() {
        eprintln!("message saved; no provider configured for a reply");
        return Ok(());
    }

    let mut stopping = false;
    while matches!(progress, Progress::Pending) {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => progress = follower.apply(event),
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !stopping => {
                stopping = true;
                orchestrator.stop_stream();
            }
        }
    }

    match follower.failure {
        Some(message) => StreamFailedSnafu {
            stage: "stream-reply",
            message,
        }
        .fail(),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use colloquy_chat::signals::{StreamChunk, StreamComplete, StreamError, StreamStarted};
    use colloquy_storage::{ConversationId, MessageMetadata};

    use super::*;

    fn ids() -> (ConversationId, MessageId) {
        (
            ConversationId::parse("conv-1").unwrap(),
            MessageId::parse("msg-1").unwrap(),
        )
    }

    #[test]
    fn follower_ignores_other_streams_and_stops_on_completion() {
        let (conversation_id, message_id) = ids();
        let mut follower = SendFollower {
            message_id: None,
            failure: None,
        };

        follower.apply(ChatEvent::StreamStarted(StreamStarted {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
        }));
        let other = ChatEvent::StreamComplete(StreamComplete {
            conversation_id: conversation_id.clone(),
            message_id: MessageId::parse("msg-2").unwrap(),
            metadata: MessageMetadata::default(),
        });
        assert!(matches!(follower.apply(other), Progress::Pending));

        let chunk = ChatEvent::StreamChunk(StreamChunk {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
            delta: "hi".to_string(),
        });
        assert!(matches!(follower.apply(chunk), Progress::Pending));

        let done = ChatEvent::StreamComplete(StreamComplete {
            conversation_id,
            message_id,
            metadata: MessageMetadata {
                finish_reason: "stop".to_string(),
                ..MessageMetadata::default()
            },
        });
        assert!(matches!(follower.apply(done), Progress::Done));
        assert!(follower.failure.is_none());
    }

    #[test]
    fn follower_records_stream_errors() {
        let (conversation_id, message_id) = ids();
        let mut follower = SendFollower {
            message_id: Some(message_id.clone()),
            failure: None,
        };

        let error = ChatEvent::StreamError(StreamError {
            conversation_id,
            message_id,
            error: "rate limited".to_string(),
            status_code: Some(429),
        });
        assert!(matches!(follower.apply(error), Progress::Done));
        assert_eq!(follower.failure.as_deref(), Some("rate limited (status 429)"));
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["colloquy", "--ephemeral", "list", "--deleted"]).unwrap();
        assert!(cli.ephemeral);
        assert!(matches!(cli.command, Command::List { deleted: true }));

        let cli = Cli::try_parse_from(["colloquy", "send", "conv-1", "hello there"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Send { ref id, ref content } if id == "conv-1" && content == "hello there"
        ));
    }
}
