//! Parley application binary - composition root.
//!
//! Ties the Parley crates into a terminal chat client:
//! 1. Load configuration from TOML and apply CLI overrides
//! 2. Open the SQLite conversation store
//! 3. Wire the HTTP backends, event bus and terminal renderer into the
//!    turn orchestrator
//! 4. Replay a turn deferred by the previous session
//! 5. Read commands from stdin until `/quit`

mod cli;
mod http;
mod render;
mod repl;

use std::sync::Arc;

use clap::Parser;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use parley_chat::{
    ChatError, Collaborators, EventBus, SystemClock, TurnOrchestrator, TurnOutcome, TurnRequest,
};
use parley_core::config::ParleyConfig;
use parley_core::events::DomainEvent;
use parley_storage::{Database, SqliteConversationStore, SqliteHandoffStore};

use cli::CliArgs;
use http::HttpBackend;
use render::TerminalRenderer;
use repl::Command;

/// Per-session input state that the orchestrator does not own.
#[derive(Default)]
struct Session {
    current: Option<Uuid>,
    selected_model: Option<String>,
    attachments: Vec<Value>,
    listed: Vec<Uuid>,
}

impl Session {
    fn request(&mut self, text: String) -> TurnRequest {
        TurnRequest {
            conversation_id: self.current,
            text,
            files: std::mem::take(&mut self.attachments),
            user_selected_model: self.selected_model.clone(),
            ..TurnRequest::default()
        }
    }
}

fn report(result: Result<TurnOutcome, ChatError>, session: &mut Session) {
    match result {
        Ok(outcome) => {
            session.current = Some(outcome.conversation_id);
            println!(
                "[{} | {} tokens{}]",
                outcome.model.display_label,
                outcome.displayed_tokens,
                if outcome.synced { "" } else { " | not saved" }
            );
        }
        Err(e) => report_error(&e),
    }
}

fn report_error(e: &ChatError) {
    match e.user_message() {
        Some(text) => eprintln!("{}", text),
        None => eprintln!("Error: {}", e),
    }
}

/// Print the events a user should notice; everything else is only logged.
fn spawn_event_printer(bus: &EventBus) {
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(DomainEvent::ModelImplied { model_id, .. }) => {
                    println!("(workflow selected model {})", model_id);
                }
                Ok(DomainEvent::ConversationUnsynced { reason, .. }) => {
                    eprintln!("(conversation not saved: {})", reason);
                }
                Ok(DomainEvent::FilesAttached { has_audio: true, .. }) => {
                    println!("(audio attached: a transcription workflow may suit this)");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "Event printer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Run one command. Returns `false` when the session should end.
async fn dispatch(orchestrator: &TurnOrchestrator, session: &mut Session, command: Command) -> bool {
    match command {
        Command::Send(text) => {
            let request = session.request(text);
            let files = request.files.clone();
            let result = orchestrator.run_turn(request).await;
            // The turn was rolled back, so the files go with the next attempt.
            if matches!(&result, Err(e) if e.is_retrieval()) {
                session.attachments = files;
            }
            report(result, session);
        }
        Command::New => {
            session.current = None;
            orchestrator.new_conversation();
            println!("(new conversation)");
        }
        Command::List => match orchestrator.refresh_conversations().await {
            Ok(list) => {
                session.listed = list.iter().map(|c| c.id).collect();
                for (i, conv) in list.iter().enumerate() {
                    println!("  {:>3}  {} ({} messages)", i, conv.name, conv.messages.len());
                }
            }
            Err(e) => report_error(&e),
        },
        Command::Open(n) => match session.listed.get(n) {
            Some(id) => {
                session.current = Some(*id);
                if let Some(conv) = orchestrator.conversation(*id) {
                    for (i, m) in conv.messages.iter().enumerate() {
                        println!("{:>3} {}: {}", i, m.role.as_str(), m.content);
                    }
                }
            }
            None => eprintln!("No conversation {}; run /list first.", n),
        },
        Command::Regenerate => match session.current {
            Some(id) => report(orchestrator.regenerate(id).await, session),
            None => eprintln!("Nothing to regenerate yet."),
        },
        Command::Edit(index, text) => match session.current {
            Some(id) => report(orchestrator.edit_message(id, index, &text).await, session),
            None => eprintln!("No open conversation."),
        },
        Command::Delete(index) => match session.current {
            Some(id) => match orchestrator.delete_message(id, index).await {
                Ok(remaining) => println!("({} messages left)", remaining),
                Err(e) => report_error(&e),
            },
            None => eprintln!("No open conversation."),
        },
        Command::Citations(enabled) => {
            orchestrator.set_citations(enabled);
            println!("(citations {})", if enabled { "on" } else { "off" });
        }
        Command::Attach(file) => {
            session.attachments.push(Value::String(file));
            println!("({} file(s) attached to the next message)", session.attachments.len());
        }
        Command::Model(id) => {
            if orchestrator.resolver().catalog().find(&id).is_some() {
                session.selected_model = Some(id);
            } else {
                eprintln!("Unknown model: {}", id);
            }
        }
        Command::Defer(text) => {
            let request = session.request(text);
            match orchestrator.defer_turn(&request) {
                Ok(()) => {
                    println!("(message saved; it will be sent on next start)");
                    return false;
                }
                Err(e) => report_error(&e),
            }
        }
        Command::Help => println!("{}", repl::HELP),
        Command::Quit => return false,
        Command::Invalid(msg) => eprintln!("{}", msg),
    }
    true
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config. Load errors are reported once tracing is up.
    let config_file = args.resolve_config_path();
    let (mut config, load_error) = match ParleyConfig::load(&config_file) {
        Ok(config) => (config, None),
        Err(e) => (ParleyConfig::default(), Some(e)),
    };
    args.apply(&mut config);

    // Tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting Parley v{}", env!("CARGO_PKG_VERSION"));
    match load_error {
        None => tracing::info!(path = %config_file.display(), "Configuration loaded"),
        // First start: leave an editable copy of the defaults behind.
        Some(_) if !config_file.exists() => {
            if let Err(e) = ParleyConfig::default().save(&config_file) {
                tracing::warn!(path = %config_file.display(), error = %e, "Failed to write default config");
            }
        }
        Some(e) => tracing::warn!(
            path = %config_file.display(),
            error = %e,
            "Failed to load config, using defaults"
        ),
    }

    // Storage.
    let data_dir = cli::expand_home(&config.general.data_dir);
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }
    let db_path = data_dir.join("parley.db");
    let db = Arc::new(Database::new(&db_path)?);
    tracing::info!(path = %db_path.display(), "SQLite database opened");

    // Orchestrator.
    let backend = Arc::new(HttpBackend::new(&config.backend)?);
    tracing::info!(base_url = %config.backend.base_url, "Backend configured");

    let bus = EventBus::new();
    spawn_event_printer(&bus);

    let orchestrator = TurnOrchestrator::new(
        &config,
        Collaborators {
            generation: backend.clone(),
            retrieval: backend,
            store: Arc::new(SqliteConversationStore::new(Arc::clone(&db))),
            handoff: Arc::new(SqliteHandoffStore::new(Arc::clone(&db))),
            republisher: Arc::new(TerminalRenderer::new()),
        },
        bus,
        Arc::new(SystemClock),
    );

    let mut session = Session {
        selected_model: args.model.clone(),
        ..Session::default()
    };

    if let Err(e) = orchestrator.refresh_conversations().await {
        tracing::warn!(error = %e, "Could not load saved conversations");
    }
    match orchestrator.replay_pending().await {
        Ok(Some(outcome)) => report(Ok(outcome), &mut session),
        Ok(None) => {}
        Err(e) => report_error(&e),
    }

    // === Session loop ===

    println!("Parley ready. Type a message, or /help for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(command) = repl::parse(&line) else {
            continue;
        };
        if !dispatch(&orchestrator, &mut session, command).await {
            break;
        }
    }

    tracing::info!("Parley stopped");
    Ok(())
}
