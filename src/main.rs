use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};

use highlight_store::config::AppConfig;
use highlight_store::logging::{init_logging, OperationTimer};
use highlight_store::models::{CaptureEvent, PositionData};
use highlight_store::{HighlightStore, Repository};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/default and config/local)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the store, running any pending migrations
    Init,
    /// Capture a highlight
    Capture {
        /// Highlighted text
        #[arg(short, long)]
        text: String,

        /// Page URL
        #[arg(short, long)]
        url: String,

        /// Page title
        #[arg(long, default_value = "")]
        title: String,

        /// Conversation to attach to
        #[arg(long)]
        conversation: Option<String>,
    },
    /// Browse and delete highlights
    Highlights {
        #[command(subcommand)]
        action: HighlightAction,
    },
    /// Browse and delete conversations
    Conversations {
        #[command(subcommand)]
        action: ConversationAction,
    },
    /// List signed-in users
    Users,
}

#[derive(Subcommand)]
enum HighlightAction {
    /// List highlights, newest first
    List {
        /// Only highlights of this conversation
        #[arg(long)]
        conversation: Option<String>,
    },
    /// Delete one highlight
    Delete {
        /// Highlight id
        id: String,
    },
}

#[derive(Subcommand)]
enum ConversationAction {
    /// List conversations, most recently updated first
    List,
    /// Show a conversation with everything attached to it
    Show {
        /// Conversation id
        id: String,
    },
    /// Delete a conversation and everything it owns
    Delete {
        /// Conversation id
        id: String,
    },
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    config.validate()?;

    // Keep the guard alive so file logs flush on exit
    let _guard = init_logging(&config.logging)?;

    info!(path = %config.database.store_path().display(), "Starting highlight-store");

    let store = HighlightStore::new(config.database.clone());
    let result = run(&store, cli.command).await;

    if let Err(err) = store.close().await {
        warn!(error = %err, "Failed to close store");
    }
    result
}

async fn run(store: &HighlightStore, command: Commands) -> Result<()> {
    match command {
        Commands::Init => {
            let timer = OperationTimer::new("init");
            store.init().await.context("Failed to open store")?;
            let db = store.database();
            info!(version = db.version()?, collections = ?db.collection_names()?, "Store ready");
            timer.finish();
        },
        Commands::Capture { text, url, title, conversation } => {
            let event = CaptureEvent {
                text,
                position: PositionData::default(),
                page_url: url,
                page_title: title,
                timestamp: Utc::now(),
                conversation_id: conversation,
            };
            let highlight = store.capture_highlight(event).await?;
            emit(&highlight)?;
        },
        Commands::Highlights { action } => match action {
            HighlightAction::List { conversation } => {
                let highlights = store.get_highlights(conversation.as_deref()).await?;
                info!("Found {} highlights", highlights.len());
                emit(&highlights)?;
            },
            HighlightAction::Delete { id } => {
                store.highlights().delete(&id).await?;
                info!(highlight_id = %id, "Deleted highlight");
            },
        },
        Commands::Conversations { action } => match action {
            ConversationAction::List => emit(&store.conversations().get_all().await?)?,
            ConversationAction::Show { id } => {
                let conversation = store
                    .conversations()
                    .get_with_context(&id)
                    .await?
                    .with_context(|| format!("Conversation not found: {id}"))?;
                emit(&conversation)?;
            },
            ConversationAction::Delete { id } => {
                let timer = OperationTimer::new("delete_conversation");
                store
                    .conversations()
                    .delete(&id)
                    .await
                    .with_context(|| format!("Failed to delete conversation {id}; retry to finish"))?;
                timer.finish();
            },
        },
        Commands::Users => emit(&store.get_all_users().await?)?,
    }
    Ok(())
}
