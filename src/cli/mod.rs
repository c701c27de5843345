//! Command-line interface parsing and handling
//!
//! This module handles parsing command-line arguments and executing the appropriate commands.

pub mod chat;
pub mod console;

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::cli::chat::{run_chat, ChatOptions};
use crate::cli::console::format_transcript_line;
use crate::core::character::{seed_starting_scene, CharacterCatalog};
use crate::core::config::Config;
use crate::core::store::{FileSessionStore, SessionStore};
use crate::utils::logging::init_tracing;

#[derive(Parser)]
#[command(name = "parlance")]
#[command(about = "Chat with language-model characters from the terminal")]
#[command(
    long_about = "Parlance streams character replies into your terminal and keeps every \
session on disk, including regenerated variants and starting scenes.\n\n\
Environment Variables:\n\
  OPENAI_API_KEY    API key for the configured backend (name configurable)\n\
  PARLANCE_LOG      tracing filter, e.g. 'parlance=debug'\n\n\
Chat commands:\n\
  /continue         Let the character keep talking\n\
  /regen            Regenerate the last reply\n\
  /swipe next|prev  Move through variants or starting scenes\n\
  /select N         Show variant N of the last reply\n\
  /pin N            Toggle the pin on message N\n\
  /delete N         Delete message N\n\
  /rewind N         Drop everything after message N\n\
  /edit N text      Replace the text of message N\n\
  /quit             Leave the chat\n\
  Ctrl+C            Abort the reply that is streaming"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Append log output to this file instead of stderr
    #[arg(short = 'l', long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Read configuration from this file instead of the platform default
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the chat interface (default)
    Chat {
        /// Resume a stored session
        #[arg(long)]
        session: Option<String>,
        /// Start a new session with this character
        #[arg(long)]
        character: Option<String>,
    },
    /// List stored sessions
    Sessions,
    /// Create a session without starting a chat
    New {
        #[arg(long)]
        character: String,
        #[arg(long, default_value = "New chat")]
        title: String,
        /// Starting scene id; defaults to the character's default scene
        #[arg(long)]
        scene: Option<String>,
    },
    /// Print a stored session
    Show { id: String },
    /// Print the effective configuration
    Config,
}

/// Storage resolved from the configuration.
pub struct Workspace {
    pub config: Config,
    pub store: Arc<FileSessionStore>,
    pub characters: CharacterCatalog,
}

impl Workspace {
    pub fn from_config(config: Config) -> Result<Self, Box<dyn Error>> {
        let data_dir = config.resolve_data_dir()?;
        Ok(Self {
            store: Arc::new(FileSessionStore::new(data_dir.join("sessions"))),
            characters: CharacterCatalog::new(data_dir.join("characters")),
            config,
        })
    }
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    init_tracing(
        config.log_filter.as_deref().unwrap_or("info"),
        args.log_file.as_deref(),
    )?;
    let workspace = Workspace::from_config(config)?;

    match args.command.unwrap_or(Commands::Chat {
        session: None,
        character: None,
    }) {
        Commands::Chat { session, character } => {
            run_chat(&workspace, ChatOptions { session, character }).await
        }
        Commands::Sessions => list_sessions(&workspace).await,
        Commands::New {
            character,
            title,
            scene,
        } => {
            let character = workspace.characters.load(&character)?;
            let mut session = workspace
                .store
                .create(&character.id, &title, None, scene.as_deref())
                .await?;
            seed_starting_scene(&mut session, &character, scene.as_deref());
            workspace.store.save(&session).await?;
            println!("✅ Created session {} with {}", session.id, character.name);
            Ok(())
        }
        Commands::Show { id } => {
            let session = workspace
                .store
                .get(&id)
                .await?
                .ok_or_else(|| format!("Session '{id}' not found"))?;
            println!("{} ({})", session.title, session.character_id);
            for (index, message) in session.messages.iter().enumerate() {
                println!("{}", format_transcript_line(index + 1, message));
            }
            Ok(())
        }
        Commands::Config => {
            workspace.config.print_all();
            Ok(())
        }
    }
}

async fn list_sessions(workspace: &Workspace) -> Result<(), Box<dyn Error>> {
    let ids = workspace.store.list_ids().await?;
    if ids.is_empty() {
        println!("No sessions yet. Create one with: parlance new --character <id>");
        return Ok(());
    }
    for id in ids {
        match workspace.store.get(&id).await {
            Ok(Some(session)) => println!(
                "{}  {}  [{}]  {} messages",
                session.id,
                session.title,
                session.character_id,
                session.messages.len()
            ),
            Ok(None) => {}
            Err(err) => eprintln!("⚠️  {id}: {err}"),
        }
    }
    Ok(())
}
