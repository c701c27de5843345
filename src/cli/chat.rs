use std::error::Error;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use crate::cli::console::{print_transcript, spawn_console};
use crate::cli::Workspace;
use crate::core::app::{ChatController, SwipeDirection, TurnOutcome, TurnSettings};
use crate::core::backend::http::{HttpBackendParams, HttpCompletionService};
use crate::core::backend::CompletionService;
use crate::core::message::TranscriptEntry;
use crate::core::store::SessionStore;
use crate::core::stream_bus::StreamEventBus;

pub struct ChatOptions {
    pub session: Option<String>,
    pub character: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Send(String),
    Continue,
    Regenerate,
    Swipe(SwipeDirection),
    Select(usize),
    Pin(usize),
    Delete(usize),
    Rewind(usize),
    Edit(usize, String),
    Show,
    Quit,
}

fn parse_index(arg: Option<&str>) -> Result<usize, String> {
    arg.and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|index| *index > 0)
        .ok_or_else(|| "Expected a message number (1-based)".to_string())
}

/// Parse one line of REPL input. Lines not starting with `/` are sent as-is.
pub fn parse_command(line: &str) -> Result<Option<ReplCommand>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let Some(command_line) = trimmed.strip_prefix('/') else {
        return Ok(Some(ReplCommand::Send(line.trim_end().to_string())));
    };

    let mut parts = command_line.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default();
    let rest = parts.next().map(str::trim);

    let command = match name {
        "continue" => ReplCommand::Continue,
        "regen" => ReplCommand::Regenerate,
        "swipe" => match rest {
            Some("next") => ReplCommand::Swipe(SwipeDirection::Next),
            Some("prev") => ReplCommand::Swipe(SwipeDirection::Prev),
            _ => return Err("Usage: /swipe next|prev".to_string()),
        },
        "select" => ReplCommand::Select(parse_index(rest)?),
        "pin" => ReplCommand::Pin(parse_index(rest)?),
        "delete" => ReplCommand::Delete(parse_index(rest)?),
        "rewind" => ReplCommand::Rewind(parse_index(rest)?),
        "edit" => {
            let mut args = rest.unwrap_or_default().splitn(2, char::is_whitespace);
            let index = parse_index(args.next())?;
            let text = args.next().map(str::trim).unwrap_or_default();
            if text.is_empty() {
                return Err("Usage: /edit N new text".to_string());
            }
            ReplCommand::Edit(index, text.to_string())
        }
        "show" => ReplCommand::Show,
        "quit" | "exit" => ReplCommand::Quit,
        other => return Err(format!("Unknown command: /{other}")),
    };
    Ok(Some(command))
}

enum TurnRequest {
    Send(String),
    Continue,
    Regenerate(String),
}

/// Run one turn in its own task so Ctrl+C can abort it while it streams.
async fn drive_turn(
    controller: &Arc<ChatController>,
    request: TurnRequest,
) -> Result<TurnOutcome, Box<dyn Error>> {
    let task_controller = controller.clone();
    let mut handle = tokio::spawn(async move {
        match request {
            TurnRequest::Send(text) => task_controller.send(text, Vec::new()).await,
            TurnRequest::Continue => task_controller.continue_turn().await,
            TurnRequest::Regenerate(message_id) => task_controller.regenerate(&message_id).await,
        }
    });

    loop {
        tokio::select! {
            joined = &mut handle => return Ok(joined??),
            signal = tokio::signal::ctrl_c() => {
                signal?;
                if let Some(request_id) = controller.active_request_id() {
                    info!(request_id = %request_id, "aborting on Ctrl+C");
                    controller.abort(&request_id).await;
                }
            }
        }
    }
}

fn message_id_at(controller: &ChatController, index: usize) -> Result<String, String> {
    controller.state().read(|state| {
        state
            .transcript
            .get(index - 1)
            .and_then(TranscriptEntry::as_persisted)
            .map(|message| message.id.clone())
            .ok_or_else(|| format!("No saved message #{index}"))
    })
}

fn last_message_id(controller: &ChatController) -> Result<String, String> {
    controller.state().read(|state| {
        state
            .last_entry()
            .and_then(TranscriptEntry::as_persisted)
            .map(|message| message.id.clone())
            .ok_or_else(|| "The conversation is empty".to_string())
    })
}

async fn execute(
    controller: &Arc<ChatController>,
    command: ReplCommand,
) -> Result<(), Box<dyn Error>> {
    match command {
        ReplCommand::Send(text) => {
            drive_turn(controller, TurnRequest::Send(text)).await?;
        }
        ReplCommand::Continue => {
            drive_turn(controller, TurnRequest::Continue).await?;
        }
        ReplCommand::Regenerate => {
            let message_id = last_message_id(controller)?;
            if drive_turn(controller, TurnRequest::Regenerate(message_id)).await?
                == TurnOutcome::Skipped
            {
                println!("Only the last reply can be regenerated.");
            }
        }
        ReplCommand::Swipe(direction) => {
            let message_id = last_message_id(controller)?;
            if controller.variants().swipe(&message_id, direction).await? {
                print_transcript(&controller.snapshot());
            } else {
                println!("Nothing to swipe to.");
            }
        }
        ReplCommand::Select(variant) => {
            let message_id = last_message_id(controller)?;
            let variant_id = controller
                .state()
                .read(|state| {
                    state
                        .message(&message_id)
                        .and_then(|message| message.variants.get(variant - 1))
                        .map(|variant| variant.id.clone())
                })
                .ok_or_else(|| format!("The last reply has no variant #{variant}"))?;
            controller
                .variants()
                .apply_variant_selection(&message_id, &variant_id)
                .await?;
            print_transcript(&controller.snapshot());
        }
        ReplCommand::Pin(index) => {
            let message_id = message_id_at(controller, index)?;
            let pinned = controller.synchronizer().toggle_pin(&message_id).await?;
            println!("Message #{index} {}.", if pinned { "pinned" } else { "unpinned" });
        }
        ReplCommand::Delete(index) => {
            let message_id = message_id_at(controller, index)?;
            controller.synchronizer().delete(&message_id).await?;
            print_transcript(&controller.snapshot());
        }
        ReplCommand::Rewind(index) => {
            let message_id = message_id_at(controller, index)?;
            controller.synchronizer().rewind_to(&message_id).await?;
            print_transcript(&controller.snapshot());
        }
        ReplCommand::Edit(index, text) => {
            let message_id = message_id_at(controller, index)?;
            controller.synchronizer().edit(&message_id, text).await?;
            print_transcript(&controller.snapshot());
        }
        ReplCommand::Show => print_transcript(&controller.snapshot()),
        ReplCommand::Quit => {}
    }
    Ok(())
}

pub async fn run_chat(workspace: &Workspace, options: ChatOptions) -> Result<(), Box<dyn Error>> {
    let config = &workspace.config;
    let api_key = std::env::var(&config.backend.api_key_env)
        .map_err(|_| format!("❌ {} is not set", config.backend.api_key_env))?;

    let bus = StreamEventBus::new();
    let store: Arc<dyn SessionStore> = workspace.store.clone();
    let backend: Arc<dyn CompletionService> = Arc::new(HttpCompletionService::new(
        HttpBackendParams {
            client: reqwest::Client::new(),
            base_url: config.backend.base_url.clone(),
            api_key,
            model: config.backend.model.clone(),
            emit_normalized: config.stream.emit_normalized,
        },
        store.clone(),
        workspace.characters.clone(),
        bus.clone(),
    ));
    let controller = Arc::new(ChatController::new(
        store,
        backend,
        bus,
        TurnSettings::from(config),
    ));

    match (options.session, options.character) {
        (Some(session_id), _) => {
            controller.open_session(&session_id).await?;
            let character_id = controller
                .state()
                .read(|state| state.session.as_ref().map(|s| s.character_id.clone()))
                .unwrap_or_default();
            controller.load_character(workspace.characters.load(&character_id)?);
        }
        (None, Some(character_id)) => {
            let character = workspace.characters.load(&character_id)?;
            controller
                .start_session(character, "New chat", None, None)
                .await?;
        }
        (None, None) => {
            return Err("Pass --session <id> to resume or --character <id> to start".into());
        }
    }

    print_transcript(&controller.snapshot());
    let console = spawn_console(controller.subscribe());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_command(&line) {
            Ok(Some(ReplCommand::Quit)) => break,
            Ok(Some(command)) => {
                if let Err(err) = execute(&controller, command).await {
                    eprintln!("⚠️  {err}");
                }
            }
            Ok(None) => {}
            Err(usage) => eprintln!("{usage}"),
        }
    }

    console.abort();
    Ok(())
}
