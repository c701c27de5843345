//! Plain-terminal rendering of controller state.
//!
//! The chat loop renders by diffing successive `watch` revisions, so streamed
//! text appears as it is flushed without the loop knowing about frames.

use std::io::Write;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::app::TurnState;
use crate::core::message::{Message, Role, TranscriptEntry};

#[derive(Debug, Default)]
pub struct ConsoleObserver {
    request_id: Option<String>,
    printed: usize,
    last_error: Option<String>,
}

impl ConsoleObserver {
    /// Text to print for this revision; empty when nothing visible changed.
    pub fn observe(&mut self, state: &TurnState) -> String {
        let mut out = String::new();

        match &state.active_request {
            Some(request) => {
                if self.request_id.as_deref() != Some(request.request_id.as_str()) {
                    self.request_id = Some(request.request_id.clone());
                    self.printed = 0;
                    let speaker = state
                        .character
                        .as_ref()
                        .map_or("Assistant", |character| character.name.as_str());
                    out.push_str(&format!("{speaker}: "));
                }
                let streamed = request
                    .targets
                    .last()
                    .and_then(|target| state.entry(target))
                    .map(TranscriptEntry::display_content);
                if let Some(text) = streamed {
                    self.append_suffix(text, &mut out);
                }
            }
            None => {
                if self.request_id.take().is_some() {
                    // Reconciliation can carry text that never streamed.
                    if let Some(entry) = state
                        .last_entry()
                        .filter(|entry| entry.role() == Role::Assistant)
                    {
                        self.append_suffix(entry.display_content(), &mut out);
                    }
                    out.push('\n');
                    self.printed = 0;
                }
            }
        }

        if state.error != self.last_error {
            if let Some(error) = &state.error {
                out.push_str(&format!("⚠️  {error}\n"));
            }
            self.last_error = state.error.clone();
        }
        out
    }

    fn append_suffix(&mut self, text: &str, out: &mut String) {
        if text.len() > self.printed && text.is_char_boundary(self.printed) {
            out.push_str(&text[self.printed..]);
            self.printed = text.len();
        }
    }
}

/// Print streamed output until the state channel closes.
pub fn spawn_console(mut rx: watch::Receiver<TurnState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut observer = ConsoleObserver::default();
        while rx.changed().await.is_ok() {
            let chunk = {
                let state = rx.borrow_and_update();
                observer.observe(&state)
            };
            if !chunk.is_empty() {
                print!("{chunk}");
                let _ = std::io::stdout().flush();
            }
        }
    })
}

pub fn format_transcript_line(index: usize, message: &Message) -> String {
    let mut markers = String::new();
    if message.is_pinned {
        markers.push_str(" 📌");
    }
    if let Some(current) = message.current_variant_index() {
        markers.push_str(&format!(" [{}/{}]", current + 1, message.variants.len()));
    }
    format!(
        "{index:>3}. {}{markers}: {}",
        message.role.as_str(),
        message.display_content()
    )
}

pub fn print_transcript(state: &TurnState) {
    for (index, entry) in state.transcript.iter().enumerate() {
        match entry {
            TranscriptEntry::Persisted(message) => {
                println!("{}", format_transcript_line(index + 1, message))
            }
            TranscriptEntry::Placeholder(placeholder) => println!(
                "{:>3}. {} (pending): {}",
                index + 1,
                placeholder.role.as_str(),
                placeholder.content
            ),
        }
    }
}
