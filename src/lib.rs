//! Parlance is a terminal client for chatting with language-model characters.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the turn state machine, the chat controller that drives
//!   streaming turns and reconciles them with the session store, variant and
//!   scene selection, and the completion backend contract.
//! - [`api`] defines the chat-completions payloads used by the HTTP backend.
//! - [`cli`] parses arguments and runs the line-based chat loop.
//! - [`utils`] holds logging setup and test fixtures.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod utils;
