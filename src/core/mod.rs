pub mod app;
pub mod backend;
pub mod batcher;
pub mod character;
pub mod chat_stream;
pub mod config;
pub mod ids;
pub mod message;
pub mod store;
pub mod stream_bus;
