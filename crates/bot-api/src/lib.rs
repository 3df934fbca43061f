//! Telegram Bot API backend for the TeleDrive transfer engine.
//!
//! Parts are posted as documents to a configured channel. A part id has
//! the form `"{message_id}:{file_id}"`: the message id deletes the part,
//! the file id downloads it.

pub mod client;
pub mod connection;
pub mod types;

#[cfg(test)]
mod mock_server;

pub use client::{Client, Error};
pub use connection::BotConnection;
pub use types::{ApiResponse, Document, File, Message, ResponseParameters, User};
