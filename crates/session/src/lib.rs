//! Backend session for the TeleDrive transfer engine.
//!
//! Owns the authenticated connection to the messaging backend used as
//! file storage:
//! - [`AuthStateMachine`] tracks the login handshake from notifications
//! - [`BackendSession`] drives the handshake and exposes the three remote
//!   primitives (upload, download, delete one part)
//! - [`BackendConnection`] is the seam concrete backends implement
//! - [`MemoryBackend`] is an in-memory backend for tests and dry runs

pub mod auth;
pub mod backend;
pub mod error;
pub mod memory;
mod pump;
pub mod session;
pub mod types;

pub use auth::{AuthStateMachine, InvalidTransition, Transition, next_state};
pub use backend::{AuthUpdateSender, BackendConnection, BackendFuture};
pub use error::{BackendError, SessionError};
pub use memory::MemoryBackend;
pub use session::BackendSession;
pub use types::{
    AuthSnapshot, AuthState, AuthUpdate, ChannelId, ConfirmationToken, Credentials,
    LoginStrategy, OutgoingPart, RemotePart, SessionConfig, SessionEvent,
};
