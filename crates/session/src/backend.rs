//! Transport seam between the session and a concrete messaging backend.
//!
//! [`BackendConnection`] is implemented once per backend (the Telegram Bot
//! API client, the in-memory backend used by tests). The session owns one
//! connection exclusively and never calls it concurrently.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::error::BackendError;
use crate::types::{AuthUpdate, ChannelId, Credentials, LoginStrategy, OutgoingPart, RemotePart};

/// Boxed future returned by every backend call.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send + 'a>>;

/// Channel on which a connection pushes unsolicited auth notifications
/// (out-of-band approval, connection loss).
pub type AuthUpdateSender = mpsc::UnboundedSender<AuthUpdate>;

/// One connection to the remote backend.
///
/// Handshake steps answer with the [`AuthUpdate`] the backend produced in
/// response. Transitions that happen later, without a request, go through
/// the [`AuthUpdateSender`] handed over in [`connect`](Self::connect).
pub trait BackendConnection: Send + Sync {
    /// Opens the connection. Usually answers [`AuthUpdate::WaitCredentials`].
    fn connect(&self, updates: AuthUpdateSender) -> BackendFuture<'_, AuthUpdate>;

    /// Presents the API identity for the chosen strategy.
    fn submit_credentials<'a>(
        &'a self,
        credentials: &'a Credentials,
        strategy: LoginStrategy,
    ) -> BackendFuture<'a, AuthUpdate>;

    /// Checks a secret credential synchronously (direct-secret strategy).
    fn check_secret<'a>(&'a self, secret: &'a str) -> BackendFuture<'a, AuthUpdate>;

    /// Asks for a confirmation token (remote-confirmation strategy).
    fn request_confirmation(&self) -> BackendFuture<'_, AuthUpdate>;

    /// Checks the second-factor password.
    fn check_second_factor<'a>(&'a self, password: &'a str) -> BackendFuture<'a, AuthUpdate>;

    /// Looks up an existing private self-channel.
    fn find_self_channel(&self) -> BackendFuture<'_, Option<ChannelId>>;

    /// Creates a private self-channel.
    fn create_self_channel(&self) -> BackendFuture<'_, ChannelId>;

    /// Posts one part to `channel`.
    fn send_part<'a>(
        &'a self,
        channel: &'a ChannelId,
        part: OutgoingPart,
    ) -> BackendFuture<'a, RemotePart>;

    /// Fetches the bytes of one posted part.
    fn fetch_part<'a>(
        &'a self,
        channel: &'a ChannelId,
        remote_id: &'a str,
    ) -> BackendFuture<'a, Vec<u8>>;

    /// Deletes one posted part.
    fn delete_part<'a>(&'a self, channel: &'a ChannelId, remote_id: &'a str)
    -> BackendFuture<'a, ()>;

    /// Revokes the authorization on the backend.
    fn log_out(&self) -> BackendFuture<'_, ()>;

    /// Drops the connection without logging out.
    fn close(&self) -> BackendFuture<'_, ()>;
}
