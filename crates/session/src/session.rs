//! Backend session shared by all transfers.
//!
//! A [`BackendSession`] owns exactly one [`BackendConnection`] and one
//! [`AuthStateMachine`]. Every remote call goes through a single lock, so
//! the connection never sees two requests at once. Transfer operations
//! log in lazily when the session is still uninitialized, which also
//! covers reconnecting after the backend dropped the connection.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::AuthStateMachine;
use crate::backend::{BackendConnection, BackendFuture};
use crate::error::{BackendError, SessionError};
use crate::pump::auth_pump;
use crate::types::{
    AuthSnapshot, AuthState, AuthUpdate, ChannelId, LoginStrategy, OutgoingPart, RemotePart,
    SessionConfig, SessionEvent,
};

const EVENT_CAPACITY: usize = 64;

pub(crate) struct SessionInner {
    config: SessionConfig,
    /// Held for the duration of every remote call.
    conn: Mutex<Box<dyn BackendConnection>>,
    auth: AuthStateMachine,
    destination: RwLock<Option<ChannelId>>,
    /// Serializes login, second factor and logout.
    handshake: Mutex<()>,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
}

/// Authenticated connection to the messaging backend.
///
/// Cheap to clone; clones share the connection and its state.
#[derive(Clone)]
pub struct BackendSession {
    inner: Arc<SessionInner>,
}

impl BackendSession {
    /// Creates a session in [`AuthState::Uninitialized`]. Nothing is sent
    /// to the backend until [`login`](Self::login) or the first transfer.
    pub fn new(config: SessionConfig, connection: Box<dyn BackendConnection>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let auth = AuthStateMachine::new(config.login_strategy);
        let destination = RwLock::new(config.destination.clone());

        Self {
            inner: Arc::new(SessionInner {
                config,
                conn: Mutex::new(connection),
                auth,
                destination,
                handshake: Mutex::new(()),
                pump: std::sync::Mutex::new(None),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Current auth state.
    pub fn state(&self) -> AuthState {
        self.inner.auth.state()
    }

    /// Current auth state with its artifacts (confirmation token, hint).
    pub fn snapshot(&self) -> AuthSnapshot {
        self.inner.auth.snapshot()
    }

    /// Subscribes to auth snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.inner.auth.subscribe()
    }

    /// Takes the event receiver. Can only be called once.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.inner.events_rx.lock().await.take()
    }

    /// Channel parts are posted to, once resolved.
    pub fn destination(&self) -> Option<ChannelId> {
        self.inner.destination()
    }

    /// Drives the handshake as far as it can go without a human.
    ///
    /// Returns the state reached: [`AuthState::Ready`] on the direct-secret
    /// path, or [`AuthState::AwaitingPrimaryFactor`] with a confirmation
    /// token in the snapshot on the remote-confirmation path.
    pub async fn login(&self) -> Result<AuthState, SessionError> {
        let _handshake = self.inner.handshake.lock().await;
        let inner = &self.inner;

        let state = inner.auth.state();
        if state.is_ready() {
            return Ok(state);
        }
        if state.is_terminal() {
            return Err(SessionError::NotReady(state));
        }
        inner.check_credentials()?;

        if inner.auth.state() == AuthState::Uninitialized {
            inner.open().await?;
        }

        if inner.auth.state() == AuthState::AwaitingCredentials {
            let update = {
                let conn = inner.conn.lock().await;
                let update = conn
                    .submit_credentials(&inner.config.credentials, inner.config.login_strategy)
                    .await?;
                update
            };
            inner.handle_update(update).await;
        }

        if let AuthState::AwaitingPrimaryFactor(strategy) = inner.auth.state() {
            let update = match strategy {
                LoginStrategy::DirectSecret => {
                    let secret = inner
                        .config
                        .credentials
                        .bot_token
                        .as_deref()
                        .ok_or(SessionError::MissingCredential("bot_token"))?;
                    let conn = inner.conn.lock().await;
                    let update = conn.check_secret(secret).await?;
                    Some(update)
                }
                LoginStrategy::RemoteConfirmation if inner.auth.snapshot().confirmation.is_none() => {
                    let conn = inner.conn.lock().await;
                    let update = conn.request_confirmation().await?;
                    Some(update)
                }
                LoginStrategy::RemoteConfirmation => None,
            };

            if let Some(update) = update {
                let rejection = rejection_reason(&update);
                inner.handle_update(update).await;
                if let Some(reason) = rejection {
                    warn!(%reason, "login rejected");
                    return Err(SessionError::AuthRejected(reason));
                }
            }
        }

        let state = inner.auth.state();
        if state.is_ready() {
            info!(destination = ?inner.destination(), "session ready");
        }
        Ok(state)
    }

    /// Submits the second-factor password.
    ///
    /// Only valid in [`AuthState::AwaitingSecondFactor`].
    pub async fn submit_second_factor(&self, password: &str) -> Result<AuthState, SessionError> {
        let _handshake = self.inner.handshake.lock().await;

        let state = self.state();
        if state != AuthState::AwaitingSecondFactor {
            return Err(SessionError::WrongState(state));
        }

        let update = {
            let conn = self.inner.conn.lock().await;
            let update = conn.check_second_factor(password).await?;
            update
        };
        let rejection = rejection_reason(&update);
        self.inner.handle_update(update).await;
        if let Some(reason) = rejection {
            return Err(SessionError::AuthRejected(reason));
        }
        Ok(self.state())
    }

    /// Waits until the session is ready, e.g. for an out-of-band approval.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), SessionError> {
        let mut rx = self.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| s.state.is_ready() || s.state.is_terminal())
                .await
                .map(|s| s.state)
        })
        .await;

        match waited {
            Ok(Ok(state)) if state.is_ready() => Ok(()),
            Ok(Ok(state)) => Err(SessionError::NotReady(state)),
            Ok(Err(_)) => Err(SessionError::NotReady(self.state())),
            Err(_) => Err(SessionError::AuthTimeout(self.state())),
        }
    }

    /// Posts one part to the destination channel.
    ///
    /// `limit` bounds the backend call alone. Time spent logging in or
    /// queued behind other transfers for the connection does not count.
    pub async fn upload_part(
        &self,
        part: OutgoingPart,
        limit: Option<Duration>,
    ) -> Result<RemotePart, SessionError> {
        let channel = self.ensure_ready().await?;
        let index = part.index;
        let conn = self.inner.conn.lock().await;
        let result = bounded(limit, conn.send_part(&channel, part)).await;
        drop(conn);

        if let Err(BackendError::Timeout) = &result {
            warn!(
                part = index,
                %channel,
                "send timed out, the backend may still have stored the part"
            );
        }
        Ok(result?)
    }

    /// Fetches the bytes of a posted part. `limit` bounds the backend call.
    pub async fn download_part(
        &self,
        remote_id: &str,
        limit: Option<Duration>,
    ) -> Result<Vec<u8>, SessionError> {
        let channel = self.ensure_ready().await?;
        let conn = self.inner.conn.lock().await;
        let data = bounded(limit, conn.fetch_part(&channel, remote_id)).await?;
        Ok(data)
    }

    /// Deletes a posted part. `limit` bounds the backend call.
    pub async fn delete_part(
        &self,
        remote_id: &str,
        limit: Option<Duration>,
    ) -> Result<(), SessionError> {
        let channel = self.ensure_ready().await?;
        let conn = self.inner.conn.lock().await;
        bounded(limit, conn.delete_part(&channel, remote_id)).await?;
        Ok(())
    }

    /// Revokes the authorization and closes the session for good.
    ///
    /// The session ends up [`AuthState::Closed`] even if the backend
    /// refused the logout; that error is still returned.
    pub async fn logout(&self) -> Result<(), SessionError> {
        let _handshake = self.inner.handshake.lock().await;

        let state = self.state();
        if state.is_terminal() {
            return Ok(());
        }

        self.inner.handle_update(AuthUpdate::LoggingOut).await;
        let result = if state == AuthState::Uninitialized {
            Ok(())
        } else {
            let conn = self.inner.conn.lock().await;
            let result = conn.log_out().await;
            result
        };
        if let Err(e) = &result {
            warn!(error = %e, "backend logout failed");
        }

        self.inner.handle_update(AuthUpdate::Closed).await;
        self.inner.stop_pump();
        info!("session logged out");
        result.map_err(SessionError::from)
    }

    /// Drops the connection without revoking the authorization.
    pub async fn shutdown(&self) {
        let state = self.state();
        if state == AuthState::Closed {
            return;
        }
        if state != AuthState::Uninitialized {
            let conn = self.inner.conn.lock().await;
            if let Err(e) = conn.close().await {
                debug!(error = %e, "error while closing backend connection");
            }
        }
        self.inner.handle_update(AuthUpdate::Closed).await;
        self.inner.stop_pump();
    }

    /// Resolves the destination channel, logging in first if the
    /// session was never connected or lost its connection.
    async fn ensure_ready(&self) -> Result<ChannelId, SessionError> {
        if self.state() == AuthState::Uninitialized {
            debug!("session not connected, logging in");
            if let Err(e @ SessionError::Backend(_)) = self.login().await {
                return Err(e);
            }
        }

        let state = self.state();
        if !state.is_ready() {
            return Err(SessionError::NotReady(state));
        }
        self.destination()
            .ok_or(SessionError::Backend(BackendError::MissingDestination))
    }
}

impl SessionInner {
    fn destination(&self) -> Option<ChannelId> {
        self.destination.read().unwrap().clone()
    }

    fn check_credentials(&self) -> Result<(), SessionError> {
        let creds = &self.config.credentials;
        match self.config.login_strategy {
            LoginStrategy::DirectSecret => {
                if creds.bot_token.as_deref().is_none_or(str::is_empty) {
                    return Err(SessionError::MissingCredential("bot_token"));
                }
            }
            LoginStrategy::RemoteConfirmation => {
                if creds.api_id == 0 {
                    return Err(SessionError::MissingCredential("api_id"));
                }
                if creds.api_hash.is_empty() {
                    return Err(SessionError::MissingCredential("api_hash"));
                }
            }
        }
        Ok(())
    }

    /// Connects the backend and starts a fresh notification pump.
    async fn open(self: &Arc<Self>) -> Result<(), SessionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(auth_pump(rx, Arc::downgrade(self)));
        if let Some(old) = self.pump.lock().unwrap().replace(handle) {
            old.abort();
        }

        let update = {
            let conn = self.conn.lock().await;
            let update = conn.connect(tx).await?;
            update
        };
        self.handle_update(update).await;
        Ok(())
    }

    fn stop_pump(&self) {
        if let Some(handle) = self.pump.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Folds one notification into the state machine.
    ///
    /// The destination channel is provisioned before `Ready` is published,
    /// so a ready session always has somewhere to post parts unless
    /// provisioning failed.
    pub(crate) async fn handle_update(&self, update: AuthUpdate) {
        if self.auth.preview(&update) == Some(AuthState::Ready) && !self.auth.state().is_ready() {
            self.provision_destination().await;
        }

        let token = match &update {
            AuthUpdate::ConfirmationIssued(token) => Some(token.clone()),
            _ => None,
        };

        match self.auth.apply(update) {
            Ok(transition) => {
                if transition.entered(AuthState::Uninitialized) {
                    warn!("backend connection lost, next transfer reconnects");
                }
                if transition.from != transition.to {
                    self.emit(SessionEvent::StateChanged {
                        from: transition.from,
                        to: transition.to,
                    });
                }
                if let Some(token) = token {
                    self.emit(SessionEvent::ConfirmationIssued(token));
                }
            }
            Err(e) => warn!(error = %e, "ignoring auth notification"),
        }
    }

    async fn provision_destination(&self) {
        if let Some(channel) = self.destination() {
            debug!(%channel, "reusing destination channel");
            return;
        }

        let conn = self.conn.lock().await;
        let found = match conn.find_self_channel().await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "self-channel lookup failed");
                None
            }
        };
        let channel = match found {
            Some(channel) => {
                debug!(%channel, "found existing self-channel");
                channel
            }
            None => match conn.create_self_channel().await {
                Ok(channel) => {
                    info!(%channel, "created self-channel");
                    channel
                }
                Err(e) => {
                    warn!(error = %e, "could not provision destination channel");
                    return;
                }
            },
        };
        drop(conn);

        *self.destination.write().unwrap() = Some(channel.clone());
        self.emit(SessionEvent::DestinationReady(channel));
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            debug!(error = %e, "session event dropped");
        }
    }
}

async fn bounded<T>(limit: Option<Duration>, call: BackendFuture<'_, T>) -> Result<T, BackendError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .unwrap_or(Err(BackendError::Timeout)),
        None => call.await,
    }
}

fn rejection_reason(update: &AuthUpdate) -> Option<String> {
    match update {
        AuthUpdate::Rejected { reason } => Some(reason.clone()),
        _ => None,
    }
}
