//! In-memory backend.
//!
//! Stores posted parts in a map and answers the login handshake like the
//! real backend would. Failures, latency and out-of-band approvals can be
//! scripted, which makes it the test double for the transfer pipelines
//! as well as a dry-run target for the CLI.
//!
//! Clones share state: keep one clone to inspect and script the backend
//! after handing another to a [`BackendSession`](crate::BackendSession).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use crate::backend::{AuthUpdateSender, BackendConnection, BackendFuture};
use crate::error::BackendError;
use crate::types::{
    AuthUpdate, ChannelId, ConfirmationToken, Credentials, LoginStrategy, OutgoingPart,
    RemotePart,
};

/// Fault count meaning "every call from now on".
pub const ALWAYS: usize = usize::MAX;

/// How long issued confirmation tokens claim to stay valid.
const CONFIRMATION_TTL: Duration = Duration::from_secs(30);

/// A part as stored by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPart {
    pub channel: ChannelId,
    pub index: u32,
    pub file_name: String,
    pub caption: Option<String>,
    pub data: Vec<u8>,
}

/// Number of calls received per primitive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub connect: usize,
    pub send: usize,
    pub fetch: usize,
    pub delete: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum FaultTarget {
    Connect,
    CreateChannel,
    Send(u32),
    Fetch(String),
    FetchAny,
    Delete(String),
}

struct Fault {
    target: FaultTarget,
    error: BackendError,
    remaining: usize,
}

#[derive(Default)]
struct MemoryState {
    valid_secret: Option<String>,
    second_factor: Option<(String, Option<String>)>,
    channels: Vec<ChannelId>,
    parts: HashMap<String, StoredPart>,
    next_id: u64,
    updates: Option<AuthUpdateSender>,
    connected: bool,
    faults: Vec<Fault>,
    corruptions: HashMap<String, usize>,
    latency: Option<Duration>,
    calls: CallCounts,
}

impl MemoryState {
    fn take_fault(&mut self, target: &FaultTarget) -> Option<BackendError> {
        let fault = self
            .faults
            .iter_mut()
            .find(|f| f.remaining > 0 && &f.target == target)?;
        if fault.remaining != ALWAYS {
            fault.remaining -= 1;
        }
        Some(fault.error.clone())
    }

    fn ensure_connected(&self) -> Result<(), BackendError> {
        if self.connected {
            Ok(())
        } else {
            Err(BackendError::Closed)
        }
    }
}

/// In-memory messaging backend.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    /// Creates an empty backend that rejects every secret.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts `secret` on the direct-secret path.
    pub fn with_secret(self, secret: impl Into<String>) -> Self {
        self.lock().valid_secret = Some(secret.into());
        self
    }

    /// Requires a second-factor `password` after remote confirmation.
    pub fn with_second_factor(self, password: impl Into<String>, hint: Option<&str>) -> Self {
        self.lock().second_factor = Some((password.into(), hint.map(str::to_string)));
        self
    }

    /// Registers an existing channel parts may be posted to.
    pub fn with_channel(self, channel: ChannelId) -> Self {
        self.lock().channels.push(channel);
        self
    }

    /// Delays every send and fetch by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = Some(latency);
        self
    }

    /// Fails the next `times` connection attempts with `error`.
    pub fn fail_connect(&self, error: BackendError, times: usize) {
        self.push_fault(FaultTarget::Connect, error, times);
    }

    /// Fails the next `times` self-channel creations with `error`.
    pub fn fail_create_channel(&self, error: BackendError, times: usize) {
        self.push_fault(FaultTarget::CreateChannel, error, times);
    }

    /// Fails the next `times` uploads of part `index` with `error`.
    pub fn fail_send(&self, index: u32, error: BackendError, times: usize) {
        self.push_fault(FaultTarget::Send(index), error, times);
    }

    /// Fails the next `times` fetches of `remote_id` with `error`.
    pub fn fail_fetch(&self, remote_id: &str, error: BackendError, times: usize) {
        self.push_fault(FaultTarget::Fetch(remote_id.to_string()), error, times);
    }

    /// Fails the next `times` fetches of any part with `error`.
    pub fn fail_every_fetch(&self, error: BackendError, times: usize) {
        self.push_fault(FaultTarget::FetchAny, error, times);
    }

    /// Fails the next `times` deletions of `remote_id` with `error`.
    pub fn fail_delete(&self, remote_id: &str, error: BackendError, times: usize) {
        self.push_fault(FaultTarget::Delete(remote_id.to_string()), error, times);
    }

    /// Returns damaged bytes for the next `times` fetches of `remote_id`.
    pub fn corrupt_fetch(&self, remote_id: &str, times: usize) {
        self.lock().corruptions.insert(remote_id.to_string(), times);
    }

    /// Simulates the operator approving the confirmation token.
    ///
    /// Returns `false` if no connection is listening.
    pub fn approve_confirmation(&self) -> bool {
        let s = self.lock();
        let update = match &s.second_factor {
            Some((_, hint)) => AuthUpdate::WaitSecondFactor { hint: hint.clone() },
            None => AuthUpdate::Authorized,
        };
        s.updates
            .as_ref()
            .is_some_and(|tx| tx.send(update).is_ok())
    }

    /// Simulates the backend dropping the connection.
    pub fn drop_connection(&self) {
        let mut s = self.lock();
        s.connected = false;
        if let Some(tx) = s.updates.take() {
            let _ = tx.send(AuthUpdate::ConnectionLost);
        }
    }

    /// Removes a stored part behind the session's back.
    pub fn remove_part(&self, remote_id: &str) -> Option<StoredPart> {
        self.lock().parts.remove(remote_id)
    }

    /// Number of stored parts.
    pub fn part_count(&self) -> usize {
        self.lock().parts.len()
    }

    /// Stored parts keyed by remote identifier.
    pub fn parts(&self) -> HashMap<String, StoredPart> {
        self.lock().parts.clone()
    }

    /// A single stored part.
    pub fn part(&self, remote_id: &str) -> Option<StoredPart> {
        self.lock().parts.get(remote_id).cloned()
    }

    /// Channels known to the backend, in creation order.
    pub fn channels(&self) -> Vec<ChannelId> {
        self.lock().channels.clone()
    }

    /// Calls received so far.
    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    /// Returns `true` while a session is connected.
    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn push_fault(&self, target: FaultTarget, error: BackendError, times: usize) {
        self.lock().faults.push(Fault {
            target,
            error,
            remaining: times,
        });
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }

    fn latency(&self) -> Option<Duration> {
        self.lock().latency
    }
}

impl BackendConnection for MemoryBackend {
    fn connect(&self, updates: AuthUpdateSender) -> BackendFuture<'_, AuthUpdate> {
        Box::pin(async move {
            let mut s = self.lock();
            s.calls.connect += 1;
            if let Some(err) = s.take_fault(&FaultTarget::Connect) {
                return Err(err);
            }
            s.connected = true;
            s.updates = Some(updates);
            debug!("memory backend connected");
            Ok(AuthUpdate::WaitCredentials)
        })
    }

    fn submit_credentials<'a>(
        &'a self,
        _credentials: &'a Credentials,
        _strategy: LoginStrategy,
    ) -> BackendFuture<'a, AuthUpdate> {
        Box::pin(async move {
            self.lock().ensure_connected()?;
            Ok(AuthUpdate::WaitPrimaryFactor)
        })
    }

    fn check_secret<'a>(&'a self, secret: &'a str) -> BackendFuture<'a, AuthUpdate> {
        Box::pin(async move {
            let s = self.lock();
            s.ensure_connected()?;
            if s.valid_secret.as_deref() == Some(secret) {
                Ok(AuthUpdate::Authorized)
            } else {
                Ok(AuthUpdate::Rejected {
                    reason: "invalid secret".into(),
                })
            }
        })
    }

    fn request_confirmation(&self) -> BackendFuture<'_, AuthUpdate> {
        Box::pin(async move {
            self.lock().ensure_connected()?;
            Ok(AuthUpdate::ConfirmationIssued(ConfirmationToken {
                url: format!("tg://login?token={}", uuid::Uuid::new_v4().simple()),
                expires_in: Some(CONFIRMATION_TTL),
            }))
        })
    }

    fn check_second_factor<'a>(&'a self, password: &'a str) -> BackendFuture<'a, AuthUpdate> {
        Box::pin(async move {
            let s = self.lock();
            s.ensure_connected()?;
            match &s.second_factor {
                Some((expected, _)) if expected == password => Ok(AuthUpdate::Authorized),
                _ => Ok(AuthUpdate::Rejected {
                    reason: "invalid password".into(),
                }),
            }
        })
    }

    fn find_self_channel(&self) -> BackendFuture<'_, Option<ChannelId>> {
        Box::pin(async move {
            let s = self.lock();
            s.ensure_connected()?;
            Ok(s.channels.first().cloned())
        })
    }

    fn create_self_channel(&self) -> BackendFuture<'_, ChannelId> {
        Box::pin(async move {
            let mut s = self.lock();
            s.ensure_connected()?;
            if let Some(err) = s.take_fault(&FaultTarget::CreateChannel) {
                return Err(err);
            }
            let channel = ChannelId(format!("self-{}", s.channels.len() + 1));
            s.channels.push(channel.clone());
            Ok(channel)
        })
    }

    fn send_part<'a>(
        &'a self,
        channel: &'a ChannelId,
        part: OutgoingPart,
    ) -> BackendFuture<'a, RemotePart> {
        Box::pin(async move {
            self.lock().calls.send += 1;
            if let Some(latency) = self.latency() {
                tokio::time::sleep(latency).await;
            }

            let mut s = self.lock();
            s.ensure_connected()?;
            if let Some(err) = s.take_fault(&FaultTarget::Send(part.index)) {
                return Err(err);
            }
            if !s.channels.contains(channel) {
                return Err(BackendError::MissingDestination);
            }

            s.next_id += 1;
            let remote_id = format!("msg-{}", s.next_id);
            let size = part.data.len() as u64;
            s.parts.insert(
                remote_id.clone(),
                StoredPart {
                    channel: channel.clone(),
                    index: part.index,
                    file_name: part.file_name,
                    caption: part.caption,
                    data: part.data,
                },
            );
            Ok(RemotePart { remote_id, size })
        })
    }

    fn fetch_part<'a>(
        &'a self,
        _channel: &'a ChannelId,
        remote_id: &'a str,
    ) -> BackendFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.lock().calls.fetch += 1;
            if let Some(latency) = self.latency() {
                tokio::time::sleep(latency).await;
            }

            let mut s = self.lock();
            s.ensure_connected()?;
            if let Some(err) = s
                .take_fault(&FaultTarget::Fetch(remote_id.to_string()))
                .or_else(|| s.take_fault(&FaultTarget::FetchAny))
            {
                return Err(err);
            }

            let mut data = s
                .parts
                .get(remote_id)
                .map(|p| p.data.clone())
                .ok_or_else(|| BackendError::NotFound(remote_id.to_string()))?;

            if let Some(remaining) = s.corruptions.get_mut(remote_id)
                && *remaining > 0
            {
                if *remaining != ALWAYS {
                    *remaining -= 1;
                }
                match data.first_mut() {
                    Some(byte) => *byte ^= 0xFF,
                    None => data.push(0),
                }
            }
            Ok(data)
        })
    }

    fn delete_part<'a>(
        &'a self,
        _channel: &'a ChannelId,
        remote_id: &'a str,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let mut s = self.lock();
            s.calls.delete += 1;
            s.ensure_connected()?;
            if let Some(err) = s.take_fault(&FaultTarget::Delete(remote_id.to_string())) {
                return Err(err);
            }
            s.parts
                .remove(remote_id)
                .map(|_| ())
                .ok_or_else(|| BackendError::NotFound(remote_id.to_string()))
        })
    }

    fn log_out(&self) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            let mut s = self.lock();
            s.connected = false;
            s.updates = None;
            Ok(())
        })
    }

    fn close(&self) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            let mut s = self.lock();
            s.connected = false;
            s.updates = None;
            Ok(())
        })
    }
}
