//! Public types for the backend session.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Login strategy selected when a session is created.
///
/// Only one strategy is attempted per session. Falling back to another
/// strategy means building a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoginStrategy {
    /// The backend issues a token that a human approves out of band.
    RemoteConfirmation,
    /// A secret credential (bot token) is checked synchronously.
    DirectSecret,
}

impl fmt::Display for LoginStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteConfirmation => f.write_str("remote-confirmation"),
            Self::DirectSecret => f.write_str("direct-secret"),
        }
    }
}

/// Authorization phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// No connection has been established yet (or it was lost).
    Uninitialized,
    /// Connected; the backend wants the API identity.
    AwaitingCredentials,
    /// Waiting for the primary factor of the given login strategy.
    AwaitingPrimaryFactor(LoginStrategy),
    /// Waiting for the second-factor password.
    AwaitingSecondFactor,
    /// Authorized and able to serve transfers.
    Ready,
    /// Logout in progress. Absorbing.
    LoggingOut,
    /// Session torn down. Absorbing.
    Closed,
}

impl AuthState {
    /// Returns `true` if transfer operations may proceed.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Returns `true` for the absorbing states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LoggingOut | Self::Closed)
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => f.write_str("uninitialized"),
            Self::AwaitingCredentials => f.write_str("awaiting-credentials"),
            Self::AwaitingPrimaryFactor(strategy) => {
                write!(f, "awaiting-primary-factor ({strategy})")
            }
            Self::AwaitingSecondFactor => f.write_str("awaiting-second-factor"),
            Self::Ready => f.write_str("ready"),
            Self::LoggingOut => f.write_str("logging-out"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

/// Verification artifact a human must approve for remote-confirmation logins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationToken {
    /// Link or code to present to the operator (e.g. rendered as a QR code).
    pub url: String,
    /// How long the backend keeps the token valid, if known.
    pub expires_in: Option<Duration>,
}

/// Notifications from a [`BackendConnection`](crate::backend::BackendConnection)
/// that drive the authentication state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthUpdate {
    WaitCredentials,
    WaitPrimaryFactor,
    /// A fresh confirmation token replaces any previous one.
    ConfirmationIssued(ConfirmationToken),
    WaitSecondFactor { hint: Option<String> },
    Authorized,
    /// The last submitted factor was refused. The state does not change.
    Rejected { reason: String },
    ConnectionLost,
    LoggingOut,
    Closed,
}

/// Consistent view of the state machine.
///
/// Published atomically, so a reader never sees a state paired with the
/// artifacts of another.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthSnapshot {
    pub state: AuthState,
    /// Latest confirmation token, only while awaiting remote confirmation.
    pub confirmation: Option<ConfirmationToken>,
    /// Password hint, only while awaiting the second factor.
    pub second_factor_hint: Option<String>,
    /// Reason of the most recent rejection since the last successful login.
    pub last_rejection: Option<String>,
}

impl AuthSnapshot {
    pub(crate) fn initial() -> Self {
        Self {
            state: AuthState::Uninitialized,
            confirmation: None,
            second_factor_hint: None,
            last_rejection: None,
        }
    }
}

/// Event emitted by a session for UIs and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The auth state moved from one state to another.
    StateChanged { from: AuthState, to: AuthState },
    /// A confirmation token must be shown to the operator.
    ConfirmationIssued(ConfirmationToken),
    /// The destination channel was resolved.
    DestinationReady(ChannelId),
}

/// Identifier of the channel parts are posted to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// API identity and secrets used during login.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub api_id: i32,
    #[serde(default)]
    pub api_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
}

// Secrets stay out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_id", &self.api_id)
            .field("api_hash", &redact(&self.api_hash))
            .field("phone", &self.phone)
            .field("bot_token", &self.bot_token.as_deref().map(redact))
            .finish()
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() { "" } else { "***" }
}

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub login_strategy: LoginStrategy,
    /// Channel to post parts to. When absent a private self-channel is
    /// looked up or created once the session becomes ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<ChannelId>,
    #[serde(default)]
    pub credentials: Credentials,
}

impl SessionConfig {
    /// Direct-secret configuration with a bot token.
    pub fn direct_secret(bot_token: impl Into<String>) -> Self {
        Self {
            login_strategy: LoginStrategy::DirectSecret,
            credentials: Credentials {
                bot_token: Some(bot_token.into()),
                ..Credentials::default()
            },
            destination: None,
        }
    }

    /// Remote-confirmation configuration with an API identity.
    pub fn remote_confirmation(api_id: i32, api_hash: impl Into<String>) -> Self {
        Self {
            login_strategy: LoginStrategy::RemoteConfirmation,
            credentials: Credentials {
                api_id,
                api_hash: api_hash.into(),
                ..Credentials::default()
            },
            destination: None,
        }
    }

    /// Sets a fixed destination channel.
    pub fn with_destination(mut self, channel: ChannelId) -> Self {
        self.destination = Some(channel);
        self
    }
}

/// One part as handed to the backend.
#[derive(Debug, Clone)]
pub struct OutgoingPart {
    /// 0-based sequence index within the logical file.
    pub index: u32,
    /// File name the part is posted under.
    pub file_name: String,
    pub caption: Option<String>,
    pub data: Vec<u8>,
}

/// Backend acknowledgement of a stored part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePart {
    /// Opaque identifier used to fetch or delete the part later.
    pub remote_id: String,
    /// Byte length the backend reports having stored.
    pub size: u64,
}
