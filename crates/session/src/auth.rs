//! Authentication state machine.
//!
//! A passive observer: it never talks to the backend, it only folds
//! [`AuthUpdate`] notifications into one current [`AuthSnapshot`].
//! The snapshot lives in a `watch` channel so readers always observe a
//! whole transition and can wait for the next one.

use tokio::sync::watch;
use tracing::{debug, info};

use crate::types::{AuthSnapshot, AuthState, AuthUpdate, LoginStrategy};

/// A notification that is not legal in the current state.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{update:?} not valid in state {state}")]
pub struct InvalidTransition {
    pub state: AuthState,
    pub update: AuthUpdate,
}

/// State change produced by [`AuthStateMachine::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: AuthState,
    pub to: AuthState,
}

impl Transition {
    /// Returns `true` if this transition moved into `state` from elsewhere.
    pub fn entered(&self, state: AuthState) -> bool {
        self.from != state && self.to == state
    }
}

/// Computes the state following `update`, or `None` if it is illegal.
///
/// The second factor is only reachable on the remote-confirmation path;
/// a direct secret either authorizes or is rejected.
pub fn next_state(
    strategy: LoginStrategy,
    current: AuthState,
    update: &AuthUpdate,
) -> Option<AuthState> {
    use AuthState as S;
    use AuthUpdate as U;

    match (current, update) {
        (S::Closed, _) => None,
        (S::LoggingOut, U::Closed | U::ConnectionLost) => Some(S::Closed),
        (S::LoggingOut, _) => None,

        (_, U::LoggingOut) => Some(S::LoggingOut),
        (_, U::Closed) => Some(S::Closed),
        (_, U::ConnectionLost) => Some(S::Uninitialized),

        (S::Uninitialized | S::AwaitingCredentials, U::WaitCredentials) => {
            Some(S::AwaitingCredentials)
        }
        (S::AwaitingCredentials | S::AwaitingPrimaryFactor(_), U::WaitPrimaryFactor) => {
            Some(S::AwaitingPrimaryFactor(strategy))
        }

        (S::AwaitingPrimaryFactor(LoginStrategy::RemoteConfirmation), U::ConfirmationIssued(_)) => {
            Some(current)
        }
        (
            S::AwaitingPrimaryFactor(LoginStrategy::RemoteConfirmation) | S::AwaitingSecondFactor,
            U::WaitSecondFactor { .. },
        ) => Some(S::AwaitingSecondFactor),

        (S::AwaitingPrimaryFactor(_) | S::AwaitingSecondFactor, U::Authorized) => Some(S::Ready),
        (S::AwaitingPrimaryFactor(_) | S::AwaitingSecondFactor, U::Rejected { .. }) => {
            Some(current)
        }

        _ => None,
    }
}

/// Tracks the authorization phase of one session.
pub struct AuthStateMachine {
    strategy: LoginStrategy,
    tx: watch::Sender<AuthSnapshot>,
}

impl AuthStateMachine {
    /// Creates a machine in [`AuthState::Uninitialized`].
    pub fn new(strategy: LoginStrategy) -> Self {
        let (tx, _rx) = watch::channel(AuthSnapshot::initial());
        Self { strategy, tx }
    }

    /// Login strategy this machine follows.
    pub fn strategy(&self) -> LoginStrategy {
        self.strategy
    }

    /// Current state.
    pub fn state(&self) -> AuthState {
        self.tx.borrow().state
    }

    /// Current snapshot (state plus artifacts).
    pub fn snapshot(&self) -> AuthSnapshot {
        self.tx.borrow().clone()
    }

    /// Subscribes to snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.tx.subscribe()
    }

    /// State `update` would lead to, without applying it.
    pub fn preview(&self, update: &AuthUpdate) -> Option<AuthState> {
        next_state(self.strategy, self.state(), update)
    }

    /// Folds one notification into the snapshot.
    pub fn apply(&self, update: AuthUpdate) -> Result<Transition, InvalidTransition> {
        let strategy = self.strategy;
        let mut outcome = None;

        self.tx.send_if_modified(|snap| {
            let from = snap.state;
            let Some(to) = next_state(strategy, from, &update) else {
                outcome = Some(Err(InvalidTransition {
                    state: from,
                    update: update.clone(),
                }));
                return false;
            };

            snap.state = to;
            match &update {
                AuthUpdate::ConfirmationIssued(token) => snap.confirmation = Some(token.clone()),
                AuthUpdate::Rejected { reason } => snap.last_rejection = Some(reason.clone()),
                AuthUpdate::WaitSecondFactor { hint } => {
                    snap.confirmation = None;
                    snap.second_factor_hint = hint.clone();
                }
                _ => {
                    if !matches!(to, AuthState::AwaitingPrimaryFactor(_)) {
                        snap.confirmation = None;
                    }
                    if to != AuthState::AwaitingSecondFactor {
                        snap.second_factor_hint = None;
                    }
                    if to == AuthState::Ready {
                        snap.last_rejection = None;
                    }
                }
            }

            outcome = Some(Ok(Transition { from, to }));
            true
        });

        let transition = outcome.unwrap_or_else(|| {
            // send_if_modified always runs the closure.
            Err(InvalidTransition {
                state: self.state(),
                update,
            })
        })?;

        if transition.from != transition.to {
            info!(from = %transition.from, to = %transition.to, "auth state changed");
        } else {
            debug!(state = %transition.to, "auth notification applied");
        }
        Ok(transition)
    }
}
