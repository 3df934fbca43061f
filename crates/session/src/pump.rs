//! Auth notification pump: applies updates the backend pushes on its own.

use std::sync::Weak;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::session::SessionInner;
use crate::types::AuthUpdate;

/// Forwards unsolicited notifications to the session until the backend
/// drops its sender or the session goes away.
pub(crate) async fn auth_pump(
    mut rx: mpsc::UnboundedReceiver<AuthUpdate>,
    session: Weak<SessionInner>,
) {
    while let Some(update) = rx.recv().await {
        let Some(inner) = session.upgrade() else {
            break;
        };
        trace!(?update, "auth notification from backend");
        inner.handle_update(update).await;
    }
    debug!("auth notification pump stopped");
}
