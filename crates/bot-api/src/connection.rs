//! [`BackendConnection`] over the Bot API.
//!
//! Bots log in with their token alone, so only the direct-secret strategy
//! is supported. A bot cannot create chats either: the destination channel
//! must be configured and the bot must be allowed to post in it.

use std::sync::{Mutex, RwLock};
use std::time::Duration;

use teledrive_session::{
    AuthUpdate, AuthUpdateSender, BackendConnection, BackendError, BackendFuture, ChannelId,
    Credentials, LoginStrategy, OutgoingPart, RemotePart,
};
use tracing::{debug, info, warn};

use crate::client::{Client, DEFAULT_BASE_URL, Error};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

impl From<Error> for BackendError {
    fn from(e: Error) -> Self {
        match e {
            Error::Http(e) if e.is_timeout() => BackendError::Timeout,
            Error::Http(e) => BackendError::Network(e.to_string()),
            Error::Api {
                status: 429,
                retry_after,
                ..
            } => BackendError::RateLimited {
                retry_after: retry_after.map(Duration::from_secs),
            },
            Error::Api {
                status: code @ 500..=599,
                description,
                ..
            } => BackendError::Server {
                code,
                message: description,
            },
            Error::Api { status: 401, .. } | Error::InvalidToken => BackendError::CredentialRevoked,
            Error::Api {
                status: 400,
                description,
                ..
            } if description.to_ascii_lowercase().contains("chat not found") => {
                BackendError::MissingDestination
            }
            Error::Api {
                status: 400 | 404,
                description,
                ..
            } if description.to_ascii_lowercase().contains("not found") => {
                BackendError::NotFound(description)
            }
            Error::Api {
                status,
                description,
                ..
            } => BackendError::Rejected {
                code: status,
                message: description,
            },
            Error::Json(e) => BackendError::Network(format!("malformed response: {e}")),
            Error::UnexpectedResponse(message) => BackendError::Rejected { code: 200, message },
        }
    }
}

/// Splits a remote part id into its message id and file id.
fn parse_remote_id(remote_id: &str) -> Result<(i64, &str), BackendError> {
    remote_id
        .split_once(':')
        .and_then(|(message_id, file_id)| {
            let message_id = message_id.parse().ok()?;
            (!file_id.is_empty()).then_some((message_id, file_id))
        })
        .ok_or_else(|| BackendError::NotFound(format!("malformed part id {remote_id:?}")))
}

/// Connection to the Telegram Bot API.
pub struct BotConnection {
    http: reqwest::Client,
    base_url: String,
    client: RwLock<Option<Client>>,
    updates: Mutex<Option<AuthUpdateSender>>,
}

impl BotConnection {
    /// Creates a connection to the public Bot API server.
    pub fn new() -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            client: RwLock::new(None),
            updates: Mutex::new(None),
        })
    }

    /// Targets another Bot API server, such as a self-hosted one.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Returns the authorized client, or `Closed` before a successful login.
    fn client(&self) -> Result<Client, BackendError> {
        self.client
            .read()
            .unwrap()
            .clone()
            .ok_or(BackendError::Closed)
    }

    /// Maps a client error, dropping the login when the token was revoked.
    fn check<T>(&self, result: Result<T, Error>) -> Result<T, BackendError> {
        result.map_err(|e| {
            let e = BackendError::from(e);
            if e == BackendError::CredentialRevoked {
                self.revoke();
            }
            e
        })
    }

    /// Forgets the token and tells the session the authorization is gone.
    fn revoke(&self) {
        warn!("bot token revoked");
        *self.client.write().unwrap() = None;
        if let Some(updates) = self.updates.lock().unwrap().as_ref() {
            let _ = updates.send(AuthUpdate::ConnectionLost);
        }
    }

    fn disconnect(&self) {
        *self.client.write().unwrap() = None;
        self.updates.lock().unwrap().take();
    }
}

impl BackendConnection for BotConnection {
    fn connect(&self, updates: AuthUpdateSender) -> BackendFuture<'_, AuthUpdate> {
        Box::pin(async move {
            *self.updates.lock().unwrap() = Some(updates);
            debug!(base_url = %self.base_url, "bot api connection opened");
            Ok(AuthUpdate::WaitCredentials)
        })
    }

    fn submit_credentials<'a>(
        &'a self,
        _credentials: &'a Credentials,
        strategy: LoginStrategy,
    ) -> BackendFuture<'a, AuthUpdate> {
        Box::pin(async move {
            match strategy {
                LoginStrategy::DirectSecret => Ok(AuthUpdate::WaitPrimaryFactor),
                LoginStrategy::RemoteConfirmation => Err(BackendError::Unsupported(
                    "bots cannot log in with remote confirmation".into(),
                )),
            }
        })
    }

    fn check_secret<'a>(&'a self, secret: &'a str) -> BackendFuture<'a, AuthUpdate> {
        Box::pin(async move {
            let client = match Client::with_http(self.http.clone(), &self.base_url, secret) {
                Ok(client) => client,
                Err(Error::InvalidToken) => {
                    return Ok(AuthUpdate::Rejected {
                        reason: "malformed bot token".into(),
                    });
                }
                Err(e) => return Err(e.into()),
            };

            match client.get_me().await {
                Ok(me) if me.is_bot => {
                    info!(bot_id = me.id, username = ?me.username, "bot token accepted");
                    *self.client.write().unwrap() = Some(client);
                    Ok(AuthUpdate::Authorized)
                }
                Ok(_) => Ok(AuthUpdate::Rejected {
                    reason: "token does not belong to a bot".into(),
                }),
                Err(Error::Api {
                    status: 401 | 404,
                    description,
                    ..
                }) => Ok(AuthUpdate::Rejected {
                    reason: description,
                }),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn request_confirmation(&self) -> BackendFuture<'_, AuthUpdate> {
        Box::pin(async move {
            Err(BackendError::Unsupported(
                "bots cannot log in with remote confirmation".into(),
            ))
        })
    }

    fn check_second_factor<'a>(&'a self, _password: &'a str) -> BackendFuture<'a, AuthUpdate> {
        Box::pin(async move {
            Err(BackendError::Unsupported(
                "bots have no second factor".into(),
            ))
        })
    }

    fn find_self_channel(&self) -> BackendFuture<'_, Option<ChannelId>> {
        Box::pin(async move { Ok(None) })
    }

    fn create_self_channel(&self) -> BackendFuture<'_, ChannelId> {
        Box::pin(async move {
            Err(BackendError::Unsupported(
                "bots cannot create channels, configure a destination".into(),
            ))
        })
    }

    fn send_part<'a>(
        &'a self,
        channel: &'a ChannelId,
        part: OutgoingPart,
    ) -> BackendFuture<'a, RemotePart> {
        Box::pin(async move {
            let client = self.client()?;
            let len = part.data.len() as u64;
            let message = self.check(
                client
                    .send_document(
                        &channel.0,
                        &part.file_name,
                        part.caption.as_deref(),
                        part.data,
                    )
                    .await,
            )?;

            let document = message.document.ok_or_else(|| {
                BackendError::from(Error::UnexpectedResponse(format!(
                    "message {} has no document",
                    message.message_id
                )))
            })?;
            debug!(
                part = part.index,
                message_id = message.message_id,
                "document posted"
            );
            Ok(RemotePart {
                remote_id: format!("{}:{}", message.message_id, document.file_id),
                size: document.file_size.unwrap_or(len),
            })
        })
    }

    fn fetch_part<'a>(
        &'a self,
        _channel: &'a ChannelId,
        remote_id: &'a str,
    ) -> BackendFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let client = self.client()?;
            let (_, file_id) = parse_remote_id(remote_id)?;
            let file = self.check(client.get_file(file_id).await)?;
            let path = file.file_path.ok_or_else(|| {
                BackendError::Unsupported(format!(
                    "part {remote_id} is too large for the download endpoint"
                ))
            })?;
            self.check(client.download_file(&path).await)
        })
    }

    fn delete_part<'a>(
        &'a self,
        channel: &'a ChannelId,
        remote_id: &'a str,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let client = self.client()?;
            let (message_id, _) = parse_remote_id(remote_id)?;
            self.check(client.delete_message(&channel.0, message_id).await)?;
            Ok(())
        })
    }

    fn log_out(&self) -> BackendFuture<'_, ()> {
        // Bot API logOut moves the bot off the cloud server for ten minutes,
        // so only the local login is dropped.
        Box::pin(async move {
            self.disconnect();
            info!("bot session logged out");
            Ok(())
        })
    }

    fn close(&self) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            self.disconnect();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_server::{MockServer, Reply};
    use teledrive_session::{AuthState, BackendSession, SessionConfig, SessionError};
    use tokio::sync::mpsc;

    const TOKEN: &str = "123456:test-token";
    const GET_ME: &str =
        r#"{"ok":true,"result":{"id":123456,"is_bot":true,"first_name":"Drive","username":"drive_bot"}}"#;

    fn channel() -> ChannelId {
        ChannelId("-1001".into())
    }

    fn part(data: &[u8]) -> OutgoingPart {
        OutgoingPart {
            index: 0,
            file_name: "f.part001".into(),
            caption: None,
            data: data.to_vec(),
        }
    }

    async fn authorized(server: &MockServer) -> (BotConnection, mpsc::UnboundedReceiver<AuthUpdate>) {
        let conn = BotConnection::new().unwrap().with_base_url(&server.url);
        let (tx, rx) = mpsc::unbounded_channel();
        conn.connect(tx).await.unwrap();
        assert_eq!(conn.check_secret(TOKEN).await.unwrap(), AuthUpdate::Authorized);
        (conn, rx)
    }

    fn api(status: u16, description: &str) -> Error {
        Error::Api {
            status,
            description: description.into(),
            retry_after: None,
        }
    }

    #[test]
    fn error_classification() {
        let limited = BackendError::from(Error::Api {
            status: 429,
            description: "Too Many Requests".into(),
            retry_after: Some(7),
        });
        assert_eq!(
            limited,
            BackendError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
        assert!(limited.is_transient());

        assert!(BackendError::from(api(502, "Bad Gateway")).is_transient());
        assert_eq!(
            BackendError::from(api(401, "Unauthorized")),
            BackendError::CredentialRevoked
        );
        assert_eq!(
            BackendError::from(api(400, "Bad Request: chat not found")),
            BackendError::MissingDestination
        );
        assert!(matches!(
            BackendError::from(api(400, "Bad Request: message to delete not found")),
            BackendError::NotFound(_)
        ));
        let forbidden = BackendError::from(api(403, "Forbidden: bot is not a member"));
        assert!(matches!(forbidden, BackendError::Rejected { code: 403, .. }));
        assert!(!forbidden.is_transient());
    }

    #[test]
    fn remote_id_parsing() {
        assert_eq!(parse_remote_id("42:BQAC").unwrap(), (42, "BQAC"));
        assert_eq!(parse_remote_id("42:a:b").unwrap(), (42, "a:b"));
        assert!(parse_remote_id("msg-1").is_err());
        assert!(parse_remote_id("42:").is_err());
        assert!(parse_remote_id("x:BQAC").is_err());
    }

    #[tokio::test]
    async fn invalid_token_rejected() {
        let server = MockServer::start(vec![Reply::status(
            401,
            r#"{"ok":false,"error_code":401,"description":"Unauthorized"}"#,
        )])
        .await;
        let conn = BotConnection::new().unwrap().with_base_url(&server.url);
        let (tx, _rx) = mpsc::unbounded_channel();
        conn.connect(tx).await.unwrap();

        let update = conn.check_secret(TOKEN).await.unwrap();
        assert_eq!(
            update,
            AuthUpdate::Rejected {
                reason: "Unauthorized".into()
            }
        );
        assert!(matches!(
            conn.send_part(&channel(), part(b"x")).await,
            Err(BackendError::Closed)
        ));
    }

    #[tokio::test]
    async fn malformed_token_never_reaches_network() {
        let server = MockServer::start(vec![]).await;
        let conn = BotConnection::new().unwrap().with_base_url(&server.url);

        let update = conn.check_secret("not a token").await.unwrap();
        assert!(matches!(update, AuthUpdate::Rejected { .. }));
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn remote_confirmation_unsupported() {
        let conn = BotConnection::new().unwrap();
        let err = conn
            .submit_credentials(&Credentials::default(), LoginStrategy::RemoteConfirmation)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unsupported(_)));
        assert!(!err.is_transient());
        assert!(conn.create_self_channel().await.is_err());
        assert_eq!(conn.find_self_channel().await.unwrap(), None);
    }

    #[tokio::test]
    async fn send_fetch_delete() {
        let server = MockServer::start(vec![
            Reply::json(GET_ME),
            Reply::json(
                r#"{"ok":true,"result":{"message_id":42,"document":{"file_id":"BQAC","file_unique_id":"u","file_size":5}}}"#,
            ),
            Reply::json(r#"{"ok":true,"result":{"file_id":"BQAC","file_size":5,"file_path":"documents/file_1"}}"#),
            Reply::bytes(b"hello"),
            Reply::json(r#"{"ok":true,"result":true}"#),
        ])
        .await;
        let (conn, _rx) = authorized(&server).await;

        let remote = conn.send_part(&channel(), part(b"hello")).await.unwrap();
        assert_eq!(remote.remote_id, "42:BQAC");
        assert_eq!(remote.size, 5);

        let data = conn.fetch_part(&channel(), &remote.remote_id).await.unwrap();
        assert_eq!(data, b"hello");

        conn.delete_part(&channel(), &remote.remote_id).await.unwrap();
        let requests = server.requests();
        assert!(requests[4].body_text().contains("message_id=42"));
    }

    #[tokio::test]
    async fn missing_chat_maps_to_missing_destination() {
        let server = MockServer::start(vec![
            Reply::json(GET_ME),
            Reply::status(
                400,
                r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#,
            ),
        ])
        .await;
        let (conn, _rx) = authorized(&server).await;

        let err = conn.send_part(&channel(), part(b"x")).await.unwrap_err();
        assert_eq!(err, BackendError::MissingDestination);
    }

    #[tokio::test]
    async fn flood_wait_carries_retry_after() {
        let server = MockServer::start(vec![
            Reply::json(GET_ME),
            Reply::status(
                429,
                r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 3","parameters":{"retry_after":3}}"#,
            ),
        ])
        .await;
        let (conn, _rx) = authorized(&server).await;

        let err = conn.send_part(&channel(), part(b"x")).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn revoked_token_reports_connection_lost() {
        let server = MockServer::start(vec![
            Reply::json(GET_ME),
            Reply::status(
                401,
                r#"{"ok":false,"error_code":401,"description":"Unauthorized"}"#,
            ),
        ])
        .await;
        let (conn, mut rx) = authorized(&server).await;

        let err = conn.fetch_part(&channel(), "42:BQAC").await.unwrap_err();
        assert_eq!(err, BackendError::CredentialRevoked);
        assert_eq!(rx.recv().await, Some(AuthUpdate::ConnectionLost));
        assert!(matches!(
            conn.fetch_part(&channel(), "42:BQAC").await,
            Err(BackendError::Closed)
        ));
    }

    #[tokio::test]
    async fn oversized_file_is_structural() {
        let server = MockServer::start(vec![
            Reply::json(GET_ME),
            Reply::json(r#"{"ok":true,"result":{"file_id":"BQAC","file_size":30000000}}"#),
        ])
        .await;
        let (conn, _rx) = authorized(&server).await;

        let err = conn.fetch_part(&channel(), "1:BQAC").await.unwrap_err();
        assert!(matches!(err, BackendError::Unsupported(_)));
    }

    #[tokio::test]
    async fn session_logs_in_with_configured_destination() {
        let server = MockServer::start(vec![Reply::json(GET_ME)]).await;
        let conn = BotConnection::new().unwrap().with_base_url(&server.url);
        let config = SessionConfig::direct_secret(TOKEN).with_destination(channel());
        let session = BackendSession::new(config, Box::new(conn));

        assert_eq!(session.login().await.unwrap(), AuthState::Ready);
        assert_eq!(session.destination(), Some(channel()));
        session.shutdown().await;
    }

    #[tokio::test]
    async fn session_without_destination_cannot_transfer() {
        let server = MockServer::start(vec![Reply::json(GET_ME)]).await;
        let conn = BotConnection::new().unwrap().with_base_url(&server.url);
        let session = BackendSession::new(SessionConfig::direct_secret(TOKEN), Box::new(conn));

        assert_eq!(session.login().await.unwrap(), AuthState::Ready);
        let err = session.download_part("1:BQAC", None).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Backend(BackendError::MissingDestination)
        ));
    }
}
