//! Telegram Bot API client.
//!
//! Async HTTP client using `reqwest`. The bot token is part of every
//! request path, so it is stripped from transport errors before they are
//! surfaced.

use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;

use crate::types::{ApiResponse, File, Message, User};

pub const DEFAULT_BASE_URL: &str = "https://api.telegram.org";

/// Errors from the Bot API client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    #[error("API error {status}: {description}")]
    Api {
        status: u16,
        description: String,
        retry_after: Option<u64>,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid bot token")]
    InvalidToken,

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.without_url())
    }
}

/// Bot API client bound to one bot token.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a new client for the given bot token.
    pub fn new(token: &str) -> Result<Self, Error> {
        let http = reqwest::Client::builder().build()?;
        Self::with_http(http, DEFAULT_BASE_URL, token)
    }

    /// Creates a client sharing an existing HTTP connection pool.
    pub fn with_http(http: reqwest::Client, base_url: &str, token: &str) -> Result<Self, Error> {
        if !is_valid_token(token) {
            return Err(Error::InvalidToken);
        }
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// Sets a custom base URL (a local Bot API server, or a mock in tests).
    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    /// Sends a method request and unwraps the response envelope.
    async fn call<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T, Error> {
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;

        let envelope: ApiResponse<T> = match serde_json::from_slice(&body) {
            Ok(envelope) => envelope,
            Err(e) if status.is_success() => return Err(Error::Json(e)),
            Err(_) => {
                return Err(Error::Api {
                    status: status.as_u16(),
                    description: String::from_utf8_lossy(&body).trim().to_string(),
                    retry_after: None,
                });
            }
        };

        match envelope.result {
            Some(result) if envelope.ok => Ok(result),
            _ => Err(Error::Api {
                status: envelope.error_code.unwrap_or(status.as_u16()),
                description: envelope
                    .description
                    .unwrap_or_else(|| status.to_string()),
                retry_after: envelope.parameters.and_then(|p| p.retry_after),
            }),
        }
    }

    /// Returns the bot account the token belongs to.
    pub async fn get_me(&self) -> Result<User, Error> {
        self.call(self.http.get(self.method_url("getMe"))).await
    }

    /// Posts `data` as a document to `chat_id`.
    pub async fn send_document(
        &self,
        chat_id: &str,
        file_name: &str,
        caption: Option<&str>,
        data: Vec<u8>,
    ) -> Result<Message, Error> {
        let document = Part::bytes(data)
            .file_name(file_name.to_string())
            .mime_str("application/octet-stream")?;
        let mut form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part("document", document);
        if let Some(caption) = caption {
            form = form.text("caption", caption.to_string());
        }

        self.call(self.http.post(self.method_url("sendDocument")).multipart(form))
            .await
    }

    /// Resolves a file id into a downloadable file path.
    pub async fn get_file(&self, file_id: &str) -> Result<File, Error> {
        self.call(
            self.http
                .get(self.method_url("getFile"))
                .query(&[("file_id", file_id)]),
        )
        .await
    }

    /// Downloads the content of a file returned by [`get_file`](Self::get_file).
    pub async fn download_file(&self, file_path: &str) -> Result<Vec<u8>, Error> {
        let url = format!("{}/file/bot{}/{}", self.base_url, self.token, file_path);
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Api {
                status: status.as_u16(),
                description: "file download failed".into(),
                retry_after: None,
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }

    /// Deletes one message from `chat_id`.
    pub async fn delete_message(&self, chat_id: &str, message_id: i64) -> Result<bool, Error> {
        let message_id = message_id.to_string();
        self.call(
            self.http
                .post(self.method_url("deleteMessage"))
                .form(&[("chat_id", chat_id), ("message_id", message_id.as_str())]),
        )
        .await
    }
}

/// Bot tokens look like `123456:ABC-def_1`. Anything that would break the
/// request path is refused before it reaches the network.
fn is_valid_token(token: &str) -> bool {
    match token.split_once(':') {
        Some((id, secret)) => {
            !id.is_empty()
                && id.bytes().all(|b| b.is_ascii_digit())
                && !secret.is_empty()
                && secret
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        }
        None => false,
    }
}
