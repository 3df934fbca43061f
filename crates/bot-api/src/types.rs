//! Telegram Bot API response types.

use serde::{Deserialize, Serialize};

/// Envelope every Bot API method answers with.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub error_code: Option<u16>,
    #[serde(default)]
    pub parameters: Option<ResponseParameters>,
}

/// Extra information attached to failed calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResponseParameters {
    /// Seconds to wait before repeating a flood-limited request.
    #[serde(default)]
    pub retry_after: Option<u64>,
}

/// The bot account, as returned by `getMe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

/// A posted message. Only the fields the backend needs are decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(default)]
    pub document: Option<Document>,
    #[serde(default)]
    pub caption: Option<String>,
}

/// A general file attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub file_id: String,
    #[serde(default)]
    pub file_unique_id: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

/// A file ready to be downloaded, as returned by `getFile`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub file_id: String,
    #[serde(default)]
    pub file_size: Option<u64>,
    /// Path to use with the file endpoint. Absent when the file is too
    /// large for the server to serve.
    #[serde(default)]
    pub file_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_error_envelope() {
        let json = r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 7","parameters":{"retry_after":7}}"#;
        let resp: ApiResponse<User> = serde_json::from_str(json).unwrap();
        assert!(!resp.ok);
        assert!(resp.result.is_none());
        assert_eq!(resp.error_code, Some(429));
        assert_eq!(resp.parameters.unwrap().retry_after, Some(7));
    }

    #[test]
    fn decodes_document_message() {
        let json = r#"{"message_id":42,"date":1700000000,"chat":{"id":-100},
            "document":{"file_id":"BQAC","file_unique_id":"AgAD","file_name":"a.part001","file_size":10},
            "caption":"Part 1/3 of a"}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.message_id, 42);
        let doc = msg.document.unwrap();
        assert_eq!(doc.file_id, "BQAC");
        assert_eq!(doc.file_size, Some(10));
        assert_eq!(msg.caption.as_deref(), Some("Part 1/3 of a"));
    }

    #[test]
    fn file_path_optional() {
        let file: File = serde_json::from_str(r#"{"file_id":"x","file_size":3}"#).unwrap();
        assert!(file.file_path.is_none());
    }
}
