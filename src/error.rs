// src/error.rs
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("URL parsing failed: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("JSON processing error: {0}")]
    JsonError(String),

    #[error("JSON deserialization failed: {0}")]
    JsonDeserializationFailed(String),

    #[error("Parse API error (code {code}): {error}")]
    ApiError { code: i32, error: String },

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid session token: {0}")]
    InvalidSessionToken(String),

    #[error("Operation forbidden: {0}")]
    OperationForbidden(String),

    #[error("SDK error: {0}")]
    SdkError(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Socket not established: {0}")]
    SocketNotEstablished(String),

    #[error("Maximum connection attempts ({0}) exceeded")]
    MaxConnectionAttempts(usize),

    #[error("Unsupported LiveQuery message: {0}")]
    UnsupportedMessage(String),
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        ParseError::JsonError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ParseError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ParseError::WebSocketError(err.to_string())
    }
}

impl ParseError {
    /// Creates a `ParseError` from the `code` and `error` fields of a LiveQuery
    /// `error` push message.
    pub(crate) fn from_live_query_error(code: i32, message: String) -> Self {
        match code {
            101 => ParseError::ObjectNotFound(format!("({}) {}", code, message)),
            119 => ParseError::OperationForbidden(format!(
                "Missing master key for operation: ({}) {}",
                code, message
            )),
            209 => ParseError::InvalidSessionToken(format!("({}) {}", code, message)),
            _ => ParseError::ApiError {
                code,
                error: message,
            },
        }
    }

    /// The Parse error code carried by this error, when it originated from the server.
    pub fn code(&self) -> Option<i32> {
        match self {
            ParseError::ApiError { code, .. } => Some(*code),
            ParseError::ObjectNotFound(_) => Some(101),
            ParseError::OperationForbidden(_) => Some(119),
            ParseError::InvalidSessionToken(_) => Some(209),
            _ => None,
        }
    }

    /// `true` for failures of the physical socket, as opposed to protocol or input errors.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            ParseError::WebSocketError(_)
                | ParseError::SocketNotEstablished(_)
                | ParseError::ConnectionFailed(_)
                | ParseError::MaxConnectionAttempts(_)
        )
    }
}
