// src/live_query/messages.rs

//! JSON messages exchanged with a Parse LiveQuery server.
//!
//! Outgoing messages are encoded with their keys in lexicographic order and without
//! absent optional fields, so identical messages always produce identical frames.
//! Incoming messages are decoded by their `op` field into [`ServerResponse`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::client::Parse;
use crate::error::ParseError;
use crate::query::ParseQuery;

/// Correlates a subscribe/update/unsubscribe request with its server acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub i32);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Hands out request ids `1, 2, 3, ...`, never repeating a value, from any thread.
#[derive(Debug)]
pub struct RequestIdGenerator {
    next: AtomicI32,
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self {
            next: AtomicI32::new(1),
        }
    }
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> RequestId {
        RequestId(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

/// Operations a client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientOperation {
    Connect,
    Subscribe,
    Unsubscribe,
    Update,
}

/// The `connect` handshake.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardMessage {
    pub op: ClientOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    #[serde(rename = "masterKey", skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installation_id: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl StandardMessage {
    /// Builds a message for `operation`. With `additional_properties` the
    /// credentials of `parse` are attached, as the `connect` handshake requires.
    pub fn new(operation: ClientOperation, additional_properties: bool, parse: &Parse) -> Self {
        let mut message = Self {
            op: operation,
            application_id: None,
            client_key: None,
            primary_key: None,
            session_token: None,
            installation_id: None,
            extra: BTreeMap::new(),
        };
        if additional_properties {
            message.application_id = Some(parse.app_id().to_string());
            message.client_key = parse.client_key().map(str::to_string);
            message.primary_key = parse.master_key().map(str::to_string);
            message.session_token = parse.session_token();
            message.installation_id = Some(parse.installation_id());
        }
        message
    }
}

/// The query as a LiveQuery server expects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryWhere {
    #[serde(rename = "className")]
    pub class_name: String,
    #[serde(rename = "where")]
    pub where_clause: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fields: Option<Vec<String>>,
}

impl From<&ParseQuery> for QueryWhere {
    fn from(query: &ParseQuery) -> Self {
        Self {
            class_name: query.class_name().to_string(),
            where_clause: query.where_clause().clone(),
            fields: query.selected_fields().map(<[String]>::to_vec),
        }
    }
}

/// `subscribe` and `update` requests.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeMessage {
    pub op: ClientOperation,
    pub request_id: RequestId,
    pub query: QueryWhere,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

impl SubscribeMessage {
    pub fn new(
        operation: ClientOperation,
        request_id: RequestId,
        query: &ParseQuery,
        session_token: Option<String>,
    ) -> Self {
        Self {
            op: operation,
            request_id,
            query: QueryWhere::from(query),
            session_token,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeMessage {
    pub op: ClientOperation,
    pub request_id: RequestId,
}

impl UnsubscribeMessage {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            op: ClientOperation::Unsubscribe,
            request_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionResponse {
    pub client_id: String,
    #[serde(default)]
    pub installation_id: Option<String>,
}

/// Acknowledgment of a subscribe, update or unsubscribe request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreliminaryMessageResponse {
    pub request_id: RequestId,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub installation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventResponse<T = Value> {
    pub request_id: RequestId,
    pub object: T,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub installation_id: Option<String>,
}

impl EventResponse<Value> {
    /// Decodes the generic `object` payload into a concrete type.
    pub fn decode_object<T: DeserializeOwned>(self) -> Result<EventResponse<T>, ParseError> {
        let object = serde_json::from_value(self.object)
            .map_err(|e| ParseError::JsonDeserializationFailed(e.to_string()))?;
        Ok(EventResponse {
            request_id: self.request_id,
            object,
            client_id: self.client_id,
            installation_id: self.installation_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub code: i32,
    #[serde(rename = "error")]
    pub message: String,
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,
    #[serde(default)]
    pub request_id: Option<RequestId>,
}

fn default_reconnect() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RedirectResponse {
    pub url: String,
}

/// The kind of change an event push describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Enter,
    Leave,
    Create,
    Update,
    Delete,
}

/// Every message a LiveQuery server sends, keyed by `op`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ServerResponse {
    Connected(ConnectionResponse),
    Subscribed(PreliminaryMessageResponse),
    Unsubscribed(PreliminaryMessageResponse),
    Enter(EventResponse),
    Leave(EventResponse),
    Create(EventResponse),
    Update(EventResponse),
    Delete(EventResponse),
    Error(ErrorResponse),
    Redirect(RedirectResponse),
}

impl ServerResponse {
    /// Splits an event push into its kind and payload, handing other messages back unchanged.
    pub fn into_event(self) -> Result<(EventKind, EventResponse), Self> {
        match self {
            ServerResponse::Enter(event) => Ok((EventKind::Enter, event)),
            ServerResponse::Leave(event) => Ok((EventKind::Leave, event)),
            ServerResponse::Create(event) => Ok((EventKind::Create, event)),
            ServerResponse::Update(event) => Ok((EventKind::Update, event)),
            ServerResponse::Delete(event) => Ok((EventKind::Delete, event)),
            other => Err(other),
        }
    }
}

/// Encodes an outgoing message with sorted keys.
pub fn encode<T: Serialize>(message: &T) -> Result<String, ParseError> {
    // serde_json::Map is a BTreeMap without the preserve_order feature
    let value = serde_json::to_value(message)?;
    Ok(serde_json::to_string(&value)?)
}

/// Decodes an incoming frame.
pub fn decode(text: &str) -> Result<ServerResponse, ParseError> {
    serde_json::from_str(text).map_err(|e| {
        ParseError::UnsupportedMessage(format!("{} (frame: {})", e, truncate_for_log(text)))
    })
}

fn truncate_for_log(text: &str) -> &str {
    const LIMIT: usize = 256;
    if text.len() <= LIMIT {
        return text;
    }
    let mut end = LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
