//! DAP message envelopes.
//!
//! Bodies are kept as raw [`serde_json::Value`]s at this level; typed views
//! live in [`crate::requests`], [`crate::responses`] and [`crate::events`].

use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Sequence number type for message ordering and request-response correlation.
pub type Seq = i64;

/// A DAP message in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Response(Response),
    Event(Event),
    /// A client request, or a reverse request from the debug adapter.
    Request(Request),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub seq: Seq,
    pub request_seq: Seq,
    pub success: bool,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl Response {
    /// Decode the response body as `T`.
    ///
    /// Fails if the request was unsuccessful or the body has another shape.
    pub fn body_as<T>(&self) -> eyre::Result<T>
    where
        T: DeserializeOwned,
    {
        if !self.success {
            eyre::bail!(
                "{} request failed: {}",
                self.command,
                self.message.as_deref().unwrap_or("no message")
            );
        }
        let body = self.body.clone().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(body)
            .map_err(|e| eyre::eyre!("decoding {} response body: {e}", self.command))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: Seq,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub seq: Seq,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
}
