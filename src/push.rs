//! Blocking client for an Expo-compatible push gateway.
//!
//! Sending is batched: the provider accepts up to `MAX_SEND_BATCH` messages
//! per call and answers with one ticket per message, in order. Delivery is
//! asynchronous on the provider side; tickets are resolved later through the
//! receipt endpoint (see `services::receipts`).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Provider-imposed ceiling on messages per send call.
pub const MAX_SEND_BATCH: usize = 100;
/// Ceiling on ticket ids per receipt lookup.
pub const MAX_RECEIPT_BATCH: usize = 300;

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum PushError {
    Transport(String),
    Http { status: u16, message: String },
    Json(String),
}

impl core::fmt::Display for PushError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PushError::Transport(s) => write!(f, "transport error: {}", s),
            PushError::Http { status, message } => write!(f, "http {}: {}", status, message),
            PushError::Json(e) => write!(f, "json error: {}", e),
        }
    }
}

impl std::error::Error for PushError {}

#[derive(Debug, Clone, Serialize)]
pub struct PushMessage {
    pub to: String,
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Per-message send outcome. `id` is present on accepted messages and is the
/// handle for the later receipt lookup.
#[derive(Debug, Clone, Deserialize)]
pub struct PushTicket {
    pub status: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl PushTicket {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushReceipt {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl PushReceipt {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    data: Vec<PushTicket>,
}

#[derive(Debug, Deserialize)]
struct ReceiptResponse {
    data: BTreeMap<String, PushReceipt>,
}

#[derive(Debug, Serialize)]
struct ReceiptRequest<'a> {
    ids: &'a [String],
}

pub struct PushClient {
    agent: ureq::Agent,
    base_url: String,
}

impl PushClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(CALL_TIMEOUT).build();
        PushClient {
            agent,
            base_url: base_url.into(),
        }
    }

    fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, PushError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        let value = serde_json::to_value(body).map_err(|e| PushError::Json(e.to_string()))?;
        match self.agent.post(&url).set("Accept", "application/json").send_json(value) {
            Ok(res) => {
                let mut de = serde_json::Deserializer::from_reader(res.into_reader());
                serde_path_to_error::deserialize(&mut de).map_err(|e| PushError::Json(e.to_string()))
            }
            Err(ureq::Error::Transport(t)) => Err(PushError::Transport(t.to_string())),
            Err(ureq::Error::Status(status, res)) => {
                let message = res.into_string().unwrap_or_else(|_| String::from("<no body>"));
                Err(PushError::Http { status, message })
            }
        }
    }

    /// Send one batch of at most `MAX_SEND_BATCH` messages. The returned
    /// tickets are positionally aligned with the input messages.
    pub fn send_batch(&self, messages: &[PushMessage]) -> Result<Vec<PushTicket>, PushError> {
        debug_assert!(messages.len() <= MAX_SEND_BATCH);
        let resp: SendResponse = self.post_json("send", &messages)?;
        Ok(resp.data)
    }

    /// Look up delivery receipts for previously issued tickets. Ids the
    /// provider no longer knows about are simply absent from the result.
    pub fn get_receipts(&self, ticket_ids: &[String]) -> Result<BTreeMap<String, PushReceipt>, PushError> {
        debug_assert!(ticket_ids.len() <= MAX_RECEIPT_BATCH);
        let resp: ReceiptResponse = self.post_json("getReceipts", &ReceiptRequest { ids: ticket_ids })?;
        Ok(resp.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tickets_parse_in_message_order() {
        let json = r#"{
            "data": [
                {"status": "ok", "id": "ticket-1"},
                {"status": "error", "message": "DeviceNotRegistered"}
            ]
        }"#;
        let resp: SendResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.data.len(), 2);
        assert!(resp.data[0].is_ok());
        assert_eq!(resp.data[0].id.as_deref(), Some("ticket-1"));
        assert!(!resp.data[1].is_ok());
        assert_eq!(resp.data[1].message.as_deref(), Some("DeviceNotRegistered"));
    }

    #[test]
    fn receipts_parse_by_ticket_id() {
        let json = r#"{
            "data": {
                "ticket-1": {"status": "ok"},
                "ticket-2": {"status": "error", "message": "MessageRateExceeded"}
            }
        }"#;
        let resp: ReceiptResponse = serde_json::from_str(json).unwrap();
        assert!(resp.data["ticket-1"].is_ok());
        assert!(!resp.data["ticket-2"].is_ok());
    }

    #[test]
    fn message_omits_absent_data_payload() {
        let msg = PushMessage {
            to: "ExponentPushToken[x]".into(),
            title: "t".into(),
            body: "b".into(),
            data: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("data").is_none());
    }
}
