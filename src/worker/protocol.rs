//! Protocol types for worker communication.
//!
//! The persistent worker speaks newline-delimited JSON: one
//! [`RequestEnvelope`] per line on its stdin, one [`ResponseEnvelope`] per
//! line on its stdout. The one-shot fallback process receives the bare
//! [`BridgeRequest`] payload instead.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{BridgeError, BridgeResult};

/// Maximum number of prior turns forwarded with an `ask`.
pub const MAX_HISTORY_TURNS: usize = 8;

// ============================================================================
// Request/Response Envelope
// ============================================================================

/// Request envelope sent to the worker.
#[derive(Debug, Clone, Serialize)]
pub struct RequestEnvelope<'a> {
    /// Unique request ID for correlation.
    pub id: &'a str,
    /// The action payload.
    pub payload: &'a Value,
}

/// Response envelope received from the worker.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseEnvelope {
    /// Request ID this response corresponds to.
    pub id: String,
    /// Whether the request succeeded.
    #[serde(default)]
    pub ok: bool,
    /// Result data (present if ok = true).
    #[serde(default)]
    pub result: Option<Value>,
    /// Error message (present if ok = false).
    #[serde(default)]
    pub error: Option<Value>,
}

impl ResponseEnvelope {
    /// Convert into the call outcome carried back to the caller.
    pub fn into_outcome(self) -> BridgeResult<Value> {
        if self.ok {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            let message = self
                .error
                .as_ref()
                .map(error_text)
                .unwrap_or_else(|| "worker reported an unknown error".to_string());
            Err(BridgeError::Application(super::normalize::normalize_error_text(
                &message,
            )))
        }
    }
}

/// Extract a message from an `error` field that may be a string or an object.
pub(crate) fn error_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

// ============================================================================
// Action payloads
// ============================================================================

/// Response detail level requested by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailMode {
    Brief,
    #[default]
    Normal,
    Detailed,
}

impl DetailMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DetailMode::Brief => "brief",
            DetailMode::Normal => "normal",
            DetailMode::Detailed => "detailed",
        }
    }
}

/// One prior question/answer exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub answer: String,
}

/// Parameters for `ask`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskRequest {
    pub question: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub history: Vec<HistoryTurn>,
    #[serde(default)]
    pub mode: DetailMode,
}

impl AskRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            username: String::new(),
            history: Vec::new(),
            mode: DetailMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: DetailMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn with_history(mut self, history: Vec<HistoryTurn>) -> Self {
        self.history = history;
        self
    }
}

/// Parameters for `train_rewrite`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainRewriteRequest {
    pub input: String,
    #[serde(default)]
    pub mode: DetailMode,
    #[serde(default)]
    pub username: String,
    #[serde(default, rename = "userId")]
    pub user_id: String,
}

/// A request accepted by the bridge.
///
/// Serialized with the action as an inline `"action"` tag, which is exactly
/// the payload shape the worker expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BridgeRequest {
    Status,
    Ask(AskRequest),
    Reload,
    TrainRewrite(TrainRewriteRequest),
}

/// Action discriminant, used for routing and metric names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Status,
    Ask,
    Reload,
    TrainRewrite,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Status => "status",
            Action::Ask => "ask",
            Action::Reload => "reload",
            Action::TrainRewrite => "train_rewrite",
        }
    }
}

impl BridgeRequest {
    /// Parse and validate a raw JSON request.
    pub fn from_value(value: Value) -> BridgeResult<Self> {
        let request: BridgeRequest = serde_json::from_value(value)
            .map_err(|e| BridgeError::InvalidRequest(e.to_string()))?;
        request.validate()
    }

    /// Validate the payload, bounding the history it carries.
    pub fn validate(self) -> BridgeResult<Self> {
        match self {
            BridgeRequest::Ask(mut ask) => {
                if ask.question.trim().is_empty() {
                    return Err(BridgeError::InvalidRequest(
                        "question must be non-empty".to_string(),
                    ));
                }
                if ask.history.len() > MAX_HISTORY_TURNS {
                    let excess = ask.history.len() - MAX_HISTORY_TURNS;
                    ask.history.drain(..excess);
                }
                Ok(BridgeRequest::Ask(ask))
            }
            BridgeRequest::TrainRewrite(rewrite) => {
                if rewrite.input.trim().is_empty() {
                    return Err(BridgeError::InvalidRequest(
                        "input must be non-empty".to_string(),
                    ));
                }
                Ok(BridgeRequest::TrainRewrite(rewrite))
            }
            other => Ok(other),
        }
    }

    pub fn action(&self) -> Action {
        match self {
            BridgeRequest::Status => Action::Status,
            BridgeRequest::Ask(_) => Action::Ask,
            BridgeRequest::Reload => Action::Reload,
            BridgeRequest::TrainRewrite(_) => Action::TrainRewrite,
        }
    }

    /// The JSON payload written to the worker.
    pub fn to_payload(&self) -> BridgeResult<Value> {
        serde_json::to_value(self).map_err(|e| BridgeError::InvalidRequest(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_envelope_serialization() {
        let payload = json!({"action": "status"});
        let envelope = RequestEnvelope {
            id: "abc-1",
            payload: &payload,
        };
        let line = serde_json::to_string(&envelope).unwrap();
        assert_eq!(line, r#"{"id":"abc-1","payload":{"action":"status"}}"#);
    }

    #[test]
    fn test_response_envelope_ok() {
        let response: ResponseEnvelope =
            serde_json::from_str(r#"{"id":"abc-1","ok":true,"result":{"answer":"10 AM"}}"#)
                .unwrap();
        assert_eq!(response.into_outcome().unwrap(), json!({"answer": "10 AM"}));
    }

    #[test]
    fn test_response_envelope_error() {
        let response: ResponseEnvelope =
            serde_json::from_str(r#"{"id":"abc-2","ok":false,"error":"knowledge base missing"}"#)
                .unwrap();
        let err = response.into_outcome().unwrap_err();
        assert_eq!(err, BridgeError::Application("knowledge base missing".into()));
    }

    #[test]
    fn test_ask_payload_shape() {
        let request = BridgeRequest::Ask(
            AskRequest::new("What time is the keynote?")
                .with_mode(DetailMode::Brief)
                .with_username("ada"),
        );
        let payload = request.to_payload().unwrap();
        assert_eq!(payload["action"], "ask");
        assert_eq!(payload["question"], "What time is the keynote?");
        assert_eq!(payload["mode"], "brief");
        assert_eq!(payload["username"], "ada");
    }

    #[test]
    fn test_train_rewrite_user_id_rename() {
        let request = BridgeRequest::from_value(json!({
            "action": "train_rewrite",
            "input": "make it friendlier",
            "userId": "42"
        }))
        .unwrap();
        match request {
            BridgeRequest::TrainRewrite(rewrite) => {
                assert_eq!(rewrite.user_id, "42");
                assert_eq!(rewrite.mode, DetailMode::Normal);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_validation_rejects_empty_question() {
        let err = BridgeRequest::from_value(json!({"action": "ask", "question": "   "}))
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidRequest(_)));
    }

    #[test]
    fn test_validation_rejects_unknown_action() {
        let err = BridgeRequest::from_value(json!({"action": "explode"})).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidRequest(_)));
    }

    #[test]
    fn test_validation_bounds_history() {
        let history: Vec<HistoryTurn> = (0..12)
            .map(|i| HistoryTurn {
                question: format!("q{i}"),
                answer: format!("a{i}"),
            })
            .collect();
        let request = BridgeRequest::Ask(AskRequest::new("hi").with_history(history))
            .validate()
            .unwrap();
        let BridgeRequest::Ask(ask) = request else {
            panic!("expected ask");
        };
        assert_eq!(ask.history.len(), MAX_HISTORY_TURNS);
        assert_eq!(ask.history[0].question, "q4");
        assert_eq!(ask.history.last().unwrap().question, "q11");
    }
}
