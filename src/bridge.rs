//! Request/response envelopes for external hosts (desktop app, web UI).
//!
//! The core does not care about the transport — WebSocket, pipe, or HTTP —
//! only about the envelope shape. Delivery is at-least-once, so every
//! registered handler must be idempotent: handling the same request twice
//! must leave the same state as handling it once.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;

/// Incoming request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeRequest {
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeStatus {
    Success,
    Error,
}

/// Outgoing response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub action: String,
    pub status: BridgeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl BridgeResponse {
    pub fn success(action: impl Into<String>, result: Value) -> Self {
        Self {
            action: action.into(),
            status: BridgeStatus::Success,
            result: Some(result),
            message: None,
        }
    }

    pub fn error(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            status: BridgeStatus::Error,
            result: None,
            message: Some(message.into()),
        }
    }
}

/// One action's handler. Must be idempotent.
#[async_trait]
pub trait BridgeHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> Result<Value>;
}

/// Dispatches envelopes to registered action handlers.
#[derive(Default)]
pub struct Bridge {
    handlers: HashMap<String, Arc<dyn BridgeHandler>>,
}

impl Bridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action: impl Into<String>, handler: Arc<dyn BridgeHandler>) {
        self.handlers.insert(action.into(), handler);
    }

    pub async fn dispatch(&self, request: BridgeRequest) -> BridgeResponse {
        match self.handlers.get(&request.action) {
            None => BridgeResponse::error(
                request.action.clone(),
                format!("unknown action '{}'", request.action),
            ),
            Some(handler) => match handler.handle(request.payload).await {
                Ok(result) => BridgeResponse::success(request.action, result),
                Err(error) => BridgeResponse::error(request.action, error.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl BridgeHandler for Echo {
        async fn handle(&self, payload: Value) -> Result<Value> {
            Ok(json!({"echo": payload}))
        }
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let mut bridge = Bridge::new();
        bridge.register("ping", Arc::new(Echo));

        let response = bridge
            .dispatch(BridgeRequest {
                action: "ping".to_string(),
                payload: json!({"n": 1}),
            })
            .await;
        assert_eq!(response.status, BridgeStatus::Success);
        assert_eq!(response.result.unwrap()["echo"]["n"], 1);
    }

    #[tokio::test]
    async fn test_unknown_action_is_error_envelope() {
        let bridge = Bridge::new();
        let response = bridge
            .dispatch(BridgeRequest {
                action: "nope".to_string(),
                payload: Value::Null,
            })
            .await;
        assert_eq!(response.status, BridgeStatus::Error);
        assert!(response.message.unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_envelope_roundtrip() {
        let request: BridgeRequest =
            serde_json::from_str(r#"{"action": "run", "payload": {"goal": "x"}}"#).unwrap();
        assert_eq!(request.action, "run");

        let response = BridgeResponse::success("run", json!({"session": "s-1"}));
        let encoded = serde_json::to_value(&response).unwrap();
        assert_eq!(encoded["status"], "success");
        assert!(encoded.get("message").is_none());
    }
}
