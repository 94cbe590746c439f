//! Wire protocol spoken over the robot WebSocket link.
//!
//! Requests are `call_service` frames; the peer echoes the correlation `id`
//! in its `service_response`. `result` carries the overall verdict and
//! `values` the action-specific payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const OP_CALL_SERVICE: &str = "call_service";
pub const OP_SERVICE_RESPONSE: &str = "service_response";

/// Navigation stack service.
pub const NAVIGATION_SERVICE: &str = "/navigation_status";
/// Manipulation stack service.
pub const MANIPULATION_SERVICE: &str = "/get_strawberry_service";

/// An outbound service call.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceCall {
    pub op: &'static str,
    pub id: u64,
    pub service: String,
    pub args: Value,
}

impl ServiceCall {
    /// Build a call; `extra` object entries are merged next to `action`.
    pub fn new(id: u64, service: &str, action: &str, extra: Value) -> Self {
        let mut args = Map::new();
        args.insert("action".to_string(), Value::String(action.to_string()));
        if let Value::Object(entries) = extra {
            for (key, value) in entries {
                args.insert(key, value);
            }
        }
        Self {
            op: OP_CALL_SERVICE,
            id,
            service: service.to_string(),
            args: Value::Object(args),
        }
    }
}

/// An inbound reply frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceResponse {
    pub op: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub result: bool,
    #[serde(default)]
    pub values: Value,
}

impl ServiceResponse {
    /// Human text for a `result: false` reply, wherever the peer put it.
    pub fn error_detail(&self) -> String {
        self.values
            .get("message")
            .or_else(|| self.values.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.values.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_frame_shape() {
        let call = ServiceCall::new(
            7,
            NAVIGATION_SERVICE,
            "navigation_to_pose",
            json!({"navigation_pose": "shelf"}),
        );
        let frame = serde_json::to_value(&call).unwrap();
        assert_eq!(frame["op"], "call_service");
        assert_eq!(frame["id"], 7);
        assert_eq!(frame["service"], "/navigation_status");
        assert_eq!(frame["args"]["action"], "navigation_to_pose");
        assert_eq!(frame["args"]["navigation_pose"], "shelf");
    }

    #[test]
    fn test_response_parses_with_missing_fields() {
        let response: ServiceResponse =
            serde_json::from_value(json!({"op": "service_response", "result": true})).unwrap();
        assert!(response.result);
        assert_eq!(response.id, None);
        assert!(response.values.is_null());
    }

    #[test]
    fn test_error_detail_prefers_message() {
        let response: ServiceResponse = serde_json::from_value(json!({
            "op": "service_response",
            "id": 1,
            "result": false,
            "values": {"message": "gripper jam"},
        }))
        .unwrap();
        assert_eq!(response.error_detail(), "gripper jam");
    }
}
