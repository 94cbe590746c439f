//! Command envelope and the typed per-command parameter structs.
//!
//! The HTTP surface accepts a loose JSON envelope; `Command::parse` closes it
//! into a tagged variant. Unknown fields in `params` are protocol drift and
//! rejected rather than silently ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CommandError, ErrorCode};

use super::ObjectType;

/// The raw envelope every HTTP command arrives in.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandEnvelope {
    #[serde(default)]
    pub header: Value,
    pub cmd_id: String,
    pub cmd_type: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub extra: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetParam {
    pub bottle_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReleaseParam {
    pub bottle_id: String,
    pub release_pose: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PickUpParams {
    pub target_params: Vec<TargetParam>,
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PutToParams {
    pub release_params: Vec<ReleaseParam>,
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferParams {
    pub target_params: Vec<TargetParam>,
    pub release_params: Vec<ReleaseParam>,
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnterIdParams {
    pub bottle_id: String,
    #[serde(rename = "type")]
    pub object_type: ObjectType,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BottleGetParams {
    #[serde(default)]
    pub bottle_id: Option<String>,
    #[serde(default)]
    pub pose_name: Option<String>,
    #[serde(default)]
    pub detail_params: Option<bool>,
}

impl BottleGetParams {
    /// The original interface defaulted to detailed output.
    pub fn detail(&self) -> bool {
        self.detail_params.unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CancelParams {
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScanResultParams {
    pub task_id: String,
}

/// The closed set of commands the orchestrator understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    PickUp(PickUpParams),
    PutTo(PutToParams),
    Transfer(TransferParams),
    ScanQrcode,
    ScanQrcodeResult(ScanResultParams),
    EnterId(EnterIdParams),
    BottleGet(BottleGetParams),
    Cancel(CancelParams),
}

impl Command {
    /// Close the loose envelope into a typed command.
    ///
    /// Shape mismatches (including unknown fields) are code 1000; an unknown
    /// `cmd_type` is 1001.
    pub fn parse(cmd_type: &str, params: &Value) -> Result<Command, CommandError> {
        fn typed<T: serde::de::DeserializeOwned>(params: &Value) -> Result<T, CommandError> {
            serde_json::from_value(params.clone())
                .map_err(|err| CommandError::BadRequest(err.to_string()))
        }

        match cmd_type {
            "PICK_UP" => Ok(Command::PickUp(typed(params)?)),
            "PUT_TO" => Ok(Command::PutTo(typed(params)?)),
            "TAKE_BOTTOL_FROM_SP_TO_SP" => Ok(Command::Transfer(typed(params)?)),
            "SCAN_QRCODE" => {
                // Runs autonomously; a populated params payload means the
                // caller copied some other command's body.
                let empty = match params {
                    Value::Null => true,
                    Value::Object(map) => map.is_empty(),
                    _ => false,
                };
                if empty {
                    Ok(Command::ScanQrcode)
                } else {
                    Err(CommandError::BadRequest(
                        "SCAN_QRCODE takes no params".to_string(),
                    ))
                }
            }
            "SCAN_QRCODE_RESULT" => Ok(Command::ScanQrcodeResult(typed(params)?)),
            "ENTER_ID" => Ok(Command::EnterId(typed(params)?)),
            "BOTTLE_GET" => Ok(Command::BottleGet(typed(params)?)),
            "CANCEL" => Ok(Command::Cancel(typed(params)?)),
            other => Err(CommandError::UnknownCmdType(other.to_string())),
        }
    }

    pub fn cmd_type(&self) -> &'static str {
        match self {
            Command::PickUp(_) => "PICK_UP",
            Command::PutTo(_) => "PUT_TO",
            Command::Transfer(_) => "TAKE_BOTTOL_FROM_SP_TO_SP",
            Command::ScanQrcode => "SCAN_QRCODE",
            Command::ScanQrcodeResult(_) => "SCAN_QRCODE_RESULT",
            Command::EnterId(_) => "ENTER_ID",
            Command::BottleGet(_) => "BOTTLE_GET",
            Command::Cancel(_) => "CANCEL",
        }
    }

    /// Long-running commands go through the task queue and reply with a
    /// task_id immediately; everything else answers in full.
    pub fn is_long_running(&self) -> bool {
        matches!(
            self,
            Command::PickUp(_) | Command::PutTo(_) | Command::Transfer(_) | Command::ScanQrcode
        )
    }
}

/// One bottle the orchestrator could not process, with the step that failed
/// and the unified error code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedBottle {
    pub bottle_id: String,
    pub step: String,
    pub code: u16,
}

impl FailedBottle {
    pub fn new(bottle_id: impl Into<String>, step: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            bottle_id: bottle_id.into(),
            step: step.into(),
            code: code.as_u16(),
        }
    }
}

/// The result document of a bottle-moving command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub success: bool,
    pub message: String,
    pub success_count: usize,
    pub failed_bottles: Vec<FailedBottle>,
    pub total: usize,
}

impl CommandOutcome {
    pub fn new(
        cmd_type: &str,
        success_count: usize,
        failed_bottles: Vec<FailedBottle>,
        total: usize,
    ) -> Self {
        // A command that had work to do but achieved none of it failed as a
        // whole; partial success still reports success with the failures
        // itemized.
        let success = total == 0 || success_count > 0;
        let message = if success {
            format!("{cmd_type} finished: {success_count}/{total}")
        } else {
            format!("{cmd_type} failed: 0/{total}")
        };
        Self {
            success,
            message,
            success_count,
            failed_bottles,
            total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_pick_up() {
        let params = json!({"target_params": [{"bottle_id": "B1"}], "timeout": 20.0});
        match Command::parse("PICK_UP", &params).unwrap() {
            Command::PickUp(p) => {
                assert_eq!(p.target_params[0].bottle_id, "B1");
                assert_eq!(p.timeout, Some(20.0));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_field_is_bad_request() {
        let params = json!({"target_params": [], "surprise": true});
        let err = Command::parse("PICK_UP", &params).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);
    }

    #[test]
    fn test_unknown_cmd_type() {
        let err = Command::parse("OPEN_LID", &Value::Null).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownCmdType);
    }

    #[test]
    fn test_scan_qrcode_rejects_copied_put_to_body() {
        let params = json!({"release_params": [{"bottle_id": "B1", "release_pose": "x"}]});
        let err = Command::parse("SCAN_QRCODE", &params).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);

        assert!(Command::parse("SCAN_QRCODE", &Value::Null).is_ok());
        assert!(Command::parse("SCAN_QRCODE", &json!({})).is_ok());
    }

    #[test]
    fn test_enter_id_type_field_name() {
        let params = json!({"bottle_id": "BTL-9", "type": "glass_bottle_500"});
        match Command::parse("ENTER_ID", &params).unwrap() {
            Command::EnterId(p) => assert_eq!(p.object_type, ObjectType::GlassBottle500),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_outcome_success_rules() {
        let all_failed = CommandOutcome::new("PICK_UP", 0, vec![], 3);
        assert!(!all_failed.success);

        let partial = CommandOutcome::new("PICK_UP", 1, vec![], 3);
        assert!(partial.success);

        let empty = CommandOutcome::new("PUT_TO", 0, vec![], 0);
        assert!(empty.success);
    }
}
