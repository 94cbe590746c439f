//! Typed wrappers around the robot service actions.
//!
//! Navigation and waist rotation are idempotent on the physical side, so a
//! timed-out or disconnected attempt is retried once before the failure
//! propagates; grab/put/scan/cv_detect are never retried.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use labcell_core::types::{Detection, Hand, ObjectType};

use crate::client::RobotTransport;
use crate::error::RpcError;
use crate::protocol::{MANIPULATION_SERVICE, NAVIGATION_SERVICE};

/// How the arm retreats after releasing an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafePose {
    Preset,
    LiftUp,
    Retract,
}

impl SafePose {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafePose::Preset => "preset",
            SafePose::LiftUp => "lift_up",
            SafePose::Retract => "retract",
        }
    }
}

/// The primitive layer for one robot.
#[derive(Clone)]
pub struct RobotPrimitives {
    transport: Arc<dyn RobotTransport>,
    default_timeout: Duration,
}

impl RobotPrimitives {
    pub fn new(transport: Arc<dyn RobotTransport>, default_timeout: Duration) -> Self {
        Self {
            transport,
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Block until the navigation stack reports ready.
    pub async fn waiting_navigation_status(&self, timeout: Duration) -> Result<(), RpcError> {
        self.call_retrying(
            NAVIGATION_SERVICE,
            "waiting_navigation_status",
            json!({}),
            timeout,
        )
        .await
        .map(|_| ())
    }

    /// Drive the base to a waypoint; acks after arrival or rejection.
    pub async fn navigation_to_pose(&self, nav: &str, timeout: Duration) -> Result<(), RpcError> {
        self.call_retrying(
            NAVIGATION_SERVICE,
            "navigation_to_pose",
            json!({ "navigation_pose": nav }),
            timeout,
        )
        .await
        .map(|_| ())
    }

    pub async fn grab_object(
        &self,
        object_type: ObjectType,
        target_pose: &str,
        hand: Hand,
        timeout: Duration,
    ) -> Result<(), RpcError> {
        self.transport
            .call(
                MANIPULATION_SERVICE,
                "grab_object",
                json!({
                    "strawberry": {
                        "type": object_type,
                        "target_pose": target_pose,
                        "hand": hand,
                    }
                }),
                timeout,
            )
            .await
            .map(|_| ())
    }

    /// Rotate the waist; the firmware expects the angle as a string.
    pub async fn turn_waist(
        &self,
        angle: i32,
        obstacle_avoidance: bool,
        timeout: Duration,
    ) -> Result<(), RpcError> {
        let angle = angle.clamp(-180, 180);
        self.call_retrying(
            MANIPULATION_SERVICE,
            "turn_waist",
            json!({
                "angle": angle.to_string(),
                "obstacle_avoidance": obstacle_avoidance,
            }),
            timeout,
        )
        .await
        .map(|_| ())
    }

    pub async fn put_object(
        &self,
        object_type: ObjectType,
        target_pose: &str,
        hand: Hand,
        safe_pose: SafePose,
        timeout: Duration,
    ) -> Result<(), RpcError> {
        self.transport
            .call(
                MANIPULATION_SERVICE,
                "put_object",
                json!({
                    "strawberry": {
                        "type": object_type,
                        "target_pose": target_pose,
                        "hand": hand,
                        "safe_pose": safe_pose.as_str(),
                    }
                }),
                timeout,
            )
            .await
            .map(|_| ())
    }

    /// Pick the handheld scanner off its cradle.
    pub async fn grab_scan_gun(&self, timeout: Duration) -> Result<(), RpcError> {
        self.transport
            .call(
                MANIPULATION_SERVICE,
                "grab_object",
                json!({
                    "strawberry": {
                        "type": "scan_gun",
                        "target_pose": "scan_gun",
                        "hand": "right",
                    }
                }),
                timeout,
            )
            .await
            .map(|_| ())
    }

    /// Trigger the scanner on the bottle in hand.
    pub async fn scan(&self, timeout: Duration) -> Result<(), RpcError> {
        self.transport
            .call(MANIPULATION_SERVICE, "scan", json!({}), timeout)
            .await
            .map(|_| ())
    }

    /// Ask the vision stack for the next bottle on the scan table.
    pub async fn cv_detect(&self, timeout: Duration) -> Result<Option<Detection>, RpcError> {
        let values = self
            .transport
            .call(MANIPULATION_SERVICE, "cv_detect", json!({}), timeout)
            .await?;
        if values.get("detected").and_then(Value::as_bool) == Some(false) {
            return Ok(None);
        }
        serde_json::from_value::<Detection>(values)
            .map(Some)
            .map_err(|err| RpcError::Remote(format!("malformed cv_detect reply: {err}")))
    }

    async fn call_retrying(
        &self,
        service: &str,
        action: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        match self
            .transport
            .call(service, action, args.clone(), timeout)
            .await
        {
            Err(RpcError::Timeout(_)) | Err(RpcError::Disconnected) => {
                tracing::warn!(action, "retrying idempotent primitive once");
                self.transport.call(service, action, args, timeout).await
            }
            other => other,
        }
    }
}
