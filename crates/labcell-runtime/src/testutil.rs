//! Scripted robot transport and polling helpers shared by runtime tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use labcell_core::types::{ObjectType, TaskRecord};
use labcell_rpc::{RobotTransport, RpcError};

use crate::engine::TaskEngine;

/// A robot peer that records every call and replays scripted outcomes.
///
/// Every action succeeds with empty values unless a failure was injected for
/// a specific occurrence; `cv_detect` replays its queued detections and then
/// reports no-detection forever.
pub struct ScriptedRobot {
    calls: Mutex<Vec<(String, Value)>>,
    counters: Mutex<HashMap<String, usize>>,
    failures: Mutex<HashMap<(String, usize), RpcError>>,
    detections: Mutex<VecDeque<Value>>,
}

impl ScriptedRobot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            counters: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            detections: Mutex::new(VecDeque::new()),
        })
    }

    /// Fail the `occurrence`-th call (1-based) of `action`.
    pub fn fail_on(&self, action: &str, occurrence: usize, error: RpcError) {
        self.failures
            .lock()
            .unwrap()
            .insert((action.to_string(), occurrence), error);
    }

    pub fn push_detection(&self, target_pose: &str, object_type: ObjectType) {
        self.detections.lock().unwrap().push_back(json!({
            "target_pose": target_pose,
            "bottle_type": object_type,
        }));
    }

    /// Action names in call order.
    pub fn actions(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(action, _)| action.clone())
            .collect()
    }

    pub fn args_of(&self, action: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == action)
            .map(|(_, args)| args.clone())
            .collect()
    }
}

#[async_trait]
impl RobotTransport for ScriptedRobot {
    async fn call(
        &self,
        _service: &str,
        action: &str,
        args: Value,
        _timeout: Duration,
    ) -> Result<Value, RpcError> {
        self.calls
            .lock()
            .unwrap()
            .push((action.to_string(), args));
        let occurrence = {
            let mut counters = self.counters.lock().unwrap();
            let counter = counters.entry(action.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        if let Some(error) = self
            .failures
            .lock()
            .unwrap()
            .remove(&(action.to_string(), occurrence))
        {
            return Err(error);
        }
        if action == "cv_detect" {
            return Ok(self
                .detections
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| json!({"detected": false})));
        }
        Ok(json!({}))
    }
}

/// Poll until the task reaches a terminal state.
pub async fn wait_for_terminal(engine: &TaskEngine, task_id: &str) -> TaskRecord {
    for _ in 0..500 {
        if let Some(record) = engine.status(task_id) {
            if record.status.is_terminal() {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} did not reach a terminal state");
}

/// Poll until `predicate` holds for the task record.
pub async fn wait_for(
    engine: &TaskEngine,
    task_id: &str,
    predicate: impl Fn(&TaskRecord) -> bool,
) -> TaskRecord {
    for _ in 0..500 {
        if let Some(record) = engine.status(task_id) {
            if predicate(&record) {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never satisfied the predicate");
}
