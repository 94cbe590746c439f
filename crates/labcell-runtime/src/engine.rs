//! The task engine: submission queue, worker, and registry.
//!
//! Submissions enqueue a PENDING record and return immediately; one worker
//! drains the queue in FIFO order and drives the matching handler. Status
//! queries clone the record, so callers never observe a partially updated
//! snapshot, and terminal records are never touched again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use labcell_core::types::{
    BottleGetParams, Command, Detection, EnterIdParams, ScanStep, ScannedBottle, TaskRecord,
    TaskStatus,
};
use labcell_core::{CommandError, Inventory, InventoryError};
use labcell_rpc::{RobotPrimitives, RobotTransport};

use crate::handlers;
use crate::rendezvous::{EnterId, EnterIdRendezvous};

type Registry = Arc<RwLock<HashMap<String, TaskRecord>>>;

/// Everything a handler needs to execute one task.
#[derive(Clone)]
pub struct HandlerContext {
    pub inventory: Arc<Inventory>,
    pub robot: RobotPrimitives,
    pub rendezvous: Arc<EnterIdRendezvous>,
}

/// A handler's write path into its own task record.
///
/// Updates are dropped silently once the record is terminal.
#[derive(Clone)]
pub struct TaskHandle {
    registry: Registry,
    task_id: String,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    fn update(&self, mutate: impl FnOnce(&mut TaskRecord)) {
        let mut registry = self.registry.write().expect("registry lock poisoned");
        if let Some(record) = registry.get_mut(&self.task_id) {
            if !record.status.is_terminal() {
                mutate(record);
            }
        }
    }

    pub fn advance_step(&self, step: ScanStep, message: impl Into<String>) {
        self.update(|record| record.advance_step(step, message));
    }

    /// Park on the ENTER_ID rendezvous: expose the detection and flip the
    /// status to WAITING.
    pub fn set_waiting(&self, detection: Detection) {
        self.update(|record| {
            record.current_bottle_info = Some(detection);
            record.advance_step(ScanStep::WaitingIdInput, "scan complete");
        });
    }

    pub fn resume_running(&self) {
        self.update(|record| {
            record.status = TaskStatus::Running;
            record.current_bottle_info = None;
        });
    }

    pub fn add_scanned(&self, entry: ScannedBottle) {
        self.update(|record| record.scanned_bottles.push(entry));
    }
}

struct QueuedTask {
    task_id: String,
    command: Command,
    cancel: CancellationToken,
}

struct EngineInner {
    registry: Registry,
    cancellations: Mutex<HashMap<String, CancellationToken>>,
    tx: mpsc::UnboundedSender<QueuedTask>,
    queue_depth: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    running: Mutex<Option<String>>,
    rendezvous: Arc<EnterIdRendezvous>,
    inventory: Arc<Inventory>,
}

/// The asynchronous task engine.
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<EngineInner>,
}

impl TaskEngine {
    /// Build the engine and start its worker.
    pub fn new(
        inventory: Arc<Inventory>,
        transport: Arc<dyn RobotTransport>,
        default_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let rendezvous = Arc::new(EnterIdRendezvous::new());
        let inner = Arc::new(EngineInner {
            registry: Arc::new(RwLock::new(HashMap::new())),
            cancellations: Mutex::new(HashMap::new()),
            tx,
            queue_depth: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            running: Mutex::new(None),
            rendezvous: rendezvous.clone(),
            inventory: inventory.clone(),
        });
        let context = HandlerContext {
            inventory,
            robot: RobotPrimitives::new(transport, default_timeout),
            rendezvous,
        };
        tokio::spawn(worker_loop(inner.clone(), context, rx));
        Self { inner }
    }

    /// Enqueue a long-running command; returns the task id and the queue
    /// depth after the enqueue.
    pub fn submit(&self, cmd_id: &str, command: Command) -> Result<(String, usize), CommandError> {
        let record = TaskRecord::new(cmd_id, command.cmd_type());
        let task_id = record.task_id.clone();
        let cancel = CancellationToken::new();
        self.inner
            .registry
            .write()
            .expect("registry lock poisoned")
            .insert(task_id.clone(), record);
        self.inner
            .cancellations
            .lock()
            .expect("cancellations lock poisoned")
            .insert(task_id.clone(), cancel.clone());
        self.inner
            .tx
            .send(QueuedTask {
                task_id: task_id.clone(),
                command,
                cancel,
            })
            .map_err(|_| CommandError::Internal("task worker is gone".to_string()))?;
        let depth = self.inner.queue_depth.fetch_add(1, Ordering::SeqCst) + 1;
        Ok((task_id, depth))
    }

    /// Snapshot of one task record.
    pub fn status(&self, task_id: &str) -> Option<TaskRecord> {
        self.inner
            .registry
            .read()
            .expect("registry lock poisoned")
            .get(task_id)
            .cloned()
    }

    pub fn queue_status(&self) -> Value {
        let total = self
            .inner
            .registry
            .read()
            .expect("registry lock poisoned")
            .len();
        let running = self
            .inner
            .running
            .lock()
            .expect("running lock poisoned")
            .clone();
        json!({
            "queue_size": self.inner.queue_depth.load(Ordering::SeqCst),
            "total_tasks": total,
            "completed_tasks": self.inner.completed.load(Ordering::SeqCst),
            "failed_tasks": self.inner.failed.load(Ordering::SeqCst),
            "running_task": running,
        })
    }

    /// Request cooperative cancellation; observed at the next step boundary.
    pub fn cancel(&self, task_id: &str) -> Result<Value, CommandError> {
        {
            let registry = self.inner.registry.read().expect("registry lock poisoned");
            let record = registry
                .get(task_id)
                .ok_or_else(|| CommandError::TaskNotFound(task_id.to_string()))?;
            if record.status.is_terminal() {
                return Err(CommandError::TaskAlreadyTerminal(task_id.to_string()));
            }
        }
        if let Some(token) = self
            .inner
            .cancellations
            .lock()
            .expect("cancellations lock poisoned")
            .get(task_id)
        {
            token.cancel();
        }
        Ok(json!({
            "success": true,
            "message": "cancellation requested",
            "task_id": task_id,
        }))
    }

    /// Deliver an ENTER_ID to the waiting scan session, if any.
    pub fn enter_id(&self, params: EnterIdParams) -> Result<Value, CommandError> {
        let task_id = self.inner.rendezvous.deliver(EnterId {
            bottle_id: params.bottle_id.clone(),
            object_type: params.object_type,
        })?;
        Ok(json!({
            "success": true,
            "message": "enter-id accepted",
            "bottle_id": params.bottle_id,
            "task_id": task_id,
        }))
    }

    /// Pure inventory projection; no planner, no RPC.
    pub fn bottle_get(&self, params: &BottleGetParams) -> Result<Value, CommandError> {
        let data = self
            .inner
            .inventory
            .summary(
                params.bottle_id.as_deref(),
                params.pose_name.as_deref(),
                params.detail(),
            )
            .map_err(map_lookup_error)?;
        Ok(json!({"success": true, "message": "query ok", "data": data}))
    }

    /// Synchronous projection of a scan task record.
    pub fn scan_result(&self, task_id: &str) -> Result<Value, CommandError> {
        let record = self
            .status(task_id)
            .ok_or_else(|| CommandError::TaskNotFound(task_id.to_string()))?;
        Ok(json!({
            "success": true,
            "task_id": record.task_id,
            "status": record.status,
            "current_step": record.current_step,
            "completed_steps": record.completed_steps,
            "scanned_bottles": record.scanned_bottles,
            "current_bottle_info": record.current_bottle_info,
            "error_message": record.error_message,
        }))
    }

    /// Dispatch for commands that answer in full instead of enqueueing.
    pub fn handle_sync(&self, command: &Command) -> Result<Value, CommandError> {
        match command {
            Command::BottleGet(params) => self.bottle_get(params),
            Command::EnterId(params) => self.enter_id(params.clone()),
            Command::Cancel(params) => self.cancel(&params.task_id),
            Command::ScanQrcodeResult(params) => self.scan_result(&params.task_id),
            other => Err(CommandError::Internal(format!(
                "{} is not a synchronous command",
                other.cmd_type()
            ))),
        }
    }
}

fn map_lookup_error(err: InventoryError) -> CommandError {
    match err {
        InventoryError::UnknownBottle(id) => CommandError::BottleUnknown(id),
        InventoryError::UnknownSlot(pose) => CommandError::SlotUnknown(pose),
        other => CommandError::Internal(other.to_string()),
    }
}

impl EngineInner {
    fn set_running(&self, task_id: &str) {
        let mut registry = self.registry.write().expect("registry lock poisoned");
        if let Some(record) = registry.get_mut(task_id) {
            record.start();
        }
        *self.running.lock().expect("running lock poisoned") = Some(task_id.to_string());
    }

    fn clear_running(&self, task_id: &str) {
        let mut running = self.running.lock().expect("running lock poisoned");
        if running.as_deref() == Some(task_id) {
            *running = None;
        }
    }

    fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
    ) {
        {
            let mut registry = self.registry.write().expect("registry lock poisoned");
            if let Some(record) = registry.get_mut(task_id) {
                if !record.status.is_terminal() {
                    record.finish(status, result, error);
                }
            }
        }
        match status {
            TaskStatus::Completed => {
                self.completed.fetch_add(1, Ordering::SeqCst);
            }
            TaskStatus::Failed => {
                self.failed.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
        self.cancellations
            .lock()
            .expect("cancellations lock poisoned")
            .remove(task_id);
        // A session that died while parked must not strand its waiter.
        self.rendezvous.clear(task_id);
    }
}

async fn worker_loop(
    inner: Arc<EngineInner>,
    context: HandlerContext,
    mut rx: mpsc::UnboundedReceiver<QueuedTask>,
) {
    tracing::info!("task worker started");
    while let Some(queued) = rx.recv().await {
        inner.queue_depth.fetch_sub(1, Ordering::SeqCst);
        let task_id = queued.task_id;

        if queued.cancel.is_cancelled() {
            inner.finish_task(
                &task_id,
                TaskStatus::Cancelled,
                None,
                Some("cancelled before start".to_string()),
            );
            continue;
        }

        inner.set_running(&task_id);
        let handle = TaskHandle {
            registry: inner.registry.clone(),
            task_id: task_id.clone(),
        };
        tracing::info!(%task_id, "task started");

        let result = handlers::execute(&context, &handle, queued.command, queued.cancel.clone()).await;
        match result {
            Ok(value) => {
                if queued.cancel.is_cancelled() {
                    inner.finish_task(&task_id, TaskStatus::Cancelled, Some(value), None);
                } else {
                    let success = value
                        .get("success")
                        .and_then(Value::as_bool)
                        .unwrap_or(true);
                    if success {
                        inner.finish_task(&task_id, TaskStatus::Completed, Some(value), None);
                    } else {
                        let message = value
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("command failed")
                            .to_string();
                        inner.finish_task(&task_id, TaskStatus::Failed, Some(value), Some(message));
                    }
                }
            }
            Err(err) => {
                let status = if queued.cancel.is_cancelled() {
                    TaskStatus::Cancelled
                } else {
                    TaskStatus::Failed
                };
                tracing::error!(
                    %task_id,
                    code = err.code().as_u16(),
                    error = %err,
                    "task terminated"
                );
                inner.finish_task(&task_id, status, None, Some(err.to_string()));
            }
        }
        inner.clear_running(&task_id);
        tracing::info!(%task_id, "task finished");
    }
    tracing::info!("task worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{wait_for_terminal, ScriptedRobot};
    use labcell_core::types::{Bottle, Hand, ObjectType};
    use labcell_core::ErrorCode;
    use serde_json::json;

    fn engine_with_bottles() -> (TaskEngine, Arc<Inventory>, Arc<ScriptedRobot>) {
        let inventory = Arc::new(Inventory::with_default_layout());
        inventory.register_bottle(Bottle::new("B1", ObjectType::GlassBottle1000, Hand::Right));
        inventory.register_bottle(Bottle::new("B2", ObjectType::GlassBottle500, Hand::Right));
        inventory.place_bottle("B1", "shelf_temp_1000_003").unwrap();
        inventory.place_bottle("B2", "shelf_temp_500_001").unwrap();
        let robot = ScriptedRobot::new();
        let engine = TaskEngine::new(
            inventory.clone(),
            robot.clone(),
            Duration::from_secs(10),
        );
        (engine, inventory, robot)
    }

    fn pickup(ids: &[&str]) -> Command {
        Command::parse(
            "PICK_UP",
            &json!({
                "target_params": ids
                    .iter()
                    .map(|id| json!({"bottle_id": id}))
                    .collect::<Vec<_>>(),
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_submit_and_complete_lifecycle() {
        tokio_test::block_on(async {
            let (engine, inventory, robot) = engine_with_bottles();
            let (task_id, depth) = engine.submit("cmd-1", pickup(&["B1", "B2"])).unwrap();
            assert_eq!(depth, 1);

            let record = wait_for_terminal(&engine, &task_id).await;
            assert_eq!(record.status, TaskStatus::Completed);
            let result = record.result.unwrap();
            assert_eq!(result["success_count"], 2);
            assert_eq!(result["total"], 2);

            // Scenario trace: 1 wait + 1 nav + 2 x (grab, turn, put, turn).
            assert_eq!(robot.actions().len(), 10);

            // Bottles landed on their typed back-platform slots.
            assert_eq!(
                inventory.lookup_bottle("B1").unwrap().location.as_deref(),
                Some("back_temp_1000_001")
            );
            assert_eq!(
                inventory.lookup_bottle("B2").unwrap().location.as_deref(),
                Some("back_temp_500_001")
            );

            let queue = engine.queue_status();
            assert_eq!(queue["queue_size"], 0);
            assert_eq!(queue["completed_tasks"], 1);
            assert_eq!(queue["failed_tasks"], 0);
        });
    }

    #[test]
    fn test_completion_order_matches_submission_order() {
        tokio_test::block_on(async {
            let (engine, _inventory, _robot) = engine_with_bottles();
            let (first, _) = engine.submit("cmd-1", pickup(&["B1"])).unwrap();
            let (second, _) = engine.submit("cmd-2", pickup(&["B2"])).unwrap();

            let first_record = wait_for_terminal(&engine, &first).await;
            let second_record = wait_for_terminal(&engine, &second).await;
            assert!(first_record.end_time.unwrap() <= second_record.start_time.unwrap());
        });
    }

    #[test]
    fn test_cancel_unknown_and_terminal() {
        tokio_test::block_on(async {
            let (engine, _inventory, _robot) = engine_with_bottles();
            assert_eq!(
                engine.cancel("missing").unwrap_err().code(),
                ErrorCode::TaskNotFound
            );

            let (task_id, _) = engine.submit("cmd-1", pickup(&["B1"])).unwrap();
            wait_for_terminal(&engine, &task_id).await;
            assert_eq!(
                engine.cancel(&task_id).unwrap_err().code(),
                ErrorCode::TaskAlreadyTerminal
            );
        });
    }

    #[test]
    fn test_terminal_record_is_immutable() {
        tokio_test::block_on(async {
            let (engine, _inventory, _robot) = engine_with_bottles();
            let (task_id, _) = engine.submit("cmd-1", pickup(&["B1"])).unwrap();
            let record = wait_for_terminal(&engine, &task_id).await;

            // A late handle update must be dropped.
            let handle = TaskHandle {
                registry: engine.inner.registry.clone(),
                task_id: task_id.clone(),
            };
            handle.advance_step(ScanStep::CvDetecting, "late");
            let after = engine.status(&task_id).unwrap();
            assert_eq!(after.status, record.status);
            assert_eq!(after.current_step, record.current_step);
            assert_eq!(after.completed_steps.len(), record.completed_steps.len());
        });
    }

    #[test]
    fn test_bottle_get_is_side_effect_free() {
        tokio_test::block_on(async {
            let (engine, _inventory, _robot) = engine_with_bottles();
            let params = BottleGetParams {
                bottle_id: Some("B1".to_string()),
                pose_name: None,
                detail_params: Some(true),
            };
            let first = engine.bottle_get(&params).unwrap();
            let second = engine.bottle_get(&params).unwrap();
            assert_eq!(first, second);

            let missing = BottleGetParams {
                bottle_id: Some("ghost".to_string()),
                pose_name: None,
                detail_params: None,
            };
            assert_eq!(
                engine.bottle_get(&missing).unwrap_err().code(),
                ErrorCode::BottleUnknown
            );
        });
    }

    #[test]
    fn test_enter_id_without_waiting_task() {
        tokio_test::block_on(async {
            let (engine, _inventory, _robot) = engine_with_bottles();
            let err = engine
                .enter_id(EnterIdParams {
                    bottle_id: "BTL-9".to_string(),
                    object_type: ObjectType::GlassBottle500,
                })
                .unwrap_err();
            assert_eq!(err.code(), ErrorCode::NoWaitingTask);
        });
    }
}
