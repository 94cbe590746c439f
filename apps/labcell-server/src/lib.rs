//! HTTP command surface and process bootstrap.
//!
//! One POST endpoint accepts the command envelope; long-running commands are
//! enqueued and answered with a task id, synchronous ones reply in full.
//! Status endpoints read the task registry and the queue counters.

mod instance_lock;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use thiserror::Error;

use labcell_config::{LabcellConfig, ObservabilityConfig};
use labcell_core::inventory::ROBOT_NAV;
use labcell_core::types::{Bottle, Command, CommandEnvelope, ObjectType, Slot, SlotCategory};
use labcell_core::{CommandError, ErrorCode, Inventory};
use labcell_rpc::{LinkConfig, RobotLink};
use labcell_runtime::TaskEngine;

pub use instance_lock::{InstanceLock, LockError};

/// Fatal startup/runtime failures, mapped onto the process exit codes.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] labcell_config::ConfigError),
    #[error("{0}")]
    LockHeld(#[from] LockError),
    #[error("robot link initialization failed: {0}")]
    RpcInit(#[from] labcell_rpc::ConnectError),
    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

impl ServerError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ServerError::LockHeld(_) => 1,
            ServerError::Config(_) => 2,
            ServerError::RpcInit(_) => 3,
            ServerError::Runtime(_) => 1,
        }
    }
}

#[derive(Clone)]
struct AppState {
    engine: TaskEngine,
    robot: Arc<RobotLink>,
    app_name: String,
}

pub async fn run_server(
    config_path: PathBuf,
    listen_override: Option<SocketAddr>,
    lock_path: PathBuf,
) -> Result<(), ServerError> {
    let config = labcell_config::load_config(&config_path)?;
    let _log_guard = init_tracing(&config.observability);

    let _lock = InstanceLock::acquire(&lock_path)?;
    tracing::info!(app = %config.app.name, "starting labcell orchestrator");

    let inventory = build_inventory(&config)?;

    let robot = Arc::new(RobotLink::new(LinkConfig {
        host: config.robot.host.clone(),
        port: config.robot.port,
        retry_interval: Duration::from_secs(config.robot.retry_interval_secs),
        max_retry_attempts: config.robot.max_retry_attempts,
        default_timeout: Duration::from_secs(config.robot.default_timeout_secs),
    }));
    robot.connect().await?;

    let engine = TaskEngine::new(
        inventory,
        robot.clone(),
        Duration::from_secs(config.robot.default_timeout_secs),
    );

    let listen: SocketAddr = match listen_override {
        Some(listen) => listen,
        None => config
            .http
            .listen
            .parse()
            .map_err(|err| anyhow::anyhow!("http.listen: {err}"))?,
    };
    let state = AppState {
        engine,
        robot: robot.clone(),
        app_name: config.app.name.clone(),
    };

    let app = Router::new()
        .route("/", get(health).post(handle_command))
        .route("/task/{task_id}", get(task_status))
        .route("/queue/status", get(queue_status))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|err| anyhow::anyhow!("bind {listen} failed: {err}"))?;
    tracing::info!(%listen, "http surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| anyhow::anyhow!("server terminated: {err}"))?;

    robot.close().await;
    tracing::info!("clean shutdown");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "ctrl-c handler failed");
    }
}

fn init_tracing(
    observability: &ObservabilityConfig,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_new(&observability.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match &observability.log_file {
        Some(path) => {
            let path = Path::new(path);
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file = path.file_name().map(Path::new).unwrap_or(path);
            let appender = tracing_appender::rolling::never(
                dir.unwrap_or_else(|| Path::new(".")),
                file,
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

/// Materialize the inventory from the config seed, or the built-in layout.
fn build_inventory(config: &LabcellConfig) -> Result<Arc<Inventory>, ServerError> {
    let Some(seed) = &config.inventory else {
        return Ok(Arc::new(Inventory::with_default_layout()));
    };

    let inventory = Inventory::new();
    for slot in &seed.slots {
        inventory.insert_slot(Slot::new(
            &slot.pose_name,
            slot.category,
            &slot.navigation_pose,
            slot.accepted_type,
            slot.capacity,
        ));
    }
    // The robot carries its platform slots whatever the workcell looks like.
    for ty in ObjectType::ALL {
        if inventory.lookup_slot(ty.back_platform_slot()).is_err() {
            inventory.insert_slot(Slot::new(
                ty.back_platform_slot(),
                SlotCategory::BackPlatform,
                ROBOT_NAV,
                Some(ty),
                2,
            ));
        }
    }
    for bottle in &seed.bottles {
        inventory.register_bottle(Bottle::new(
            &bottle.bottle_id,
            bottle.object_type,
            bottle.hand,
        ));
        if let Some(location) = &bottle.location {
            inventory
                .place_bottle(&bottle.bottle_id, location)
                .map_err(|err| anyhow::anyhow!("inventory seed: {err}"))?;
        }
    }
    Ok(Arc::new(inventory))
}

async fn handle_command(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let envelope: CommandEnvelope = serde_json::from_value(payload)
        .map_err(|err| error_response(&CommandError::BadRequest(err.to_string())))?;
    if envelope.cmd_id.trim().is_empty() {
        return Err(error_response(&CommandError::BadRequest(
            "cmd_id must not be empty".to_string(),
        )));
    }
    let command = Command::parse(&envelope.cmd_type, &envelope.params)
        .map_err(|err| error_response(&err))?;
    tracing::info!(
        cmd_id = %envelope.cmd_id,
        cmd_type = %envelope.cmd_type,
        "command received"
    );

    if command.is_long_running() {
        let (task_id, queue_size) = state
            .engine
            .submit(&envelope.cmd_id, command)
            .map_err(|err| error_response(&err))?;
        Ok(Json(json!({
            "success": true,
            "task_id": task_id,
            "message": "任务已加入队列",
            "queue_size": queue_size,
            "cmd_id": envelope.cmd_id,
        })))
    } else {
        let mut reply = state
            .engine
            .handle_sync(&command)
            .map_err(|err| error_response(&err))?;
        if let Value::Object(map) = &mut reply {
            map.insert("cmd_id".to_string(), Value::String(envelope.cmd_id));
        }
        Ok(Json(reply))
    }
}

async fn task_status(
    State(state): State<AppState>,
    UrlPath(task_id): UrlPath<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let record = state
        .engine
        .status(&task_id)
        .ok_or_else(|| error_response(&CommandError::TaskNotFound(task_id.clone())))?;
    Ok(Json(json!({"success": true, "task": record})))
}

async fn queue_status(State(state): State<AppState>) -> Json<Value> {
    let mut status = state.engine.queue_status();
    if let Value::Object(map) = &mut status {
        map.insert("success".to_string(), Value::Bool(true));
    }
    Json(status)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "running",
        "app": state.app_name,
        "robot_connected": state.robot.is_connected(),
    }))
}

fn error_response(err: &CommandError) -> (StatusCode, Json<Value>) {
    let code = err.code();
    (
        http_status_for(code),
        Json(json!({
            "success": false,
            "code": code.as_u16(),
            "message": err.to_string(),
        })),
    )
}

fn http_status_for(code: ErrorCode) -> StatusCode {
    match code.as_u16() {
        1000 | 1001 => StatusCode::BAD_REQUEST,
        2000 | 2001 | 4000 => StatusCode::NOT_FOUND,
        2002 | 2003 | 2004 | 4001 | 4002 | 4003 => StatusCode::CONFLICT,
        3000 | 3001 | 3002 => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            http_status_for(ErrorCode::BadRequest),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            http_status_for(ErrorCode::BottleUnknown),
            StatusCode::NOT_FOUND
        );
        assert_eq!(http_status_for(ErrorCode::SlotFull), StatusCode::CONFLICT);
        assert_eq!(
            http_status_for(ErrorCode::NoWaitingTask),
            StatusCode::CONFLICT
        );
        assert_eq!(
            http_status_for(ErrorCode::RobotDisconnected),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            http_status_for(ErrorCode::Internal),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_shape() {
        let (status, Json(body)) =
            error_response(&CommandError::TaskNotFound("t-1".to_string()));
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], 4000);
        assert!(body["message"].as_str().unwrap().contains("t-1"));
    }

    #[test]
    fn test_build_inventory_default_layout() {
        let config = LabcellConfig::default();
        let inventory = build_inventory(&config).unwrap();
        assert!(inventory.lookup_slot("shelf_temp_1000_001").is_ok());
        assert!(inventory.lookup_slot("back_temp_100_001").is_ok());
    }

    #[test]
    fn test_build_inventory_custom_seed_keeps_platform_slots() {
        let yaml = r#"
inventory:
  slots:
    - pose_name: rack_a_001
      category: shelf
      navigation_pose: rack_a
      accepted_type: glass_bottle_500
      capacity: 2
  bottles:
    - bottle_id: b1
      object_type: glass_bottle_500
      location: rack_a_001
"#;
        let config: LabcellConfig = serde_yaml::from_str(yaml).unwrap();
        let inventory = build_inventory(&config).unwrap();
        assert!(inventory.lookup_slot("rack_a_001").is_ok());
        // Platform slots are implicit.
        for ty in ObjectType::ALL {
            assert!(inventory.lookup_slot(ty.back_platform_slot()).is_ok());
        }
        assert_eq!(
            inventory.lookup_bottle("b1").unwrap().location.as_deref(),
            Some("rack_a_001")
        );
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            ServerError::Config(labcell_config::ConfigError::Invalid("x".to_string()))
                .exit_code(),
            2
        );
        assert_eq!(
            ServerError::LockHeld(LockError::Held { pid: 42 }).exit_code(),
            1
        );
        assert_eq!(
            ServerError::RpcInit(labcell_rpc::ConnectError::RetriesExhausted { attempts: 3 })
                .exit_code(),
            3
        );
    }
}
