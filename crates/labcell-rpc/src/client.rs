//! The long-lived robot link.
//!
//! One `RobotLink` owns one WebSocket connection. A dedicated reader task is
//! the sole consumer of the socket read side and demultiplexes
//! `service_response` frames onto oneshot waiters installed by
//! `send_request`. When the reader observes close or error it fails every
//! outstanding waiter and starts the background reconnect loop; a
//! `send_request` issued while the link is down makes exactly one synchronous
//! reconnect attempt before giving up with `Disconnected`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::{ConnectError, RpcError};
use crate::protocol::{ServiceCall, ServiceResponse, OP_SERVICE_RESPONSE};

type WsWriter = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReader = SplitStream<WebSocketStream<TcpStream>>;

/// Connection and retry policy for one robot.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub host: String,
    pub port: u16,
    /// Pause between connection attempts.
    pub retry_interval: Duration,
    /// `None` means retry forever.
    pub max_retry_attempts: Option<u32>,
    /// Per-request reply deadline when the caller does not override it.
    pub default_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9090,
            retry_interval: Duration::from_secs(5),
            max_retry_attempts: None,
            default_timeout: Duration::from_secs(10),
        }
    }
}

/// Transport seam between handlers and the wire.
///
/// The production implementation is `RobotLink`; tests substitute a scripted
/// peer.
#[async_trait]
pub trait RobotTransport: Send + Sync {
    async fn call(
        &self,
        service: &str,
        action: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError>;
}

/// A resilient WebSocket RPC client for one robot.
pub struct RobotLink {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    config: LinkConfig,
    next_id: AtomicU64,
    generation: AtomicU64,
    connected: AtomicBool,
    reconnecting: AtomicBool,
    closing: AtomicBool,
    writer: Mutex<Option<WsWriter>>,
    dial_lock: Mutex<()>,
    pending: StdMutex<HashMap<u64, oneshot::Sender<ServiceResponse>>>,
}

impl RobotLink {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                config,
                next_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                writer: Mutex::new(None),
                dial_lock: Mutex::new(()),
                pending: StdMutex::new(HashMap::new()),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.config.default_timeout
    }

    /// Dial until connected or the retry budget runs out.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.inner.connect_with_retry().await
    }

    /// Issue one service call and await its correlated reply.
    pub async fn send_request(
        &self,
        service: &str,
        action: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        self.inner.send_request(service, action, args, timeout).await
    }

    /// Clean shutdown; outstanding waiters fail with `Disconnected` and no
    /// reconnect is attempted.
    pub async fn close(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        let mut writer = self.inner.writer.lock().await;
        if let Some(sink) = writer.as_mut() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        *writer = None;
        drop(writer);
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.fail_in_flight();
    }
}

#[async_trait]
impl RobotTransport for RobotLink {
    async fn call(
        &self,
        service: &str,
        action: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        self.send_request(service, action, args, timeout).await
    }
}

impl LinkInner {
    async fn send_request(
        self: &Arc<Self>,
        service: &str,
        action: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        if !self.connected.load(Ordering::SeqCst) {
            self.reconnect_once().await?;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id, tx);

        let call = ServiceCall::new(id, service, action, args);
        let frame = match serde_json::to_string(&call) {
            Ok(frame) => frame,
            Err(err) => {
                self.remove_waiter(id);
                return Err(RpcError::Remote(format!("encode frame: {err}")));
            }
        };
        tracing::debug!(id, service, action, "sending service call");

        let write_error = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(sink) => sink
                    .send(Message::text(frame))
                    .await
                    .err()
                    .map(|err| err.to_string()),
                None => Some("writer closed".to_string()),
            }
        };
        if let Some(detail) = write_error {
            tracing::warn!(id, %detail, "frame write failed, dropping link");
            self.remove_waiter(id);
            self.mark_disconnected().await;
            self.fail_in_flight();
            self.spawn_reconnect();
            return Err(RpcError::Disconnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                if response.result {
                    Ok(response.values)
                } else {
                    Err(RpcError::Remote(response.error_detail()))
                }
            }
            // Waiter dropped: the reader observed close/error.
            Ok(Err(_)) => Err(RpcError::Disconnected),
            Err(_) => {
                // A reply arriving after this point finds no waiter and is
                // dropped by the reader.
                self.remove_waiter(id);
                Err(RpcError::Timeout(timeout))
            }
        }
    }

    async fn connect_once(&self) -> Result<WebSocketStream<TcpStream>, ConnectError> {
        let target = format!("{}:{}", self.config.host, self.config.port);

        let mut addrs =
            tokio::net::lookup_host(&target)
                .await
                .map_err(|err| ConnectError::Dns {
                    host: self.config.host.clone(),
                    detail: err.to_string(),
                })?;
        let addr = addrs.next().ok_or_else(|| ConnectError::Dns {
            host: self.config.host.clone(),
            detail: "no addresses resolved".to_string(),
        })?;

        let tcp = TcpStream::connect(addr).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::ConnectionRefused {
                ConnectError::Refused {
                    addr: addr.to_string(),
                }
            } else {
                ConnectError::Io {
                    addr: addr.to_string(),
                    detail: err.to_string(),
                }
            }
        })?;

        let url = format!("ws://{target}/");
        let (stream, _response) = tokio_tungstenite::client_async(url, tcp)
            .await
            .map_err(|err| ConnectError::Handshake {
                addr: addr.to_string(),
                detail: err.to_string(),
            })?;
        Ok(stream)
    }

    async fn connect_with_retry(self: &Arc<Self>) -> Result<(), ConnectError> {
        let _dial = self.dial_lock.lock().await;
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.connect_once().await {
                Ok(stream) => {
                    self.install(stream).await;
                    tracing::info!(
                        host = %self.config.host,
                        port = self.config.port,
                        attempt,
                        "robot link established"
                    );
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "robot connect attempt failed");
                }
            }
            if self
                .config
                .max_retry_attempts
                .map_or(false, |max| attempt >= max)
            {
                return Err(ConnectError::RetriesExhausted { attempts: attempt });
            }
            tokio::time::sleep(self.config.retry_interval).await;
        }
    }

    /// The single synchronous attempt `send_request` is allowed on a down
    /// link.
    async fn reconnect_once(self: &Arc<Self>) -> Result<(), RpcError> {
        let _dial = self.dial_lock.lock().await;
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.closing.load(Ordering::SeqCst) {
            return Err(RpcError::Disconnected);
        }
        match self.connect_once().await {
            Ok(stream) => {
                self.install(stream).await;
                Ok(())
            }
            Err(err) => {
                tracing::debug!(error = %err, "inline reconnect attempt failed");
                Err(RpcError::Disconnected)
            }
        }
    }

    async fn install(self: &Arc<Self>, stream: WebSocketStream<TcpStream>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (writer, reader) = stream.split();
        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::SeqCst);
        let inner = self.clone();
        tokio::spawn(async move {
            read_loop(inner, reader, generation).await;
        });
    }

    async fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.writer.lock().await = None;
    }

    fn fail_in_flight(&self) {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        let count = pending.len();
        pending.clear();
        if count > 0 {
            tracing::warn!(count, "failed in-flight requests on disconnect");
        }
    }

    fn remove_waiter(&self, id: u64) {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&id);
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(err) = inner.connect_with_retry().await {
                tracing::error!(error = %err, "background reconnect gave up");
            }
            inner.reconnecting.store(false, Ordering::SeqCst);
        });
    }
}

async fn read_loop(inner: Arc<LinkInner>, mut reader: WsReader, generation: u64) {
    loop {
        match reader.next().await {
            Some(Ok(Message::Text(text))) => dispatch(&inner, text.as_str()),
            Some(Ok(Message::Close(_))) => {
                tracing::info!("peer closed the robot link");
                break;
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
            Some(Ok(_)) => tracing::warn!("dropping non-text frame"),
            Some(Err(err)) => {
                tracing::warn!(error = %err, "robot link read error");
                break;
            }
            None => break,
        }
    }

    // A newer connection may already be installed; only the current
    // generation tears the link down.
    if inner.generation.load(Ordering::SeqCst) == generation
        && !inner.closing.load(Ordering::SeqCst)
    {
        inner.mark_disconnected().await;
        inner.fail_in_flight();
        inner.spawn_reconnect();
    }
}

fn dispatch(inner: &Arc<LinkInner>, text: &str) {
    let response: ServiceResponse = match serde_json::from_str(text) {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(error = %err, "dropping unparseable frame");
            return;
        }
    };
    if response.op != OP_SERVICE_RESPONSE {
        tracing::warn!(op = %response.op, "dropping frame with unexpected op");
        return;
    }
    let Some(id) = response.id else {
        tracing::warn!("dropping service_response without id");
        return;
    };
    let waiter = inner
        .pending
        .lock()
        .expect("pending lock poisoned")
        .remove(&id);
    match waiter {
        Some(tx) => {
            if tx.send(response).is_err() {
                tracing::debug!(id, "waiter gone before reply delivery");
            }
        }
        None => tracing::warn!(id, "dropping reply with no live waiter"),
    }
}
