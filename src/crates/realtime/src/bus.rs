//! Connection registry and fanout dispatch.

use crate::error::{RealtimeError, Result};
use crate::message::{BusMessage, MessageType, WindowType};
use crate::transport::{Transport, WsTransport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsFrame;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default idle threshold before the reaper disconnects a connection.
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(30 * 60);

/// One registered client connection.
pub struct Connection {
    /// Process-wide unique id.
    pub connection_id: String,
    /// Window this connection is scoped to.
    pub window_type: WindowType,
    /// Authenticated user, when known.
    pub user_id: Option<String>,
    /// Client session, when known.
    pub session_id: Option<String>,
    /// When the connection was accepted.
    pub connected_at: DateTime<Utc>,
    last_activity: AtomicI64,
    subscriptions: RwLock<Vec<String>>,
    transport: Arc<dyn Transport>,
}

impl Connection {
    /// Seconds-precision timestamp of the last send or receive.
    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        let now = Utc::now().timestamp();
        // last_activity only moves forward.
        self.last_activity.fetch_max(now, Ordering::Relaxed);
    }

    /// Topic subscriptions requested by the client.
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.read().clone()
    }

    /// Add a topic subscription.
    pub fn subscribe(&self, topic: impl Into<String>) {
        self.subscriptions.write().push(topic.into());
    }
}

/// Handler invoked for inbound messages of a registered type.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Handle one inbound message.
    async fn handle(&self, message: &BusMessage, connection_id: &str);
}

/// Receiver for slash commands typed into a client window.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// `/run <workflow>`
    async fn run_workflow(&self, workflow: &str, user_id: Option<&str>);
    /// `/spawn <agent_type>`
    async fn spawn_agent(&self, agent_type: &str, user_id: Option<&str>);
    /// `/kill <agent_id>`
    async fn kill_agent(&self, agent_id: &str, user_id: Option<&str>);
}

/// Aggregate connection statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    /// Active connections.
    pub total_connections: usize,
    /// Active connections per window.
    pub window_connections: HashMap<String, usize>,
    /// Distinct authenticated users.
    pub active_users: usize,
    /// Distinct sessions.
    pub active_sessions: usize,
}

/// Window-scoped publish/subscribe bus over long-lived client connections.
pub struct FanoutBus {
    connections: DashMap<String, Arc<Connection>>,
    windows: DashMap<WindowType, Vec<String>>,
    handlers: RwLock<HashMap<MessageType, Vec<Arc<dyn InboundHandler>>>>,
    command_sink: RwLock<Option<Arc<dyn CommandSink>>>,
    idle_threshold: Duration,
    reaper_task: Mutex<Option<JoinHandle<()>>>,
}

impl FanoutBus {
    /// Create a bus with the default idle threshold.
    pub fn new() -> Self {
        Self::with_idle_threshold(DEFAULT_IDLE_THRESHOLD)
    }

    /// Create a bus with a custom idle threshold.
    pub fn with_idle_threshold(idle_threshold: Duration) -> Self {
        let windows = DashMap::new();
        for window in WindowType::all() {
            windows.insert(window, Vec::new());
        }
        Self {
            connections: DashMap::new(),
            windows,
            handlers: RwLock::new(HashMap::new()),
            command_sink: RwLock::new(None),
            idle_threshold,
            reaper_task: Mutex::new(None),
        }
    }

    /// Register a connection and send the welcome message announcing the
    /// window's capability set. Returns the connection id.
    pub async fn connect(
        &self,
        transport: Arc<dyn Transport>,
        window_type: WindowType,
        user_id: Option<String>,
        session_id: Option<String>,
    ) -> Result<String> {
        let connection_id = Uuid::new_v4().to_string();
        let connection = Arc::new(Connection {
            connection_id: connection_id.clone(),
            window_type,
            user_id,
            session_id,
            connected_at: Utc::now(),
            last_activity: AtomicI64::new(Utc::now().timestamp()),
            subscriptions: RwLock::new(Vec::new()),
            transport,
        });

        self.connections.insert(connection_id.clone(), connection);
        self.windows
            .entry(window_type)
            .or_default()
            .push(connection_id.clone());

        info!(connection = %connection_id, window = %window_type, "connection registered");

        let welcome = BusMessage::new(
            MessageType::WindowOpen,
            window_type,
            json!({
                "connection_id": connection_id,
                "window_type": window_type.as_str(),
                "capabilities": window_type.capabilities(),
            }),
        );
        self.send_to(&connection_id, &welcome).await?;

        Ok(connection_id)
    }

    /// Deregister a connection and close its transport. Idempotent.
    pub async fn disconnect(&self, connection_id: &str) {
        let removed = self.connections.remove(connection_id);
        if let Some((_, connection)) = removed {
            if let Some(mut bucket) = self.windows.get_mut(&connection.window_type) {
                bucket.retain(|id| id != connection_id);
            }
            connection.transport.close().await;
            info!(connection = %connection_id, "connection closed");
        }
    }

    /// Send a message to one connection. A failing send disconnects it.
    pub async fn send_to(&self, connection_id: &str, message: &BusMessage) -> Result<()> {
        let connection = self
            .connections
            .get(connection_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RealtimeError::ConnectionNotFound(connection_id.to_string()))?;

        match connection.transport.send_text(message.to_wire()).await {
            Ok(()) => {
                connection.touch();
                Ok(())
            }
            Err(reason) => {
                warn!(connection = %connection_id, %reason, "send failed, dropping connection");
                self.disconnect(connection_id).await;
                Err(RealtimeError::Transport(reason))
            }
        }
    }

    /// Broadcast to every connection of one window.
    pub async fn broadcast_to_window(&self, window_type: WindowType, message: &BusMessage) {
        let targets = self
            .windows
            .get(&window_type)
            .map(|bucket| bucket.clone())
            .unwrap_or_default();
        for connection_id in targets {
            // Failed recipients are dropped inside send_to; others continue.
            let _ = self.send_to(&connection_id, message).await;
        }
    }

    /// Broadcast to every connection of one user, across windows.
    pub async fn broadcast_to_user(&self, user_id: &str, message: &BusMessage) {
        let targets: Vec<String> = self
            .connections
            .iter()
            .filter(|entry| entry.user_id.as_deref() == Some(user_id))
            .map(|entry| entry.connection_id.clone())
            .collect();
        for connection_id in targets {
            let _ = self.send_to(&connection_id, message).await;
        }
    }

    /// Broadcast to every connection.
    pub async fn broadcast_to_all(&self, message: &BusMessage) {
        let targets: Vec<String> = self
            .connections
            .iter()
            .map(|entry| entry.connection_id.clone())
            .collect();
        for connection_id in targets {
            let _ = self.send_to(&connection_id, message).await;
        }
    }

    /// Register an inbound handler for one message type.
    pub fn register_handler(&self, message_type: MessageType, handler: Arc<dyn InboundHandler>) {
        self.handlers
            .write()
            .entry(message_type)
            .or_default()
            .push(handler);
    }

    /// Wire the slash-command receiver.
    pub fn set_command_sink(&self, sink: Arc<dyn CommandSink>) {
        *self.command_sink.write() = Some(sink);
    }

    /// Process one inbound client frame.
    pub async fn handle_inbound(&self, connection_id: &str, text: &str) -> Result<()> {
        let connection = self
            .connections
            .get(connection_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RealtimeError::ConnectionNotFound(connection_id.to_string()))?;
        connection.touch();

        let mut message =
            BusMessage::from_wire(text).map_err(|e| RealtimeError::Parse(e.to_string()))?;
        message.user_id = message.user_id.or_else(|| connection.user_id.clone());
        message.session_id = message.session_id.or_else(|| connection.session_id.clone());

        let handlers: Vec<Arc<dyn InboundHandler>> = self
            .handlers
            .read()
            .get(&message.message_type)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler.handle(&message, connection_id).await;
        }

        match message.message_type {
            MessageType::WindowFocus => self.handle_window_focus(&message).await,
            MessageType::HotSwap => self.handle_hot_swap(&message).await,
            MessageType::SlashCommand => self.handle_slash_command(&message).await,
            _ => {}
        }

        Ok(())
    }

    async fn handle_window_focus(&self, message: &BusMessage) {
        let focus = BusMessage::new(
            MessageType::WindowFocus,
            message.window_type,
            json!({
                "focused": true,
                "user_id": message.user_id,
                "session_id": message.session_id,
            }),
        );
        self.broadcast_to_window(message.window_type, &focus).await;
    }

    async fn handle_hot_swap(&self, message: &BusMessage) {
        let target = message
            .data
            .get("target_window")
            .and_then(|v| serde_json::from_value::<WindowType>(v.clone()).ok());
        let Some(target_window) = target else {
            warn!("hot_swap without a valid target_window");
            return;
        };
        let swap_data = message
            .data
            .get("swap_data")
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        let swap = BusMessage::new(
            MessageType::HotSwap,
            target_window,
            json!({
                "source_window": message.window_type.as_str(),
                "swap_data": swap_data,
                "user_id": message.user_id,
            }),
        );
        self.broadcast_to_window(target_window, &swap).await;
    }

    async fn handle_slash_command(&self, message: &BusMessage) {
        let command = message
            .data
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let args: Vec<String> = message
            .data
            .get("args")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();

        let Some(parsed) = parse_slash_command(command, &args) else {
            debug!(%command, "unrecognized slash command");
            return;
        };

        let sink = self.command_sink.read().clone();
        let Some(sink) = sink else {
            warn!("slash command received but no command sink is wired");
            return;
        };
        let user = message.user_id.as_deref();
        match parsed {
            SlashCommand::Run(workflow) => sink.run_workflow(&workflow, user).await,
            SlashCommand::Spawn(agent_type) => sink.spawn_agent(&agent_type, user).await,
            SlashCommand::Kill(agent_id) => sink.kill_agent(&agent_id, user).await,
        }
    }

    /// Aggregate statistics over active connections.
    pub fn stats(&self) -> ConnectionStats {
        let mut window_connections = HashMap::new();
        for entry in self.windows.iter() {
            window_connections.insert(entry.key().as_str().to_string(), entry.value().len());
        }
        let users: std::collections::HashSet<String> = self
            .connections
            .iter()
            .filter_map(|entry| entry.user_id.clone())
            .collect();
        let sessions: std::collections::HashSet<String> = self
            .connections
            .iter()
            .filter_map(|entry| entry.session_id.clone())
            .collect();

        ConnectionStats {
            total_connections: self.connections.len(),
            window_connections,
            active_users: users.len(),
            active_sessions: sessions.len(),
        }
    }

    /// Look up a connection by id.
    pub fn connection(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections
            .get(connection_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Disconnect every connection idle longer than the threshold. Returns
    /// the ids that were dropped.
    pub async fn reap_idle(&self) -> Vec<String> {
        let cutoff = Utc::now().timestamp() - self.idle_threshold.as_secs() as i64;
        let stale: Vec<String> = self
            .connections
            .iter()
            .filter(|entry| entry.last_activity() < cutoff)
            .map(|entry| entry.connection_id.clone())
            .collect();
        for connection_id in &stale {
            self.disconnect(connection_id).await;
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "reaped idle connections");
        }
        stale
    }

    /// Start the background reaper sweeping at `sweep_interval`.
    pub fn start_reaper(self: Arc<Self>, sweep_interval: Duration) {
        let mut guard = self.reaper_task.lock();
        if guard.is_some() {
            return;
        }
        let bus = Arc::clone(&self);
        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(sweep_interval).await;
                bus.reap_idle().await;
            }
        }));
    }

    /// Stop the reaper. Idempotent.
    pub fn stop(&self) {
        if let Some(task) = self.reaper_task.lock().take() {
            task.abort();
        }
    }

    /// Drive an accepted WebSocket stream as one bus connection: register,
    /// pump inbound frames, deregister on close or error.
    pub async fn serve_connection<S>(
        self: Arc<Self>,
        stream: WebSocketStream<S>,
        window_type: WindowType,
        user_id: Option<String>,
        session_id: Option<String>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, mut source) = stream.split();
        let transport = Arc::new(WsTransport::new(sink));
        let connection_id = self
            .connect(transport, window_type, user_id, session_id)
            .await?;

        while let Some(frame) = source.next().await {
            match frame {
                Ok(WsFrame::Text(text)) => {
                    if let Err(err) = self.handle_inbound(&connection_id, &text).await {
                        debug!(connection = %connection_id, error = %err, "inbound frame rejected");
                    }
                }
                Ok(WsFrame::Ping(_)) | Ok(WsFrame::Pong(_)) => {
                    if let Some(connection) = self.connection(&connection_id) {
                        connection.touch();
                    }
                }
                Ok(WsFrame::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!(connection = %connection_id, error = %err, "receive loop error");
                    break;
                }
            }
        }

        self.disconnect(&connection_id).await;
        Ok(())
    }
}

impl Default for FanoutBus {
    fn default() -> Self {
        Self::new()
    }
}

enum SlashCommand {
    Run(String),
    Spawn(String),
    Kill(String),
}

fn parse_slash_command(command: &str, args: &[String]) -> Option<SlashCommand> {
    let mut words = command.split_whitespace();
    let head = words.next()?;
    let inline: Vec<&str> = words.collect();
    let arg = |default: Option<&str>| -> Option<String> {
        inline
            .first()
            .map(|s| s.to_string())
            .or_else(|| args.first().cloned())
            .or_else(|| default.map(str::to_owned))
    };

    match head {
        "/run" => Some(SlashCommand::Run(arg(Some("default"))?)),
        "/spawn" => Some(SlashCommand::Spawn(arg(Some("general_assistant"))?)),
        "/kill" => arg(None).map(SlashCommand::Kill),
        _ => None,
    }
}
