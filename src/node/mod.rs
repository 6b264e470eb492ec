//! One Lavalink node: WebSocket session lifecycle, reconnect backoff and
//! message dispatch, plus its REST transport.

pub mod protocol;
pub mod rest;

use dashmap::DashSet;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;
use serenity::model::id::{GuildId, UserId};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::protocol::{NodeInfo, NodeStats, PlayerEvent, PlayerUpdatePayload, ReadyPayload, StatsPayload};
use self::rest::Rest;
use crate::config::{Config, NodeConfig};
use crate::error::AquaError;
use crate::events::{AquaEvent, EventBus};
use crate::player::{Player, PlayerRegistry};

/// Códigos de cierre que destruyen el nodo sin reconectar
pub const FATAL_CLOSE_CODES: [u16; 6] = [4003, 4004, 4010, 4011, 4012, 4015];
const BACKOFF_MULTIPLIER: f64 = 1.5;
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);
const JITTER_MAX_MS: f64 = 2000.0;
const JITTER_FACTOR: f64 = 0.2;
pub const INFINITE_BACKOFF: Duration = Duration::from_secs(10);
const INFO_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Disconnected,
    Connecting,
    Connected,
    Destroyed,
}

/// Reacción ante un cierre del WebSocket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    Destroy { clear_session: bool },
    Reconnect { clear_session: bool },
}

pub fn is_fatal_close(code: u16) -> bool {
    FATAL_CLOSE_CODES.contains(&code)
}

pub fn classify_close(code: u16, infinite_reconnects: bool, has_session: bool) -> CloseAction {
    let fatal = is_fatal_close(code);
    if fatal || (code == 1000 && !infinite_reconnects) {
        return CloseAction::Destroy {
            clear_session: code == 4011,
        };
    }
    CloseAction::Reconnect {
        clear_session: has_session && code != 1000 && code != 1001,
    }
}

/// `min(base * 1.5^min(attempt,10) + jitter, 60s)`, jitter en `[0, 1]`
pub fn backoff_delay(base: Duration, attempt: u32, jitter: f64) -> Duration {
    let base_ms = base.as_millis() as f64 * BACKOFF_MULTIPLIER.powi(attempt.min(10) as i32);
    let jitter_ms = jitter.clamp(0.0, 1.0) * JITTER_MAX_MS.min(base_ms * JITTER_FACTOR);
    let total = (base_ms + jitter_ms).min(MAX_BACKOFF.as_millis() as f64);
    Duration::from_millis(total as u64)
}

/// Avisos del nodo hacia el cluster
pub(crate) enum NodeSignal {
    Connected(Arc<Node>),
    Ready { node: Arc<Node>, resumed: bool },
    Disconnected(Arc<Node>),
    Failover(Arc<Node>),
    Destroyed { node: Arc<Node>, clean: bool },
}

/// Dependencias compartidas con el cluster
#[derive(Clone)]
pub(crate) struct NodeContext {
    pub client_id: UserId,
    pub config: Arc<Config>,
    pub players: PlayerRegistry,
    pub signals: mpsc::UnboundedSender<NodeSignal>,
    pub events: EventBus,
}

#[derive(Default)]
struct NodeTasks {
    socket: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GuildRef {
    guild_id: GuildId,
}

pub struct Node {
    name: String,
    options: NodeConfig,
    regions: Vec<String>,
    rest: Arc<Rest>,
    ctx: NodeContext,
    state: RwLock<NodeState>,
    stats: RwLock<NodeStats>,
    info: RwLock<Option<NodeInfo>>,
    session_id: RwLock<Option<String>>,
    reconnect_attempted: AtomicU32,
    /// Guilds cuyo player vive en este nodo
    pub(crate) guilds: DashSet<GuildId>,
    cancel: CancellationToken,
    tasks: Mutex<NodeTasks>,
    destroyed: AtomicBool,
}

impl Node {
    pub(crate) fn new(options: NodeConfig, ctx: NodeContext) -> Result<Arc<Self>, AquaError> {
        let rest = Arc::new(Rest::new(&options, &ctx.config)?);
        let regions = options.regions.iter().map(|r| r.to_ascii_lowercase()).collect();

        Ok(Arc::new(Self {
            name: options.identifier(),
            session_id: RwLock::new(options.session_id.clone()),
            regions,
            rest,
            state: RwLock::new(NodeState::Disconnected),
            stats: RwLock::new(NodeStats::default()),
            info: RwLock::new(None),
            reconnect_attempted: AtomicU32::new(0),
            guilds: DashSet::new(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(NodeTasks::default()),
            destroyed: AtomicBool::new(false),
            options,
            ctx,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == NodeState::Connected
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn rest(&self) -> &Arc<Rest> {
        &self.rest
    }

    pub fn regions(&self) -> &[String] {
        &self.regions
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    pub fn stats(&self) -> NodeStats {
        *self.stats.read()
    }

    pub fn info(&self) -> Option<NodeInfo> {
        self.info.read().clone()
    }

    pub fn is_nodelink(&self) -> bool {
        self.info.read().as_ref().is_some_and(|i| i.is_nodelink)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempted.load(Ordering::Relaxed)
    }

    pub fn player_count(&self) -> usize {
        self.guilds.len()
    }

    pub(crate) fn set_state(&self, state: NodeState) {
        let mut current = self.state.write();
        if *current != NodeState::Destroyed {
            *current = state;
        }
    }

    pub(crate) fn update_stats(&self, payload: &StatsPayload) {
        self.stats.write().merge(payload);
    }

    fn signal(&self, signal: NodeSignal) {
        let _ = self.ctx.signals.send(signal);
    }

    fn clear_session(&self) {
        *self.session_id.write() = None;
        self.rest.set_session_id(None);
    }

    /// Abre el WebSocket; no hace nada si ya está conectando o conectado
    pub fn connect(self: &Arc<Self>) {
        if self.is_destroyed() {
            return;
        }
        {
            let mut state = self.state.write();
            if matches!(
                *state,
                NodeState::Connecting | NodeState::Connected | NodeState::Destroyed
            ) {
                return;
            }
            *state = NodeState::Connecting;
        }

        debug!("Conectando nodo {} ({})", self.name, self.options.ws_url());
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run_socket().await });
        self.tasks.lock().socket = Some(handle);
    }

    fn build_request(&self) -> Result<Request, AquaError> {
        let mut request = self.options.ws_url().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert("authorization", HeaderValue::from_str(&self.options.password)?);
        headers.insert("user-id", HeaderValue::from_str(&self.ctx.client_id.to_string())?);
        headers.insert("client-name", HeaderValue::from_str(&self.ctx.config.client_name)?);
        if let Some(session_id) = self.session_id.read().as_deref() {
            headers.insert("session-id", HeaderValue::from_str(session_id)?);
        }
        Ok(request)
    }

    async fn run_socket(self: Arc<Self>) {
        let request = match self.build_request() {
            Ok(request) => request,
            Err(e) => {
                self.connect_failed(e);
                return;
            }
        };

        let max_payload = self.ctx.config.max_payload;
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(max_payload))
            .max_frame_size(Some(max_payload));
        let handshake = tokio::time::timeout(
            self.ctx.config.handshake_timeout,
            tokio_tungstenite::connect_async_with_config(request, Some(ws_config), true),
        );

        let socket = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = handshake => match result {
                Ok(Ok((socket, _))) => socket,
                Ok(Err(e)) => {
                    self.connect_failed(AquaError::from(e));
                    return;
                }
                Err(_) => {
                    self.connect_failed(AquaError::Timeout("websocket handshake"));
                    return;
                }
            }
        };

        self.handle_open().await;

        if let Some((code, reason)) = self.read_loop(socket).await {
            self.handle_close(code, &reason);
        }
    }

    fn connect_failed(self: &Arc<Self>, error: AquaError) {
        let message = error.to_string();
        self.ctx.events.emit(AquaEvent::NodeError {
            node: self.name.clone(),
            message: message.clone(),
        });
        self.handle_close(1006, &message);
    }

    async fn read_loop(self: &Arc<Self>, mut socket: Socket) -> Option<(u16, String)> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = socket.close(None).await;
                    return None;
                }
                message = socket.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_message(text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        return Some(frame.map_or((1005, String::new()), |f| {
                            (u16::from(f.code), f.reason.as_str().to_owned())
                        }));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        self.ctx.events.emit(AquaEvent::NodeError {
                            node: self.name.clone(),
                            message: e.to_string(),
                        });
                        return Some((1006, e.to_string()));
                    }
                    None => return Some((1006, "stream ended".to_string())),
                }
            }
        }
    }

    async fn handle_open(self: &Arc<Self>) {
        self.set_state(NodeState::Connected);
        self.reconnect_attempted.store(0, Ordering::Relaxed);
        info!("🟢 Nodo {} conectado", self.name);

        if self.ctx.config.fetch_node_info && self.info.read().is_none() {
            match tokio::time::timeout(INFO_FETCH_TIMEOUT, self.rest.get_info()).await {
                Ok(Ok(info)) => {
                    debug!("Nodo {} versión {}", self.name, info.version.semver);
                    *self.info.write() = Some(info);
                }
                Ok(Err(e)) => warn!("⚠️ No se pudo obtener info del nodo {}: {}", self.name, e),
                Err(_) => warn!("⚠️ Timeout obteniendo info del nodo {}", self.name),
            }
        }

        self.ctx.events.emit(AquaEvent::NodeConnect {
            node: self.name.clone(),
        });
        self.signal(NodeSignal::Connected(Arc::clone(self)));
    }

    fn player_for(self: &Arc<Self>, guild_id: GuildId) -> Option<Arc<Player>> {
        self.ctx
            .players
            .get(&guild_id)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|player| Arc::ptr_eq(player.node(), self))
    }

    pub(crate) fn handle_message(self: &Arc<Self>, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                debug!("Mensaje inválido del nodo {}: {}", self.name, e);
                return;
            }
        };
        let Some(op) = value.get("op").and_then(Value::as_str).map(str::to_owned) else {
            debug!("Mensaje sin op del nodo {}", self.name);
            return;
        };

        match op.as_str() {
            "ready" => match ReadyPayload::deserialize(&value) {
                Ok(ready) => self.handle_ready(ready),
                Err(e) => debug!("ready inválido de {}: {}", self.name, e),
            },
            "stats" => match StatsPayload::deserialize(&value) {
                Ok(stats) => self.update_stats(&stats),
                Err(e) => debug!("stats inválido de {}: {}", self.name, e),
            },
            "playerUpdate" => match PlayerUpdatePayload::deserialize(&value) {
                Ok(update) => {
                    if let Some(player) = self.player_for(update.guild_id) {
                        player.handle_player_update(update.state);
                    }
                }
                Err(e) => debug!("playerUpdate inválido de {}: {}", self.name, e),
            },
            "event" => {
                let parsed = GuildRef::deserialize(&value)
                    .and_then(|guild| PlayerEvent::deserialize(&value).map(|e| (guild.guild_id, e)));
                match parsed {
                    Ok((guild_id, event)) => {
                        if let Some(player) = self.player_for(guild_id) {
                            tokio::spawn(async move { player.handle_event(event).await });
                        }
                    }
                    Err(e) => debug!("event inválido de {}: {}", self.name, e),
                }
            }
            lyrics if lyrics.starts_with("Lyrics") => {
                let guild_id = GuildRef::deserialize(&value).ok().map(|g| g.guild_id);
                self.ctx.events.emit(AquaEvent::Lyrics {
                    guild_id,
                    op,
                    payload: value,
                });
            }
            _ => self.ctx.events.emit(AquaEvent::NodeCustomOp {
                node: self.name.clone(),
                op,
                payload: value,
            }),
        }
    }

    fn handle_ready(self: &Arc<Self>, ready: ReadyPayload) {
        *self.session_id.write() = Some(ready.session_id.clone());
        self.rest.set_session_id(Some(ready.session_id.clone()));
        info!(
            "✅ Nodo {} listo (sesión {}, reanudada: {})",
            self.name, ready.session_id, ready.resumed
        );

        self.ctx.events.emit(AquaEvent::NodeReady {
            node: self.name.clone(),
            resumed: ready.resumed,
        });
        self.signal(NodeSignal::Ready {
            node: Arc::clone(self),
            resumed: ready.resumed,
        });

        if self.ctx.config.auto_resume {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let timeout = this.ctx.config.resume_timeout;
                if let Err(e) = this.rest.update_session(true, timeout).await {
                    warn!("⚠️ No se pudo activar resume en {}: {}", this.name, e);
                }
            });
        }
    }

    pub(crate) fn handle_close(self: &Arc<Self>, code: u16, reason: &str) {
        if self.is_destroyed() {
            return;
        }
        self.set_state(NodeState::Disconnected);
        warn!("🔴 Nodo {} desconectado ({}): {}", self.name, code, reason);

        self.ctx.events.emit(AquaEvent::NodeDisconnect {
            node: self.name.clone(),
            code,
            reason: reason.to_string(),
        });
        self.signal(NodeSignal::Disconnected(Arc::clone(self)));

        let has_session = self.session_id.read().is_some();
        match classify_close(code, self.ctx.config.infinite_reconnects, has_session) {
            CloseAction::Destroy { clear_session } => {
                if clear_session {
                    self.clear_session();
                }
                if is_fatal_close(code) {
                    self.ctx.events.emit(AquaEvent::NodeError {
                        node: self.name.clone(),
                        message: format!("fatal close code {}: {}", code, reason),
                    });
                }
                self.destroy(true);
            }
            CloseAction::Reconnect { clear_session } => {
                if clear_session {
                    self.clear_session();
                }
                self.signal(NodeSignal::Failover(Arc::clone(self)));
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.is_destroyed() {
            return;
        }
        let attempt = self.reconnect_attempted.fetch_add(1, Ordering::Relaxed) + 1;
        let config = &self.ctx.config;

        let delay = if config.infinite_reconnects {
            INFINITE_BACKOFF
        } else if attempt > config.reconnect_tries {
            self.ctx.events.emit(AquaEvent::NodeError {
                node: self.name.clone(),
                message: format!("max reconnect attempts reached ({})", config.reconnect_tries),
            });
            self.destroy(true);
            return;
        } else {
            backoff_delay(config.reconnect_timeout, attempt, fastrand::f64())
        };

        info!(
            "🔄 Reconectando nodo {} en {:?} (intento {})",
            self.name, delay, attempt
        );
        self.ctx.events.emit(AquaEvent::NodeReconnect {
            node: self.name.clone(),
            attempt,
            delay,
            infinite: config.infinite_reconnects,
        });

        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(node) = weak.upgrade() {
                        node.connect();
                    }
                }
            }
        });
        if let Some(previous) = self.tasks.lock().reconnect.replace(handle) {
            previous.abort();
        }
    }

    /// Cierra el nodo de forma definitiva; `clean == false` dispara failover
    pub fn destroy(self: &Arc<Self>, clean: bool) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        {
            let mut tasks = self.tasks.lock();
            if let Some(reconnect) = tasks.reconnect.take() {
                reconnect.abort();
            }
            tasks.socket = None;
        }
        *self.state.write() = NodeState::Destroyed;
        self.rest.destroy();

        info!("🗑️ Nodo {} destruido (limpio: {})", self.name, clean);
        self.ctx.events.emit(AquaEvent::NodeDestroy {
            node: self.name.clone(),
        });
        self.signal(NodeSignal::Destroyed {
            node: Arc::clone(self),
            clean,
        });
    }
}
