//! Cluster manager: owns the node pool and the guild -> player routing, picks
//! nodes by load and reacts to node lifecycle signals (failover, rebuild).

pub mod balancer;
pub mod failover;

use anyhow::Context;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use serenity::model::event::VoiceServerUpdateEvent;
use serenity::model::id::{GuildId, UserId};
use serenity::model::voice::VoiceState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::balancer::Balancer;
use self::failover::{FailoverState, MAX_CONCURRENT_OPS};
use crate::config::{Config, NodeConfig};
use crate::error::{AquaError, AquaResult};
use crate::events::{AquaEvent, EventBus};
use crate::node::{Node, NodeContext, NodeSignal};
use crate::player::track::{LoadResult, Requester, Track};
use crate::player::{Player, PlayerContext, PlayerOptions, PlayerRegistry, PlayerSnapshot};
use crate::storage::{PlayerRecord, PlayerStorage};
use crate::voice::gateway::{GatewaySender, VoiceEvent, VoiceServerUpdate, VoiceStateEvent};
use crate::voice::pool::PayloadPool;

const INIT_TIMEOUT: Duration = Duration::from_secs(30);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_SEARCH_SOURCE: &str = "ytsearch";

/// Prefijo de búsqueda de Lavalink para un nombre de fuente
fn search_prefix(source: &str) -> String {
    let source = source.trim().to_ascii_lowercase();
    let mapped = match source.as_str() {
        "youtube" | "yt" => "ytsearch",
        "youtubemusic" | "ytmusic" | "ytm" => "ytmsearch",
        "soundcloud" | "sc" => "scsearch",
        "spotify" | "sp" => "spsearch",
        "deezer" | "dz" => "dzsearch",
        "applemusic" | "am" => "amsearch",
        other if other.ends_with("search") => other,
        other => return format!("{}search", other),
    };
    mapped.to_string()
}

/// URLs e identificadores con prefijo pasan tal cual; el resto se convierte en búsqueda
pub fn format_query(query: &str, source: &str) -> String {
    let query = query.trim();
    let has_prefix = query
        .split_once(':')
        .is_some_and(|(prefix, _)| prefix.ends_with("search") || prefix.ends_with("rec"));
    if query.starts_with("http://") || query.starts_with("https://") || has_prefix {
        return query.to_string();
    }
    format!("{}:{}", search_prefix(source), query)
}

/// Cliente Lavalink multi-nodo
pub struct Aqua {
    config: Arc<Config>,
    client_id: UserId,
    gateway: Arc<dyn GatewaySender>,
    events: EventBus,
    nodes: RwLock<Vec<Arc<Node>>>,
    players: PlayerRegistry,
    pool: Arc<PayloadPool>,
    balancer: Balancer,
    failover: FailoverState,
    signals_tx: mpsc::UnboundedSender<NodeSignal>,
    signals_rx: Mutex<Option<mpsc::UnboundedReceiver<NodeSignal>>>,
    connected_count: watch::Sender<usize>,
    initiated: AtomicBool,
    destroyed: AtomicBool,
    cancel: CancellationToken,
    storage: PlayerStorage,
}

impl Aqua {
    pub fn new(config: Config, client_id: UserId, gateway: Arc<dyn GatewaySender>) -> Arc<Self> {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let storage = PlayerStorage::new(config.players_file.clone());
        let balancer = Balancer::new(config.load_balancer);

        Arc::new(Self {
            config: Arc::new(config),
            client_id,
            gateway,
            events: EventBus::new(),
            nodes: RwLock::new(Vec::new()),
            players: PlayerRegistry::default(),
            pool: Arc::new(PayloadPool::default()),
            balancer,
            failover: FailoverState::default(),
            signals_tx,
            signals_rx: Mutex::new(Some(signals_rx)),
            connected_count: watch::Sender::new(0),
            initiated: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            storage,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn client_id(&self) -> UserId {
        self.client_id
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().clone()
    }

    pub fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.read().iter().find(|n| n.name() == name).cloned()
    }

    pub fn players(&self) -> Vec<Arc<Player>> {
        self.players.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn get_player(&self, guild_id: GuildId) -> Option<Arc<Player>> {
        self.players.get(&guild_id).map(|e| Arc::clone(e.value()))
    }

    /// Conecta los nodos configurados y espera al primero disponible
    pub async fn init(self: &Arc<Self>) -> AquaResult<()> {
        if self.is_destroyed() {
            return Err(AquaError::NotInitialized);
        }
        if self.initiated.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.start_signal_loop();
        self.start_cleanup_loop();

        for options in self.config.nodes.clone() {
            let identifier = options.identifier();
            if let Err(e) = self.add_node(options) {
                self.events
                    .error(format!("No se pudo crear el nodo {}: {}", identifier, e));
            }
        }
        if self.nodes.read().is_empty() {
            return Err(AquaError::NoNodesAvailable);
        }

        let mut connected = self.connected_count.subscribe();
        let ready = tokio::time::timeout(INIT_TIMEOUT, connected.wait_for(|count| *count > 0))
            .await
            .is_ok_and(|waited| waited.is_ok());
        if !ready {
            return Err(AquaError::NoNodesConnected(INIT_TIMEOUT));
        }
        info!("🌊 Aqua listo: {} nodos registrados", self.nodes.read().len());
        Ok(())
    }

    fn ensure_ready(&self) -> AquaResult<()> {
        if self.is_destroyed() || !self.initiated.load(Ordering::Acquire) {
            return Err(AquaError::NotInitialized);
        }
        Ok(())
    }

    fn node_context(&self) -> NodeContext {
        NodeContext {
            client_id: self.client_id,
            config: Arc::clone(&self.config),
            players: Arc::clone(&self.players),
            signals: self.signals_tx.clone(),
            events: self.events.clone(),
        }
    }

    fn player_context(&self) -> PlayerContext {
        PlayerContext {
            client_id: self.client_id,
            gateway: Arc::clone(&self.gateway),
            events: self.events.clone(),
            registry: Arc::downgrade(&self.players),
            pool: Arc::clone(&self.pool),
            default_volume: self.config.default_volume,
        }
    }

    // ---- Nodos ----

    /// Registra el nodo sin conectarlo; un nombre ya activo devuelve el existente
    pub(crate) fn insert_node(&self, options: NodeConfig) -> AquaResult<Arc<Node>> {
        let name = options.identifier();
        let mut nodes = self.nodes.write();
        if let Some(existing) = nodes.iter().find(|n| n.name() == name && !n.is_destroyed()) {
            return Ok(Arc::clone(existing));
        }
        let node = Node::new(options, self.node_context())?;
        nodes.retain(|n| n.name() != name);
        nodes.push(Arc::clone(&node));
        drop(nodes);

        self.balancer.forget(&name);
        self.events.emit(AquaEvent::NodeCreate { node: name });
        Ok(node)
    }

    pub fn add_node(&self, options: NodeConfig) -> AquaResult<Arc<Node>> {
        if self.is_destroyed() {
            return Err(AquaError::NotInitialized);
        }
        let node = self.insert_node(options)?;
        node.connect();
        Ok(node)
    }

    /// Quita el nodo de forma limpia (sin failover)
    pub fn destroy_node(&self, name: &str) -> AquaResult<()> {
        let node = self
            .node(name)
            .ok_or_else(|| AquaError::NodeNotFound(name.to_string()))?;
        node.destroy(true);
        self.remove_node(&node);
        Ok(())
    }

    fn remove_node(&self, node: &Arc<Node>) {
        let removed = {
            let mut nodes = self.nodes.write();
            let before = nodes.len();
            nodes.retain(|n| !Arc::ptr_eq(n, node));
            before != nodes.len()
        };
        self.balancer.forget(node.name());
        self.refresh_connected_count();

        let leftovers: Vec<Arc<Player>> = self
            .players
            .iter()
            .filter(|e| Arc::ptr_eq(e.value().node(), node))
            .map(|e| Arc::clone(e.value()))
            .collect();
        for player in leftovers {
            player.destroy(false);
        }
        if removed {
            info!("Nodo {} eliminado del cluster", node.name());
        }
    }

    fn refresh_connected_count(&self) {
        let connected = self.nodes.read().iter().filter(|n| n.is_connected()).count();
        self.connected_count.send_replace(connected);
    }

    pub fn least_used_nodes(&self) -> Vec<Arc<Node>> {
        self.balancer.least_used(&self.nodes())
    }

    /// Nodos conectados de una región, ordenados por carga
    pub fn fetch_region(&self, region: &str) -> Vec<Arc<Node>> {
        self.balancer.by_region(&self.nodes(), region)
    }

    fn select_node(&self, region: Option<&str>) -> AquaResult<Arc<Node>> {
        if let Some(region) = region {
            if let Some(node) = self.fetch_region(region).into_iter().next() {
                return Ok(node);
            }
            debug!("Sin nodos en la región {}, usando el menos cargado", region);
        }
        self.least_used_nodes()
            .into_iter()
            .next()
            .ok_or(AquaError::NoNodesAvailable)
    }

    // ---- Señales de los nodos ----

    fn start_signal_loop(self: &Arc<Self>) {
        let Some(mut rx) = self.signals_rx.lock().take() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    signal = rx.recv() => {
                        let Some(signal) = signal else { break };
                        let Some(aqua) = weak.upgrade() else { break };
                        aqua.handle_signal(signal);
                    }
                }
            }
            debug!("Bucle de señales del cluster terminado");
        });
    }

    fn start_cleanup_loop(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(aqua) = weak.upgrade() else { break };
                        aqua.perform_cleanup();
                    }
                }
            }
        });
    }

    pub(crate) fn handle_signal(self: &Arc<Self>, signal: NodeSignal) {
        if self.is_destroyed() {
            return;
        }
        match signal {
            NodeSignal::Connected(node) => {
                self.balancer.invalidate();
                self.failover.reset_attempts(node.name());
                self.refresh_connected_count();
                self.perform_cleanup();
            }
            NodeSignal::Ready { node, resumed } => {
                if resumed {
                    let mut resent = 0;
                    for player in self.players() {
                        if Arc::ptr_eq(player.node(), &node) && player.connection().resend_voice_update() {
                            resent += 1;
                        }
                    }
                    debug!("Sesión de {} reanudada, {} voice updates reenviados", node.name(), resent);
                }
                let aqua = Arc::clone(self);
                tokio::spawn(async move {
                    aqua.rebuild_broken_players(node, resumed).await;
                });
            }
            NodeSignal::Disconnected(node) => {
                self.balancer.invalidate();
                self.refresh_connected_count();
                self.store_broken_players(&node);
            }
            NodeSignal::Failover(node) => {
                let aqua = Arc::clone(self);
                tokio::spawn(async move {
                    aqua.handle_node_failover(node).await;
                });
            }
            NodeSignal::Destroyed { node, clean } => {
                self.balancer.invalidate();
                let aqua = Arc::clone(self);
                tokio::spawn(async move {
                    if !clean {
                        aqua.handle_node_failover(Arc::clone(&node)).await;
                    }
                    aqua.remove_node(&node);
                });
            }
        }
    }

    // ---- Players ----

    /// Devuelve el player de la guild o crea uno en el nodo más adecuado
    pub fn create_connection(&self, options: PlayerOptions) -> AquaResult<Arc<Player>> {
        self.ensure_ready()?;
        if let Some(existing) = self.get_player(options.guild_id).filter(|p| !p.is_destroyed()) {
            if let Some(text) = options.text_channel {
                existing.set_text_channel(text);
            }
            if existing.voice_channel() != Some(options.voice_channel) {
                existing.set_voice_channel(options.voice_channel)?;
            }
            return Ok(existing);
        }

        let node = self.select_node(options.region.as_deref())?;
        self.create_player(node, options)
    }

    /// Crea el player en un nodo concreto y se une al canal de voz
    pub fn create_player(&self, node: Arc<Node>, options: PlayerOptions) -> AquaResult<Arc<Player>> {
        self.ensure_ready()?;
        if !node.is_connected() {
            return Err(AquaError::NodeUnavailable(node.name().to_string()));
        }
        let player = self.install_player(node, &options);
        if let Err(e) = player.connect() {
            player.destroy(true);
            return Err(e);
        }
        Ok(player)
    }

    /// Registra un player nuevo; el anterior de la guild queda destruido
    pub(crate) fn install_player(&self, node: Arc<Node>, options: &PlayerOptions) -> Arc<Player> {
        let guild_id = options.guild_id;
        let player = Player::new(options, Arc::clone(&node), self.player_context());

        if let Some(previous) = self.players.insert(guild_id, Arc::clone(&player)) {
            let previous_node = Arc::clone(previous.node());
            previous.destroy(true);
            if !Arc::ptr_eq(&previous_node, &node) && previous_node.is_connected() {
                tokio::spawn(async move {
                    if let Err(e) = previous_node.rest().destroy_player(guild_id).await {
                        debug!("No se pudo borrar el player {} en {}: {}", guild_id, previous_node.name(), e);
                    }
                });
            }
        }
        node.guilds.insert(guild_id);

        debug!("Player de guild {} creado en {}", guild_id, node.name());
        self.events.emit(AquaEvent::PlayerCreate {
            guild_id,
            node: node.name().to_string(),
        });
        player
    }

    pub fn destroy_player(&self, guild_id: GuildId) -> AquaResult<()> {
        let (_, player) = self
            .players
            .remove(&guild_id)
            .ok_or(AquaError::PlayerNotFound(guild_id))?;
        player.destroy(false);
        Ok(())
    }

    /// Carga tracks; las consultas que no son URL se buscan en `source`
    pub async fn resolve(
        &self,
        query: &str,
        source: Option<&str>,
        requester: Option<Requester>,
        node: Option<Arc<Node>>,
    ) -> AquaResult<LoadResult> {
        let node = match node {
            Some(node) => node,
            None => self
                .least_used_nodes()
                .into_iter()
                .next()
                .ok_or(AquaError::NoNodesAvailable)?,
        };
        let identifier = format_query(query, source.unwrap_or(DEFAULT_SEARCH_SOURCE));
        let mut result = node.rest().load_tracks(&identifier).await?;
        result.attach_requester(&requester);
        Ok(result)
    }

    // ---- Voz ----

    /// Entrega un evento de voz del gateway a la guild correspondiente
    pub fn update_voice_state(&self, event: &VoiceEvent) -> bool {
        let Some(player) = self.get_player(event.guild_id()) else {
            return false;
        };
        match event {
            VoiceEvent::Server(update) => {
                player
                    .connection()
                    .set_server_update(update.endpoint.as_deref(), &update.token);
            }
            VoiceEvent::State(state) => {
                if state.user_id != self.client_id {
                    return false;
                }
                player.connection().set_state_update(state);
            }
        }
        true
    }

    /// Paquete crudo del gateway (`t` y `d`)
    pub fn update_voice_state_raw(&self, kind: &str, data: &Value) -> bool {
        VoiceEvent::from_raw(kind, data).is_some_and(|event| self.update_voice_state(&event))
    }

    pub fn handle_voice_server_update(&self, event: &VoiceServerUpdateEvent) -> bool {
        match VoiceServerUpdate::try_from(event) {
            Ok(update) => self.update_voice_state(&VoiceEvent::Server(update)),
            Err(e) => {
                debug!("Voice server update ignorado: {}", e);
                false
            }
        }
    }

    pub fn handle_voice_state_update(&self, state: &VoiceState) -> bool {
        match VoiceStateEvent::try_from(state) {
            Ok(event) => self.update_voice_state(&VoiceEvent::State(event)),
            Err(e) => {
                debug!("Voice state update ignorado: {}", e);
                false
            }
        }
    }

    // ---- Snapshots y persistencia ----

    pub fn capture_player(&self, guild_id: GuildId) -> Option<PlayerSnapshot> {
        self.get_player(guild_id)
            .filter(|p| !p.is_destroyed())
            .map(|p| p.capture())
    }

    /// Recrea un player a partir de un snapshot
    pub async fn restore_player(
        self: &Arc<Self>,
        snapshot: &PlayerSnapshot,
        node: Option<Arc<Node>>,
    ) -> AquaResult<Arc<Player>> {
        self.restore_with(snapshot, node, false).await
    }

    async fn restore_with(
        self: &Arc<Self>,
        snapshot: &PlayerSnapshot,
        node: Option<Arc<Node>>,
        resuming: bool,
    ) -> AquaResult<Arc<Player>> {
        self.ensure_ready()?;
        let node = match node {
            Some(node) => node,
            None => self.select_node(None)?,
        };
        let mut options = snapshot.options().ok_or_else(|| {
            AquaError::Gateway(format!("guild {} has no voice channel", snapshot.guild_id))
        })?;
        options.resuming = resuming;

        let player = self.install_player(node, &options);
        if let Err(e) = player.connect() {
            player.destroy(true);
            return Err(e);
        }
        self.restore_state(&player, snapshot).await;
        Ok(player)
    }

    /// Guarda todos los players en el archivo NDJSON
    pub async fn save_players(&self) -> anyhow::Result<usize> {
        let records: Vec<PlayerRecord> = self
            .players()
            .iter()
            .filter(|p| !p.is_destroyed())
            .map(|p| PlayerRecord::from_snapshot(&p.capture()))
            .filter(|r| r.voice_channel.is_some())
            .collect();
        self.storage.save(&records).await?;
        Ok(records.len())
    }

    /// Restaura los players guardados; los tracks se vuelven a resolver por URI
    pub async fn load_players(self: &Arc<Self>) -> anyhow::Result<usize> {
        let records = self.storage.load().await?;
        let mut restored = 0;
        for chunk in records.chunks(MAX_CONCURRENT_OPS) {
            let batch = chunk.iter().map(|record| self.restore_record(record));
            for (record, result) in chunk.iter().zip(join_all(batch).await) {
                match result {
                    Ok(()) => restored += 1,
                    Err(e) => warn!("⚠️ No se pudo restaurar guild {}: {:#}", record.guild_id, e),
                }
            }
        }
        if restored > 0 {
            info!("📂 {} players restaurados", restored);
        }
        Ok(restored)
    }

    async fn resolve_uri(&self, uri: &str, requester: &Option<Requester>) -> Option<Track> {
        match self.resolve(uri, None, requester.clone(), None).await {
            Ok(result) => result.into_tracks().into_iter().next(),
            Err(e) => {
                debug!("No se pudo resolver {}: {}", uri, e);
                None
            }
        }
    }

    async fn restore_record(self: &Arc<Self>, record: &PlayerRecord) -> anyhow::Result<()> {
        let voice_channel = record
            .voice_channel
            .context("saved player has no voice channel")?;
        let requester = record.requester();

        let current = match record.current_uri.as_deref() {
            Some(uri) => self.resolve_uri(uri, &requester).await,
            None => None,
        };
        let mut queue = Vec::with_capacity(record.queue.len());
        for uri in &record.queue {
            if let Some(track) = self.resolve_uri(uri, &requester).await {
                queue.push(track);
            }
        }

        let snapshot = PlayerSnapshot {
            guild_id: record.guild_id,
            text_channel: record.text_channel,
            voice_channel: Some(voice_channel),
            volume: record.volume,
            paused: record.paused,
            playing: record.playing,
            position: record.position,
            loop_mode: record.loop_mode,
            deaf: true,
            mute: false,
            current,
            queue,
            captured_at: chrono::DateTime::from_timestamp_millis(record.timestamp)
                .unwrap_or_else(chrono::Utc::now),
        };
        self.restore_with(&snapshot, None, record.resuming)
            .await
            .with_context(|| format!("restoring guild {}", record.guild_id))?;
        Ok(())
    }

    /// Cierra todos los players y nodos
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();

        for player in self.players() {
            player.destroy(false);
        }
        self.players.clear();

        let nodes: Vec<Arc<Node>> = std::mem::take(&mut *self.nodes.write());
        for node in nodes {
            node.destroy(true);
        }
        self.balancer.clear();
        self.connected_count.send_replace(0);
        info!("🌊 Aqua destruido");
    }
}

impl Drop for Aqua {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::drain;
    use crate::node::NodeState;
    use crate::player::queue::LoopMode;
    use crate::player::track::test_track;
    use crate::voice::gateway::{GatewayPayload, MockGatewaySender};
    use pretty_assertions::assert_eq;
    use serenity::model::id::ChannelId;

    pub(crate) fn test_aqua_with(config: Config, gateway: Arc<dyn GatewaySender>) -> Arc<Aqua> {
        let aqua = Aqua::new(config, UserId::new(99), gateway);
        aqua.initiated.store(true, Ordering::Release);
        aqua
    }

    pub(crate) fn test_aqua() -> Arc<Aqua> {
        let mut gateway = MockGatewaySender::new();
        gateway.expect_send().returning(|_| Ok(()));
        test_aqua_with(Config::default(), Arc::new(gateway))
    }

    pub(crate) fn test_node(aqua: &Aqua, name: &str, connected: bool) -> Arc<Node> {
        let node = aqua
            .insert_node(NodeConfig::new("127.0.0.1", 9, "pw").with_name(name))
            .unwrap();
        if connected {
            node.set_state(NodeState::Connected);
        }
        node
    }

    fn names(nodes: &[Arc<Node>]) -> Vec<String> {
        nodes.iter().map(|n| n.name().to_string()).collect()
    }

    #[test]
    fn test_format_query() {
        assert_eq!(format_query("never gonna", "youtube"), "ytsearch:never gonna");
        assert_eq!(format_query(" lofi ", "ytmusic"), "ytmsearch:lofi");
        assert_eq!(format_query("song", "scsearch"), "scsearch:song");
        assert_eq!(format_query("song", "bandcamp"), "bandcampsearch:song");
        assert_eq!(
            format_query("https://youtu.be/dQw4w9WgXcQ", "soundcloud"),
            "https://youtu.be/dQw4w9WgXcQ"
        );
        assert_eq!(format_query("spsearch:daft punk", "youtube"), "spsearch:daft punk");
    }

    #[tokio::test]
    async fn test_requires_init() {
        let mut gateway = MockGatewaySender::new();
        gateway.expect_send().never();
        let aqua = Aqua::new(Config::default(), UserId::new(99), Arc::new(gateway));
        let result = aqua.create_connection(PlayerOptions::new(GuildId::new(1), ChannelId::new(2)));
        assert!(matches!(result, Err(AquaError::NotInitialized)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_times_out_without_connected_nodes() {
        let mut config = Config::default();
        config.nodes = vec![NodeConfig::new("127.0.0.1", 9, "pw").with_name("down")];
        let aqua = test_aqua_with(config, Arc::new(MockGatewaySender::new()));
        aqua.initiated.store(false, Ordering::Release);

        let result = aqua.init().await;
        assert!(matches!(result, Err(AquaError::NoNodesConnected(timeout)) if timeout == INIT_TIMEOUT));
        aqua.destroy();
    }

    #[tokio::test]
    async fn test_create_connection_needs_connected_node() {
        let aqua = test_aqua();
        test_node(&aqua, "a", false);
        let result = aqua.create_connection(PlayerOptions::new(GuildId::new(1), ChannelId::new(2)));
        assert!(matches!(result, Err(AquaError::NoNodesAvailable)));
    }

    #[tokio::test]
    async fn test_create_connection_joins_and_reuses() {
        let (tx, mut rx) = mpsc::unbounded_channel::<GatewayPayload>();
        let aqua = test_aqua_with(Config::default(), Arc::new(tx));
        let node = test_node(&aqua, "a", true);

        let options = PlayerOptions::new(GuildId::new(5), ChannelId::new(50));
        let player = aqua.create_connection(options.clone()).unwrap();
        assert!(Arc::ptr_eq(player.node(), &node));
        assert_eq!(node.player_count(), 1);

        let join = rx.try_recv().unwrap();
        assert_eq!(join.op, 4);
        assert_eq!(join.d.guild_id, GuildId::new(5));
        assert_eq!(join.d.channel_id, Some(ChannelId::new(50)));
        assert!(join.d.self_deaf);

        let moved = aqua
            .create_connection(PlayerOptions::new(GuildId::new(5), ChannelId::new(51)))
            .unwrap();
        assert!(Arc::ptr_eq(&moved, &player));
        assert_eq!(rx.try_recv().unwrap().d.channel_id, Some(ChannelId::new(51)));
    }

    #[tokio::test]
    async fn test_region_selection_falls_back() {
        let aqua = test_aqua();
        let mut eu = NodeConfig::new("127.0.0.1", 9, "pw").with_name("eu");
        eu.regions = vec!["europe".to_string()];
        aqua.insert_node(eu).unwrap().set_state(NodeState::Connected);
        test_node(&aqua, "plain", true);

        assert_eq!(names(&aqua.fetch_region("europe")), vec!["eu"]);
        let eu_player = aqua
            .create_connection(
                PlayerOptions::new(GuildId::new(1), ChannelId::new(10)).with_region("Europe"),
            )
            .unwrap();
        assert_eq!(eu_player.node().name(), "eu");

        let fallback = aqua
            .create_connection(PlayerOptions::new(GuildId::new(2), ChannelId::new(20)).with_region("asia"))
            .unwrap();
        assert!(aqua.nodes().iter().any(|n| Arc::ptr_eq(n, fallback.node())));
    }

    #[tokio::test]
    async fn test_disconnect_signal_invalidates_least_used() {
        let aqua = test_aqua();
        let a = test_node(&aqua, "a", true);
        test_node(&aqua, "b", true);
        assert_eq!(aqua.least_used_nodes().len(), 2);

        a.set_state(NodeState::Disconnected);
        assert_eq!(aqua.least_used_nodes().len(), 2);

        aqua.handle_signal(NodeSignal::Disconnected(Arc::clone(&a)));
        assert_eq!(names(&aqua.least_used_nodes()), vec!["b"]);
        assert_eq!(*aqua.connected_count.borrow(), 1);
    }

    #[tokio::test]
    async fn test_installing_supersedes_previous_player() {
        let aqua = test_aqua();
        let node = test_node(&aqua, "a", true);
        let options = PlayerOptions::new(GuildId::new(3), ChannelId::new(30));
        let first = aqua.install_player(Arc::clone(&node), &options);
        let second = aqua.install_player(Arc::clone(&node), &options);

        assert!(first.is_destroyed());
        assert!(Arc::ptr_eq(&aqua.get_player(GuildId::new(3)).unwrap(), &second));
        assert_eq!(aqua.players().len(), 1);
        assert_eq!(node.player_count(), 1);
    }

    #[tokio::test]
    async fn test_capture_restore_on_other_node() {
        let aqua = test_aqua();
        let a = test_node(&aqua, "a", true);
        let b = test_node(&aqua, "b", true);

        let options = PlayerOptions::new(GuildId::new(8), ChannelId::new(80))
            .with_text_channel(ChannelId::new(81))
            .with_volume(65);
        let original = aqua.create_player(Arc::clone(&a), options).unwrap();
        original.add_many(vec![test_track("1", 1000), test_track("2", 1000), test_track("3", 1000)]);
        original.set_loop(LoopMode::Queue);

        let snapshot = aqua.capture_player(GuildId::new(8)).unwrap();
        let restored = aqua.restore_player(&snapshot, Some(Arc::clone(&b))).await.unwrap();

        assert!(original.is_destroyed());
        assert!(Arc::ptr_eq(restored.node(), &b));
        assert_eq!(restored.voice_channel(), Some(ChannelId::new(80)));
        assert_eq!(restored.text_channel(), Some(ChannelId::new(81)));
        assert_eq!(restored.volume(), 65);
        assert_eq!(restored.is_paused(), snapshot.paused);
        assert_eq!(restored.loop_mode(), LoopMode::Queue);
        let order: Vec<String> = restored
            .queue_head(10)
            .into_iter()
            .map(|t| t.info.identifier)
            .collect();
        assert_eq!(order, vec!["1", "2", "3"]);
        assert_eq!((a.player_count(), b.player_count()), (0, 1));
    }

    #[tokio::test]
    async fn test_voice_events_are_routed() {
        let aqua = test_aqua();
        let node = test_node(&aqua, "a", true);
        let player = aqua
            .create_player(node, PlayerOptions::new(GuildId::new(4), ChannelId::new(40)))
            .unwrap();

        let foreign = serde_json::json!({
            "guild_id": "4", "user_id": "1234", "channel_id": "40", "session_id": "s"
        });
        assert!(!aqua.update_voice_state_raw("VOICE_STATE_UPDATE", &foreign));

        let unknown_guild = serde_json::json!({ "guild_id": "77", "token": "t", "endpoint": "x" });
        assert!(!aqua.update_voice_state_raw("VOICE_SERVER_UPDATE", &unknown_guild));
        assert!(!aqua.update_voice_state_raw("MESSAGE_CREATE", &foreign));

        let own = serde_json::json!({
            "guild_id": "4", "user_id": "99", "channel_id": "40", "session_id": "sess"
        });
        assert!(aqua.update_voice_state_raw("VOICE_STATE_UPDATE", &own));
        assert_eq!(player.connection().session_id().as_deref(), Some("sess"));

        let server = serde_json::json!({
            "guild_id": "4", "token": "tok", "endpoint": "us-east12.discord.media:443"
        });
        assert!(aqua.update_voice_state_raw("VOICE_SERVER_UPDATE", &server));
        assert_eq!(player.connection().region().as_deref(), Some("us-east"));
    }

    #[tokio::test]
    async fn test_destroy_node_drops_its_players() {
        let aqua = test_aqua();
        let a = test_node(&aqua, "a", true);
        let b = test_node(&aqua, "b", true);
        let on_a = aqua
            .create_player(Arc::clone(&a), PlayerOptions::new(GuildId::new(1), ChannelId::new(10)))
            .unwrap();
        let on_b = aqua
            .create_player(Arc::clone(&b), PlayerOptions::new(GuildId::new(2), ChannelId::new(20)))
            .unwrap();
        let mut events = aqua.events().subscribe();

        aqua.destroy_node("a").unwrap();
        assert!(a.is_destroyed());
        assert!(on_a.is_destroyed());
        assert!(!on_b.is_destroyed());
        assert_eq!(names(&aqua.nodes()), vec!["b"]);
        assert!(matches!(aqua.destroy_node("a"), Err(AquaError::NodeNotFound(_))));

        let destroyed = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, AquaEvent::NodeDestroy { .. }))
            .count();
        assert_eq!(destroyed, 1);
    }

    #[tokio::test]
    async fn test_save_players_writes_records() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            players_file: dir.path().join("players.jsonl"),
            ..Config::default()
        };
        let mut gateway = MockGatewaySender::new();
        gateway.expect_send().returning(|_| Ok(()));
        let aqua = test_aqua_with(config, Arc::new(gateway));
        let node = test_node(&aqua, "a", true);
        let player = aqua
            .create_player(node, PlayerOptions::new(GuildId::new(6), ChannelId::new(60)))
            .unwrap();
        player.add(test_track("q", 1000));

        assert_eq!(aqua.save_players().await.unwrap(), 1);
        let records = PlayerStorage::new(dir.path().join("players.jsonl")).load().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].guild_id, GuildId::new(6));
        assert_eq!(records[0].queue, vec!["https://example.com/q".to_string()]);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let aqua = test_aqua();
        let node = test_node(&aqua, "a", true);
        let player = aqua
            .create_player(Arc::clone(&node), PlayerOptions::new(GuildId::new(1), ChannelId::new(10)))
            .unwrap();
        aqua.destroy();
        aqua.destroy();
        assert!(player.is_destroyed());
        assert!(node.is_destroyed());
        assert!(aqua.nodes().is_empty());
        assert!(matches!(
            aqua.create_connection(PlayerOptions::new(GuildId::new(1), ChannelId::new(10))),
            Err(AquaError::NotInitialized)
        ));
    }
}
