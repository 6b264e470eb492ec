//! Guild session: playback state bound to one node, its voice session
//! and the handling of node player events.

pub mod queue;
pub mod track;

use dashmap::DashMap;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::queue::{LoopMode, Queue};
use self::track::Track;
use crate::error::{AquaError, AquaResult};
use crate::events::{AquaEvent, EventBus};
use crate::node::protocol::{PlayerEvent, PlayerUpdateState, TrackEndReason, UpdatePlayer};
use crate::node::rest::PlayerTransport;
use crate::node::Node;
use crate::voice::connection::{Connection, VoiceOwner};
use crate::voice::gateway::{GatewayPayload, GatewaySender, VoiceStateRequest};
use crate::voice::pool::PayloadPool;

pub type PlayerRegistry = Arc<DashMap<GuildId, Arc<Player>>>;

pub const MAX_VOLUME: u16 = 200;
const PLAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(15);
const VOICE_DOWN_THRESHOLD: Duration = Duration::from_secs(10);
const VOICE_ABANDON_AFTER: Duration = Duration::from_secs(30);
const VOICE_DOWN_RESUME_DELAY: Duration = Duration::from_secs(1);
const MAX_VOICE_RECOVERIES: u32 = 3;
const MUTE_TOGGLE_DELAY: Duration = Duration::from_millis(300);
pub(crate) const SEEK_DELAY: Duration = Duration::from_millis(120);

/// Parámetros para crear un player
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerOptions {
    pub guild_id: GuildId,
    pub voice_channel: ChannelId,
    pub text_channel: Option<ChannelId>,
    pub deaf: bool,
    pub mute: bool,
    pub volume: Option<u16>,
    pub region: Option<String>,
    pub resuming: bool,
}

impl PlayerOptions {
    pub fn new(guild_id: GuildId, voice_channel: ChannelId) -> Self {
        Self {
            guild_id,
            voice_channel,
            text_channel: None,
            deaf: true,
            mute: false,
            volume: None,
            region: None,
            resuming: false,
        }
    }

    pub fn with_text_channel(mut self, channel: ChannelId) -> Self {
        self.text_channel = Some(channel);
        self
    }

    pub fn with_volume(mut self, volume: u16) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

/// Estado capturado de un player, suficiente para recrearlo en otro nodo
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerSnapshot {
    pub guild_id: GuildId,
    pub text_channel: Option<ChannelId>,
    pub voice_channel: Option<ChannelId>,
    pub volume: u16,
    pub paused: bool,
    pub playing: bool,
    pub position: u64,
    pub loop_mode: LoopMode,
    pub deaf: bool,
    pub mute: bool,
    pub current: Option<Track>,
    pub queue: Vec<Track>,
    pub captured_at: chrono::DateTime<chrono::Utc>,
}

impl PlayerSnapshot {
    pub fn options(&self) -> Option<PlayerOptions> {
        let voice_channel = self.voice_channel?;
        Some(PlayerOptions {
            guild_id: self.guild_id,
            voice_channel,
            text_channel: self.text_channel,
            deaf: self.deaf,
            mute: self.mute,
            volume: Some(self.volume),
            region: None,
            resuming: false,
        })
    }
}

/// Dependencias que el cluster entrega a cada player
#[derive(Clone)]
pub(crate) struct PlayerContext {
    pub client_id: UserId,
    pub gateway: Arc<dyn GatewaySender>,
    pub events: EventBus,
    pub registry: Weak<DashMap<GuildId, Arc<Player>>>,
    pub pool: Arc<PayloadPool>,
    pub default_volume: u16,
}

#[derive(Debug)]
struct PlayerState {
    text_channel: Option<ChannelId>,
    voice_channel: Option<ChannelId>,
    current: Option<Track>,
    previous: Option<Track>,
    queue: Queue,
    position: u64,
    timestamp: u64,
    ping: i64,
    volume: u16,
    paused: bool,
    playing: bool,
    deaf: bool,
    mute: bool,
    loop_mode: LoopMode,
    voice_down_since: Option<Instant>,
    recovery_attempts: u32,
    recovering: bool,
}

pub struct Player {
    guild_id: GuildId,
    node: Arc<Node>,
    transport: Arc<dyn PlayerTransport>,
    connection: Arc<Connection>,
    gateway: Arc<dyn GatewaySender>,
    events: EventBus,
    registry: Weak<DashMap<GuildId, Arc<Player>>>,
    state: Mutex<PlayerState>,
    connected: watch::Sender<bool>,
    resuming: AtomicBool,
    destroyed: AtomicBool,
    cancel: CancellationToken,
}

impl Player {
    pub(crate) fn new(options: &PlayerOptions, node: Arc<Node>, ctx: PlayerContext) -> Arc<Self> {
        let transport: Arc<dyn PlayerTransport> = node.rest().clone();
        Self::with_transport(options, node, transport, ctx)
    }

    pub(crate) fn with_transport(
        options: &PlayerOptions,
        node: Arc<Node>,
        transport: Arc<dyn PlayerTransport>,
        ctx: PlayerContext,
    ) -> Arc<Self> {
        let volume = options.volume.unwrap_or(ctx.default_volume).min(MAX_VOLUME);
        let player = Arc::new_cyclic(|weak: &Weak<Player>| {
            let owner: Weak<dyn VoiceOwner> = weak.clone();
            let connection = Connection::new(
                options.guild_id,
                ctx.client_id,
                Arc::clone(&transport),
                owner,
                ctx.pool,
                ctx.events.clone(),
            );
            connection.set_voice_channel(Some(options.voice_channel));

            Player {
                guild_id: options.guild_id,
                node,
                transport,
                connection,
                gateway: ctx.gateway,
                events: ctx.events,
                registry: ctx.registry,
                state: Mutex::new(PlayerState {
                    text_channel: options.text_channel,
                    voice_channel: Some(options.voice_channel),
                    current: None,
                    previous: None,
                    queue: Queue::new(),
                    position: 0,
                    timestamp: 0,
                    ping: 0,
                    volume,
                    paused: false,
                    playing: false,
                    deaf: options.deaf,
                    mute: options.mute,
                    loop_mode: LoopMode::None,
                    voice_down_since: None,
                    recovery_attempts: 0,
                    recovering: false,
                }),
                connected: watch::Sender::new(false),
                resuming: AtomicBool::new(options.resuming),
                destroyed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }
        });
        player.start_watchdog();
        player
    }

    // ---- Accesores ----

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn volume(&self) -> u16 {
        self.state.lock().volume
    }

    pub fn position(&self) -> u64 {
        self.state.lock().position
    }

    pub fn ping(&self) -> i64 {
        self.state.lock().ping
    }

    /// `time` del último playerUpdate del nodo
    pub fn last_update_time(&self) -> u64 {
        self.state.lock().timestamp
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.state.lock().loop_mode
    }

    pub fn voice_channel(&self) -> Option<ChannelId> {
        self.state.lock().voice_channel
    }

    pub fn text_channel(&self) -> Option<ChannelId> {
        self.state.lock().text_channel
    }

    pub fn current(&self) -> Option<Track> {
        self.state.lock().current.clone()
    }

    pub fn previous(&self) -> Option<Track> {
        self.state.lock().previous.clone()
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn queue_head(&self, limit: usize) -> Vec<Track> {
        self.state.lock().queue.head(limit)
    }

    pub fn set_resuming(&self, resuming: bool) {
        self.resuming.store(resuming, Ordering::Release);
    }

    // ---- Cola ----

    pub fn add(&self, track: Track) {
        self.state.lock().queue.push(track);
    }

    pub fn add_many(&self, tracks: impl IntoIterator<Item = Track>) -> usize {
        self.state.lock().queue.extend(tracks)
    }

    pub fn add_front(&self, track: Track) {
        self.state.lock().queue.push_front(track);
    }

    pub fn remove(&self, index: usize) -> Option<Track> {
        self.state.lock().queue.remove(index)
    }

    pub fn clear_queue(&self) {
        self.state.lock().queue.clear();
    }

    pub fn shuffle(&self) {
        self.state.lock().queue.shuffle();
    }

    // ---- Gateway ----

    fn send_voice_state(&self, channel_id: Option<ChannelId>, self_deaf: bool, self_mute: bool) -> bool {
        let payload = GatewayPayload::voice_state(VoiceStateRequest {
            guild_id: self.guild_id,
            channel_id,
            self_deaf,
            self_mute,
        });
        match self.gateway.send(payload) {
            Ok(()) => true,
            Err(e) => {
                self.events
                    .error(format!("Error enviando voice state de guild {}: {}", self.guild_id, e));
                false
            }
        }
    }

    /// Envía el opcode 4 para unirse al canal de voz
    pub fn connect(&self) -> AquaResult<()> {
        if self.is_destroyed() {
            return Err(AquaError::PlayerDestroyed(self.guild_id));
        }
        let (channel, deaf, mute) = {
            let state = self.state.lock();
            (state.voice_channel, state.deaf, state.mute)
        };
        let Some(channel) = channel else {
            return Err(AquaError::Gateway("voice channel required".to_string()));
        };
        debug!("Conectando a canal de voz {} en guild {}", channel, self.guild_id);
        if self.send_voice_state(Some(channel), deaf, mute) {
            Ok(())
        } else {
            Err(AquaError::Gateway(format!("voice state send failed for {}", self.guild_id)))
        }
    }

    pub fn set_voice_channel(&self, channel: ChannelId) -> AquaResult<()> {
        if self.is_destroyed() {
            return Err(AquaError::PlayerDestroyed(self.guild_id));
        }
        {
            let mut state = self.state.lock();
            if state.voice_channel == Some(channel) && self.is_connected() {
                return Ok(());
            }
            state.voice_channel = Some(channel);
        }
        self.connect()
    }

    pub fn set_text_channel(&self, channel: ChannelId) {
        if !self.is_destroyed() {
            self.state.lock().text_channel = Some(channel);
        }
    }

    /// Sale del canal de voz sin destruir el player
    pub fn disconnect(&self) {
        if self.is_destroyed() || !self.is_connected() {
            return;
        }
        self.connected.send_replace(false);
        let (deaf, mute) = {
            let mut state = self.state.lock();
            state.voice_channel = None;
            (state.deaf, state.mute)
        };
        self.connection.set_voice_channel(None);
        self.send_voice_state(None, deaf, mute);
    }

    // ---- Reproducción ----

    async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let mut rx = self.connected.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            result = tokio::time::timeout(timeout, rx.wait_for(|connected| *connected)) => {
                result.is_ok_and(|r| r.is_ok())
            }
        }
    }

    /// Saca el siguiente track de la cola y lo envía al nodo
    pub async fn play(&self) -> AquaResult<()> {
        if self.is_destroyed() {
            return Err(AquaError::PlayerDestroyed(self.guild_id));
        }
        if self.state.lock().queue.is_empty() {
            return Ok(());
        }
        if !self.is_connected() && !self.wait_for_connection(PLAY_CONNECT_TIMEOUT).await {
            return Err(if self.is_destroyed() {
                AquaError::PlayerDestroyed(self.guild_id)
            } else {
                AquaError::Timeout("voice connection")
            });
        }

        loop {
            let (track, volume) = {
                let mut state = self.state.lock();
                let Some(track) = state.queue.pop_front() else {
                    return Ok(());
                };
                state.current = Some(track.clone());
                state.playing = true;
                state.paused = false;
                state.position = 0;
                (track, state.volume)
            };

            let update = UpdatePlayer::play(&track.encoded, volume);
            match self.transport.update_player(self.guild_id, &update, false).await {
                Ok(_) => {
                    debug!("▶️ Reproduciendo '{}' en guild {}", track.title(), self.guild_id);
                    return Ok(());
                }
                Err(e) => {
                    self.events
                        .error(format!("No se pudo reproducir '{}': {}", track.title(), e));
                    let mut state = self.state.lock();
                    if state.queue.is_empty() || self.is_destroyed() {
                        state.current = None;
                        state.playing = false;
                        return Err(e.into());
                    }
                }
            }
        }
    }

    pub async fn pause(&self, paused: bool) -> AquaResult<()> {
        if self.is_destroyed() {
            return Err(AquaError::PlayerDestroyed(self.guild_id));
        }
        {
            let mut state = self.state.lock();
            if state.paused == paused {
                return Ok(());
            }
            state.paused = paused;
        }
        self.transport
            .update_player(self.guild_id, &UpdatePlayer::paused(paused), false)
            .await?;
        Ok(())
    }

    /// Salta a una posición, limitada a la duración del track
    pub async fn seek(&self, position: u64) -> AquaResult<()> {
        if self.is_destroyed() {
            return Err(AquaError::PlayerDestroyed(self.guild_id));
        }
        let position = {
            let mut state = self.state.lock();
            if !state.playing {
                return Ok(());
            }
            let clamped = state
                .current
                .as_ref()
                .map_or(position, |track| track.clamp_position(position));
            state.position = clamped;
            clamped
        };
        self.transport
            .update_player(self.guild_id, &UpdatePlayer::seek(position), false)
            .await?;
        Ok(())
    }

    pub async fn stop(&self) -> AquaResult<()> {
        if self.is_destroyed() {
            return Err(AquaError::PlayerDestroyed(self.guild_id));
        }
        {
            let mut state = self.state.lock();
            if !state.playing {
                return Ok(());
            }
            state.playing = false;
            state.paused = false;
            state.position = 0;
        }
        self.transport
            .update_player(self.guild_id, &UpdatePlayer::stop(), false)
            .await?;
        Ok(())
    }

    /// El nodo responde con TrackEnd(stopped) y se reproduce el siguiente
    pub async fn skip(&self) -> AquaResult<()> {
        self.stop().await
    }

    pub async fn set_volume(&self, volume: u16) -> AquaResult<()> {
        if self.is_destroyed() {
            return Err(AquaError::PlayerDestroyed(self.guild_id));
        }
        let volume = volume.min(MAX_VOLUME);
        {
            let mut state = self.state.lock();
            if state.volume == volume {
                return Ok(());
            }
            state.volume = volume;
        }
        self.transport
            .update_player(self.guild_id, &UpdatePlayer::volume(volume), false)
            .await?;
        Ok(())
    }

    pub fn set_loop(&self, mode: LoopMode) {
        if !self.is_destroyed() {
            self.state.lock().loop_mode = mode;
        }
    }

    /// Seek diferido para dar tiempo a que el nodo arranque el track
    pub(crate) fn seek_after(self: &Arc<Self>, position: u64, delay: Duration) {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(player) = weak.upgrade() {
                        if let Err(e) = player.seek(position).await {
                            debug!("Seek diferido fallido en guild {}: {}", player.guild_id, e);
                        }
                    }
                }
            }
        });
    }

    // ---- Snapshot ----

    pub fn capture(&self) -> PlayerSnapshot {
        let state = self.state.lock();
        PlayerSnapshot {
            guild_id: self.guild_id,
            text_channel: state.text_channel,
            voice_channel: state.voice_channel.or_else(|| self.connection.voice_channel()),
            volume: state.volume,
            paused: state.paused,
            playing: state.playing,
            position: state.position,
            loop_mode: state.loop_mode,
            deaf: state.deaf,
            mute: state.mute,
            current: state.current.clone(),
            queue: state.queue.iter().cloned().collect(),
            captured_at: chrono::Utc::now(),
        }
    }

    #[cfg(test)]
    pub(crate) fn force_playing(&self, track: Track, position: u64) {
        let mut state = self.state.lock();
        state.current = Some(track);
        state.playing = true;
        state.paused = false;
        state.position = position;
    }

    /// Carga la cola y ajustes de un snapshot; el track actual va al frente
    pub(crate) fn apply_snapshot(&self, snapshot: &PlayerSnapshot, include_current: bool) {
        let mut state = self.state.lock();
        state.volume = snapshot.volume.min(MAX_VOLUME);
        state.loop_mode = snapshot.loop_mode;
        state.text_channel = snapshot.text_channel.or(state.text_channel);
        state.queue.clear();
        state.queue.extend(snapshot.queue.iter().cloned());
        if let Some(current) = snapshot.current.as_ref().filter(|_| include_current) {
            state.queue.push_front(current.clone());
        }
    }

    // ---- Mensajes del nodo ----

    pub(crate) fn handle_player_update(self: &Arc<Self>, update: PlayerUpdateState) {
        if self.is_destroyed() {
            return;
        }
        let went_down = {
            let mut state = self.state.lock();
            state.position = update.position;
            state.timestamp = update.time;
            state.ping = update.ping;
            if update.connected {
                state.voice_down_since = None;
                false
            } else if state.voice_down_since.is_none() {
                state.voice_down_since = Some(Instant::now());
                true
            } else {
                false
            }
        };
        self.connected.send_replace(update.connected);

        if went_down {
            self.schedule_voice_down_resume();
        }

        self.events.emit(AquaEvent::PlayerUpdate {
            guild_id: self.guild_id,
            state: update,
        });
    }

    fn schedule_voice_down_resume(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(VOICE_DOWN_RESUME_DELAY) => {
                    let Some(player) = weak.upgrade() else { return };
                    if player.is_connected() || player.is_destroyed() || player.node.is_nodelink() {
                        return;
                    }
                    player.connection.attempt_resume().await;
                }
            }
        });
    }

    pub(crate) async fn handle_event(&self, event: PlayerEvent) {
        if self.is_destroyed() {
            return;
        }
        match event {
            PlayerEvent::TrackStartEvent { track } => {
                let track = {
                    let mut state = self.state.lock();
                    state.playing = true;
                    state.paused = false;
                    state
                        .current
                        .clone()
                        .filter(|current| current.encoded == track.encoded)
                        .unwrap_or(track)
                };
                info!("🎵 Iniciando '{}' en guild {}", track.title(), self.guild_id);
                self.events.emit(AquaEvent::TrackStart {
                    guild_id: self.guild_id,
                    track: Box::new(track),
                });
            }
            PlayerEvent::TrackEndEvent { track, reason } => self.track_end(track, reason).await,
            PlayerEvent::TrackExceptionEvent { track, exception } => {
                warn!("⚠️ Error en '{}': {}", track.title(), exception.message.as_deref().unwrap_or("-"));
                self.events.emit(AquaEvent::TrackError {
                    guild_id: self.guild_id,
                    track: Box::new(track),
                    exception,
                });
                let _ = self.stop().await;
            }
            PlayerEvent::TrackStuckEvent { track, threshold_ms } => {
                warn!("⚠️ Track atascado '{}' ({} ms)", track.title(), threshold_ms);
                self.events.emit(AquaEvent::TrackStuck {
                    guild_id: self.guild_id,
                    track: Box::new(track),
                    threshold_ms,
                });
                let _ = self.stop().await;
            }
            PlayerEvent::WebSocketClosedEvent { code, reason, .. } => {
                self.socket_closed(code, reason).await
            }
            PlayerEvent::Unknown => self
                .events
                .debug(format!("Evento desconocido para guild {}", self.guild_id)),
        }
    }

    async fn track_end(&self, track: Track, reason: TrackEndReason) {
        let (track, has_next) = {
            let mut state = self.state.lock();
            let track = state
                .current
                .take()
                .filter(|current| current.encoded == track.encoded)
                .unwrap_or(track);
            state.previous = Some(track.clone());
            state.position = 0;

            if reason == TrackEndReason::Finished {
                match state.loop_mode {
                    LoopMode::Track => state.queue.push_front(track.clone()),
                    LoopMode::Queue => state.queue.push(track.clone()),
                    LoopMode::None => {}
                }
            }
            let has_next = !state.queue.is_empty();
            if !has_next {
                state.playing = false;
            }
            (track, has_next)
        };

        self.events.emit(AquaEvent::TrackEnd {
            guild_id: self.guild_id,
            track: Box::new(track),
            reason,
        });

        if reason == TrackEndReason::Replaced {
            return;
        }
        if has_next {
            if let Err(e) = self.play().await {
                self.events
                    .error(format!("No se pudo continuar la cola en guild {}: {}", self.guild_id, e));
            }
        } else {
            info!("📭 Cola terminada en guild {}", self.guild_id);
            self.events.emit(AquaEvent::QueueEnd {
                guild_id: self.guild_id,
            });
        }
    }

    async fn socket_closed(&self, code: u16, reason: String) {
        debug!("Socket de voz cerrado en guild {} ({}): {}", self.guild_id, code, reason);

        if code == 4022 {
            self.events.emit(AquaEvent::SocketClosed {
                guild_id: self.guild_id,
                code,
                reason,
            });
            self.destroy(false);
            return;
        }

        if code == 4015 && !self.node.is_nodelink() && self.connection.attempt_resume().await {
            self.events.emit(AquaEvent::PlayerReconnected {
                guild_id: self.guild_id,
            });
            return;
        }

        if matches!(code, 4006 | 4009 | 4015) && self.request_voice_state() {
            self.events.debug(format!(
                "[Player] Voice state re-solicitado en guild {} tras cierre {}",
                self.guild_id, code
            ));
            return;
        }

        self.events.emit(AquaEvent::SocketClosed {
            guild_id: self.guild_id,
            code,
            reason,
        });
    }

    // ---- Watchdog de voz ----

    fn start_watchdog(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(Instant::now() + WATCHDOG_INTERVAL, WATCHDOG_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(player) = weak.upgrade() else { break };
                        player.voice_watchdog().await;
                    }
                }
            }
        });
    }

    async fn voice_watchdog(&self) {
        let (down_since, channel, deaf, mute) = {
            let state = self.state.lock();
            if state.recovering || state.recovery_attempts >= MAX_VOICE_RECOVERIES {
                return;
            }
            let (Some(since), Some(channel)) = (state.voice_down_since, state.voice_channel) else {
                return;
            };
            (since, channel, state.deaf, state.mute)
        };
        if self.is_destroyed()
            || self.is_connected()
            || self.node.is_nodelink()
            || down_since.elapsed() < VOICE_DOWN_THRESHOLD
        {
            return;
        }

        if !self.connection.has_voice_data() {
            if down_since.elapsed() > VOICE_ABANDON_AFTER {
                warn!("🔇 Sin datos de voz en guild {}, destruyendo player", self.guild_id);
                self.destroy(false);
            }
            return;
        }

        self.state.lock().recovering = true;
        if self.connection.attempt_resume().await {
            let mut state = self.state.lock();
            state.recovering = false;
            state.recovery_attempts = 0;
            state.voice_down_since = None;
            drop(state);
            self.events.emit(AquaEvent::PlayerReconnected {
                guild_id: self.guild_id,
            });
            return;
        }

        // Alternar mute fuerza un nuevo voice state desde Discord
        self.send_voice_state(Some(channel), deaf, !mute);
        tokio::time::sleep(MUTE_TOGGLE_DELAY).await;
        if !self.is_destroyed() {
            self.send_voice_state(Some(channel), deaf, mute);
            self.connection.resend_voice_update();
        }

        let mut state = self.state.lock();
        state.recovering = false;
        state.recovery_attempts += 1;
    }

    // ---- Destrucción ----

    /// Libera el player; con `skip_remote` no se avisa ni al nodo ni a Discord
    pub fn destroy(&self, skip_remote: bool) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.connection.destroy();
        self.connected.send_replace(false);

        let (deaf, mute) = {
            let mut state = self.state.lock();
            state.queue.clear();
            state.current = None;
            state.playing = false;
            state.paused = false;
            state.voice_channel = None;
            (state.deaf, state.mute)
        };

        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if(&self.guild_id, |_, player| std::ptr::eq(Arc::as_ptr(player), self));
            let replaced_on_same_node = registry
                .get(&self.guild_id)
                .is_some_and(|player| Arc::ptr_eq(player.node(), &self.node));
            if !replaced_on_same_node {
                self.node.guilds.remove(&self.guild_id);
            }
        } else {
            self.node.guilds.remove(&self.guild_id);
        }

        debug!("🗑️ Player de guild {} destruido", self.guild_id);
        self.events.emit(AquaEvent::PlayerDestroy {
            guild_id: self.guild_id,
        });

        if !skip_remote {
            self.send_voice_state(None, deaf, mute);
            if self.node.is_connected() {
                let node = Arc::clone(&self.node);
                let guild_id = self.guild_id;
                tokio::spawn(async move {
                    if let Err(e) = node.rest().destroy_player(guild_id).await {
                        debug!("No se pudo destruir el player remoto {}: {}", guild_id, e);
                    }
                });
            }
        }
    }
}

impl VoiceOwner for Player {
    fn volume(&self) -> u16 {
        self.state.lock().volume
    }

    fn is_resuming(&self) -> bool {
        self.resuming.load(Ordering::Acquire)
    }

    fn voice_state_changed(&self, channel_id: ChannelId, self_deaf: bool, self_mute: bool) {
        let mut state = self.state.lock();
        state.voice_channel = Some(channel_id);
        state.deaf = self_deaf;
        state.mute = self_mute;
    }

    fn request_voice_state(&self) -> bool {
        let (channel, deaf, mute) = {
            let state = self.state.lock();
            (state.voice_channel, state.deaf, state.mute)
        };
        match channel {
            Some(channel) if !self.is_destroyed() => self.send_voice_state(Some(channel), deaf, mute),
            _ => false,
        }
    }

    fn voice_disconnected(&self) {
        self.destroy(false);
    }

    fn voice_resumed(&self) {
        self.resuming.store(false, Ordering::Release);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{Config, NodeConfig};
    use crate::events::drain;
    use crate::node::tests::test_context;
    use crate::player::track::test_track;
    use crate::voice::connection::tests::RecordingTransport;
    use crate::voice::gateway::{MockGatewaySender, VoiceStateEvent};
    use pretty_assertions::assert_eq;

    pub(crate) struct Harness {
        pub player: Arc<Player>,
        pub transport: Arc<RecordingTransport>,
        pub registry: PlayerRegistry,
        pub events: EventBus,
    }

    fn harness_with_gateway(gateway: MockGatewaySender) -> Harness {
        let (ctx, _rx) = test_context(Config::default());
        let registry = ctx.players.clone();
        let events = ctx.events.clone();
        let node = Node::new(NodeConfig::new("127.0.0.1", 9, "pw").with_name("a"), ctx).unwrap();
        let transport = Arc::new(RecordingTransport::default());

        let options = PlayerOptions::new(GuildId::new(1), ChannelId::new(10)).with_volume(80);
        let player = Player::with_transport(
            &options,
            Arc::clone(&node),
            transport.clone(),
            PlayerContext {
                client_id: UserId::new(99),
                gateway: Arc::new(gateway),
                events: events.clone(),
                registry: Arc::downgrade(&registry),
                pool: Arc::new(PayloadPool::default()),
                default_volume: 100,
            },
        );
        registry.insert(GuildId::new(1), Arc::clone(&player));
        node.guilds.insert(GuildId::new(1));

        Harness {
            player,
            transport,
            registry,
            events,
        }
    }

    fn harness() -> Harness {
        let mut gateway = MockGatewaySender::new();
        gateway.expect_send().returning(|_| Ok(()));
        harness_with_gateway(gateway)
    }

    fn connected_update() -> PlayerUpdateState {
        PlayerUpdateState {
            time: 1,
            position: 0,
            connected: true,
            ping: 20,
        }
    }

    fn played(transport: &RecordingTransport) -> Vec<String> {
        transport
            .updates
            .lock()
            .iter()
            .filter_map(|u| u.track.as_ref().and_then(|t| t.encoded.clone()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_waits_for_connection() {
        let h = harness();
        h.player.add(test_track("a", 60_000));

        let player = Arc::clone(&h.player);
        let pending = tokio::spawn(async move { player.play().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(played(&h.transport).is_empty());

        h.player.handle_player_update(connected_update());
        pending.await.unwrap().unwrap();

        assert_eq!(played(&h.transport), vec!["QAAAa"]);
        assert_eq!(h.transport.updates.lock()[0].volume, Some(80));
        assert!(h.player.is_playing());
        assert_eq!(h.player.current().map(|t| t.info.identifier), Some("a".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_times_out_without_voice() {
        let h = harness();
        h.player.add(test_track("a", 60_000));
        let result = h.player.play().await;
        assert!(matches!(result, Err(AquaError::Timeout(_))));
        assert_eq!(h.player.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_track_loop_replays_same_track() {
        let h = harness();
        h.player.handle_player_update(connected_update());
        h.player.set_loop(LoopMode::Track);
        h.player.add_many(vec![test_track("a", 1000), test_track("b", 1000)]);
        h.player.play().await.unwrap();

        h.player
            .handle_event(PlayerEvent::TrackEndEvent {
                track: test_track("a", 1000),
                reason: TrackEndReason::Finished,
            })
            .await;

        assert_eq!(played(&h.transport), vec!["QAAAa", "QAAAa"]);
        assert_eq!(h.player.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_queue_loop_requeues_at_back() {
        let h = harness();
        h.player.handle_player_update(connected_update());
        h.player.set_loop(LoopMode::Queue);
        h.player.add_many(vec![test_track("a", 1000), test_track("b", 1000)]);
        h.player.play().await.unwrap();

        h.player
            .handle_event(PlayerEvent::TrackEndEvent {
                track: test_track("a", 1000),
                reason: TrackEndReason::Finished,
            })
            .await;

        assert_eq!(played(&h.transport), vec!["QAAAa", "QAAAb"]);
        let queued: Vec<_> = h.player.queue_head(5).into_iter().map(|t| t.info.identifier).collect();
        assert_eq!(queued, vec!["a"]);
    }

    #[tokio::test]
    async fn test_queue_end_and_replaced() {
        let h = harness();
        let mut rx = h.events.subscribe();
        h.player.handle_player_update(connected_update());
        h.player.add(test_track("a", 1000));
        h.player.play().await.unwrap();

        h.player
            .handle_event(PlayerEvent::TrackEndEvent {
                track: test_track("a", 1000),
                reason: TrackEndReason::Finished,
            })
            .await;
        assert!(!h.player.is_playing());
        assert!(drain(&mut rx).iter().any(|e| matches!(e, AquaEvent::QueueEnd { .. })));

        h.player.add(test_track("b", 1000));
        h.player
            .handle_event(PlayerEvent::TrackEndEvent {
                track: test_track("x", 1000),
                reason: TrackEndReason::Replaced,
            })
            .await;
        assert_eq!(played(&h.transport), vec!["QAAAa"]);
    }

    #[tokio::test]
    async fn test_seek_and_volume_are_clamped() {
        let h = harness();
        h.player.handle_player_update(connected_update());
        h.player.add(test_track("a", 1000));
        h.player.play().await.unwrap();

        h.player.seek(5000).await.unwrap();
        h.player.set_volume(500).await.unwrap();

        assert_eq!(h.player.position(), 1000);
        assert_eq!(h.player.volume(), MAX_VOLUME);
        let updates = h.transport.updates.lock();
        assert_eq!(updates[1].position, Some(1000));
        assert_eq!(updates[2].volume, Some(MAX_VOLUME));
    }

    #[tokio::test]
    async fn test_connect_sends_opcode_4() {
        let mut gateway = MockGatewaySender::new();
        gateway
            .expect_send()
            .withf(|p| p.op == 4 && p.d.channel_id == Some(ChannelId::new(10)) && p.d.self_deaf)
            .times(1)
            .returning(|_| Ok(()));
        let h = harness_with_gateway(gateway);
        h.player.connect().unwrap();
    }

    #[tokio::test]
    async fn test_destroy_respects_newer_registry_entry() {
        let h = harness();
        let mut gateway = MockGatewaySender::new();
        gateway.expect_send().returning(|_| Ok(()));
        let newer = Player::with_transport(
            &PlayerOptions::new(GuildId::new(1), ChannelId::new(10)),
            Arc::clone(h.player.node()),
            h.transport.clone(),
            PlayerContext {
                client_id: UserId::new(99),
                gateway: Arc::new(gateway),
                events: h.events.clone(),
                registry: Arc::downgrade(&h.registry),
                pool: Arc::new(PayloadPool::default()),
                default_volume: 100,
            },
        );
        h.registry.insert(GuildId::new(1), Arc::clone(&newer));

        h.player.destroy(true);
        h.player.destroy(true);

        assert!(h.player.is_destroyed());
        assert!(h
            .registry
            .get(&GuildId::new(1))
            .is_some_and(|p| Arc::ptr_eq(p.value(), &newer)));
        assert!(h.player.node().guilds.contains(&GuildId::new(1)));

        newer.destroy(true);
        assert!(h.registry.is_empty());
        assert!(!newer.node().guilds.contains(&GuildId::new(1)));
    }

    #[tokio::test]
    async fn test_socket_closed_4022_destroys() {
        let h = harness();
        let mut rx = h.events.subscribe();
        h.player
            .handle_event(PlayerEvent::WebSocketClosedEvent {
                code: 4022,
                reason: "call terminated".into(),
                by_remote: true,
            })
            .await;

        assert!(h.player.is_destroyed());
        assert!(h.registry.is_empty());
        let emitted = drain(&mut rx);
        assert!(emitted
            .iter()
            .any(|e| matches!(e, AquaEvent::SocketClosed { code: 4022, .. })));
        assert!(emitted.iter().any(|e| matches!(e, AquaEvent::PlayerDestroy { .. })));
    }

    #[tokio::test]
    async fn test_leaving_voice_destroys_player() {
        let h = harness();
        let state = |channel: Option<u64>| VoiceStateEvent {
            guild_id: GuildId::new(1),
            user_id: UserId::new(99),
            channel_id: channel.map(ChannelId::new),
            session_id: "s".into(),
            self_deaf: true,
            self_mute: false,
        };
        h.player.connection().set_state_update(&state(Some(10)));
        assert!(!h.player.is_destroyed());

        h.player.connection().set_state_update(&state(None));
        assert!(h.player.is_destroyed());
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_capture_and_apply_snapshot() {
        let h = harness();
        h.player.handle_player_update(connected_update());
        h.player.set_loop(LoopMode::Queue);
        h.player.set_text_channel(ChannelId::new(77));
        h.player.add_many(vec![test_track("a", 1000), test_track("b", 1000), test_track("c", 1000)]);
        h.player.play().await.unwrap();

        let snapshot = h.player.capture();
        assert_eq!(snapshot.current.as_ref().map(|t| t.info.identifier.as_str()), Some("a"));
        assert_eq!(snapshot.queue.len(), 2);
        assert_eq!(snapshot.voice_channel, Some(ChannelId::new(10)));

        let other = harness();
        other.player.apply_snapshot(&snapshot, true);
        let restored: Vec<_> = other
            .player
            .queue_head(10)
            .into_iter()
            .map(|t| t.info.identifier)
            .collect();
        assert_eq!(restored, vec!["a", "b", "c"]);
        assert_eq!(other.player.loop_mode(), LoopMode::Queue);
        assert_eq!(other.player.text_channel(), Some(ChannelId::new(77)));
        assert_eq!(other.player.volume(), 80);
    }
}
