//! Per-guild voice session: endpoint/token/session tracking, debounced
//! voice updates towards the node and resume with backoff.

use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use super::gateway::VoiceStateEvent;
use super::pool::{PayloadPool, VoiceUpdate};
use crate::events::{AquaEvent, EventBus};
use crate::node::rest::PlayerTransport;

/// Antigüedad máxima de una actualización pendiente al ejecutarse
pub const UPDATE_TIMEOUT: Duration = Duration::from_millis(4000);
/// Ventana en la que se agrupan las actualizaciones de voz antes de enviarlas
pub const VOICE_UPDATE_DEBOUNCE: Duration = Duration::from_millis(10);
pub const RECONNECT_DELAY: Duration = Duration::from_millis(1000);
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;
pub const RESUME_BACKOFF_MAX: Duration = Duration::from_millis(8000);
/// Datos de voz más antiguos que esto se consideran obsoletos
pub const VOICE_DATA_TIMEOUT: Duration = Duration::from_secs(30);
const VOICE_STATE_RETRY: Duration = Duration::from_millis(1500);
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Lo que la sesión de voz necesita de su player
pub trait VoiceOwner: Send + Sync {
    fn volume(&self) -> u16;
    fn is_resuming(&self) -> bool;
    fn voice_state_changed(&self, channel_id: ChannelId, self_deaf: bool, self_mute: bool);
    /// Pide al gateway un nuevo voice state (opcode 4)
    fn request_voice_state(&self) -> bool;
    /// Desconexión terminal del canal de voz
    fn voice_disconnected(&self);
    fn voice_resumed(&self) {}
}

/// `us-east123.discord.media:443` -> `us-east`
pub fn extract_region(endpoint: &str) -> Option<String> {
    let host = endpoint
        .trim_start_matches("wss://")
        .trim_start_matches("ws://")
        .trim_start_matches("https://");
    let host = host.split(|c| c == ':' || c == '/').next()?;
    let label = host.split('.').next()?;
    let region = label
        .trim_end_matches(|c: char| c.is_ascii_digit())
        .trim_end_matches('-');
    (!region.is_empty()).then(|| region.to_ascii_lowercase())
}

/// Retardo del reintento de resume: 1s, 2s, 4s... hasta 8s
pub fn resume_backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    RECONNECT_DELAY
        .saturating_mul(1u32 << exp)
        .min(RESUME_BACKOFF_MAX)
}

#[derive(Debug, Default)]
struct VoiceSessionState {
    voice_channel: Option<ChannelId>,
    session_id: Option<String>,
    endpoint: Option<String>,
    token: Option<String>,
    region: Option<String>,
    sequence: u64,
    endpoint_generation: u64,
    endpoint_reset_pending: bool,

    connected: bool,
    update_scheduled: bool,
    disconnecting: bool,
    attempting_resume: bool,
    voice_data_stale: bool,

    pending_since: Option<Instant>,
    reconnect_attempts: u32,
    consecutive_failures: u32,
    last_voice_update: Option<Instant>,
    reconnect_timer: Option<JoinHandle<()>>,
}

impl VoiceSessionState {
    fn has_voice_data(&self) -> bool {
        self.session_id.is_some() && self.endpoint.is_some() && self.token.is_some()
    }

    /// Datos completos y frescos; marca obsoletos si pasaron 30s
    fn check_voice_data(&mut self) -> bool {
        if !self.has_voice_data() {
            return false;
        }
        if self
            .last_voice_update
            .is_some_and(|at| at.elapsed() > VOICE_DATA_TIMEOUT)
        {
            self.voice_data_stale = true;
            return false;
        }
        true
    }

    fn reset_resume_counters(&mut self) {
        self.reconnect_attempts = 0;
        self.consecutive_failures = 0;
    }

    fn clear_timer(&mut self) {
        if let Some(handle) = self.reconnect_timer.take() {
            handle.abort();
        }
    }
}

pub struct Connection {
    guild_id: GuildId,
    client_id: UserId,
    transport: Arc<dyn PlayerTransport>,
    owner: Weak<dyn VoiceOwner>,
    pool: Arc<PayloadPool>,
    events: EventBus,
    state: Mutex<VoiceSessionState>,
    destroyed: AtomicBool,
}

impl Connection {
    pub fn new(
        guild_id: GuildId,
        client_id: UserId,
        transport: Arc<dyn PlayerTransport>,
        owner: Weak<dyn VoiceOwner>,
        pool: Arc<PayloadPool>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            guild_id,
            client_id,
            transport,
            owner,
            pool,
            events,
            state: Mutex::new(VoiceSessionState::default()),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.lock().session_id.clone()
    }

    pub fn endpoint(&self) -> Option<String> {
        self.state.lock().endpoint.clone()
    }

    pub fn token(&self) -> Option<String> {
        self.state.lock().token.clone()
    }

    pub fn region(&self) -> Option<String> {
        self.state.lock().region.clone()
    }

    pub fn sequence(&self) -> u64 {
        self.state.lock().sequence
    }

    /// Número de cambios de servidor de voz observados
    pub fn endpoint_generation(&self) -> u64 {
        self.state.lock().endpoint_generation
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.state.lock().reconnect_attempts
    }

    pub fn is_voice_data_stale(&self) -> bool {
        self.state.lock().voice_data_stale
    }

    pub fn has_voice_data(&self) -> bool {
        self.state.lock().has_voice_data()
    }

    pub fn voice_channel(&self) -> Option<ChannelId> {
        self.state.lock().voice_channel
    }

    pub fn set_voice_channel(&self, channel: Option<ChannelId>) {
        self.state.lock().voice_channel = channel;
    }

    /// Solo avanza; secuencias viejas o repetidas se ignoran
    pub fn update_sequence(&self, sequence: u64) {
        let mut state = self.state.lock();
        if sequence > state.sequence {
            state.sequence = sequence;
        }
    }

    /// VOICE_SERVER_UPDATE
    pub fn set_server_update(self: &Arc<Self>, endpoint: Option<&str>, token: &str) {
        if self.is_destroyed() {
            return;
        }
        let Some(endpoint) = endpoint.map(str::trim).filter(|e| !e.is_empty()) else {
            debug!("Voice server update sin endpoint para guild {}", self.guild_id);
            return;
        };
        if token.is_empty() {
            debug!("Voice server update sin token para guild {}", self.guild_id);
            return;
        }

        {
            let mut state = self.state.lock();
            if state.endpoint.as_deref() != Some(endpoint) {
                // Un servidor nuevo invalida el estado de resume anterior
                let already_reset = state.endpoint_reset_pending
                    && state.sequence == 0
                    && state.reconnect_attempts == 0;
                if !already_reset {
                    state.sequence = 0;
                    state.reset_resume_counters();
                    state.endpoint_generation += 1;
                    state.endpoint_reset_pending = true;
                }
                state.region = extract_region(endpoint);
                state.endpoint = Some(endpoint.to_string());
                info!(
                    "🔊 Servidor de voz para guild {}: {} ({})",
                    self.guild_id,
                    endpoint,
                    state.region.as_deref().unwrap_or("?")
                );
            }
            state.token = Some(token.to_string());
            state.last_voice_update = Some(Instant::now());
            state.voice_data_stale = false;
        }

        self.schedule_voice_update();
    }

    /// VOICE_STATE_UPDATE del propio bot
    pub fn set_state_update(self: &Arc<Self>, event: &VoiceStateEvent) {
        if self.is_destroyed() || event.user_id != self.client_id {
            return;
        }

        let Some(channel) = event.channel_id else {
            self.handle_disconnect();
            return;
        };

        let (moved_from, needs_update) = {
            let mut state = self.state.lock();
            let mut needs_update = !state.connected;
            let mut moved_from = None;

            if state.voice_channel != Some(channel) {
                moved_from = Some(state.voice_channel);
                state.voice_channel = Some(channel);
                needs_update = true;
            }

            if state.session_id.as_deref() != Some(event.session_id.as_str()) {
                state.session_id = Some(event.session_id.clone());
                state.reset_resume_counters();
                needs_update = true;
            }

            state.connected = true;
            (moved_from, needs_update)
        };

        if let Some(old_channel) = moved_from {
            self.events.emit(AquaEvent::PlayerMove {
                guild_id: self.guild_id,
                old_channel,
                new_channel: channel,
            });
        }

        if let Some(owner) = self.owner.upgrade() {
            owner.voice_state_changed(channel, event.self_deaf, event.self_mute);
        }

        if needs_update {
            self.schedule_voice_update();
        }
    }

    fn handle_disconnect(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if self.is_destroyed() || !state.connected || state.disconnecting {
                return;
            }
            state.disconnecting = true;
            state.connected = false;
            state.update_scheduled = false;
            state.pending_since = None;
            state.clear_timer();
            state.voice_channel = None;
            state.session_id = None;
            state.endpoint = None;
            state.token = None;
            state.region = None;
            state.voice_data_stale = false;
        }

        self.events
            .debug(format!("[Voice] Desconectado de la voz en guild {}", self.guild_id));

        if let Some(owner) = self.owner.upgrade() {
            owner.voice_disconnected();
        }

        self.state.lock().disconnecting = false;
    }

    /// Agenda el envío de los datos de voz al cerrar la ventana de debounce.
    /// El slot pendiente sigue ocupado hasta que el timer dispara, así que
    /// todo lo que llegue antes se envía en una única llamada.
    fn schedule_voice_update(self: &Arc<Self>) {
        if self.is_destroyed() {
            return;
        }
        {
            let mut state = self.state.lock();
            if !state.check_voice_data() || state.update_scheduled {
                return;
            }
            state.update_scheduled = true;
            state.pending_since = Some(Instant::now());
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(VOICE_UPDATE_DEBOUNCE).await;
            this.flush_voice_update().await;
        });
    }

    async fn flush_voice_update(self: Arc<Self>) {
        if self.is_destroyed() {
            return;
        }
        let volume = self.owner_volume();

        let payload = {
            let mut state = self.state.lock();
            state.update_scheduled = false;
            state.endpoint_reset_pending = false;
            let Some(since) = state.pending_since.take() else {
                return;
            };
            if since.elapsed() > UPDATE_TIMEOUT {
                debug!("Descartando voice update obsoleto para guild {}", self.guild_id);
                return;
            }
            self.build_payload(&state, volume, None)
        };

        let Some(payload) = payload else {
            return;
        };

        if let Err(e) = self
            .transport
            .update_player(self.guild_id, &payload.update, false)
            .await
        {
            self.events.debug(format!(
                "[Voice] Error enviando voice update de guild {}: {}",
                self.guild_id, e
            ));
        }
        self.pool.release(payload);
    }

    fn build_payload(
        &self,
        state: &VoiceSessionState,
        volume: u16,
        resume_sequence: Option<u64>,
    ) -> Option<VoiceUpdate> {
        let (Some(session_id), Some(endpoint), Some(token)) = (
            state.session_id.as_deref(),
            state.endpoint.as_deref(),
            state.token.as_deref(),
        ) else {
            return None;
        };

        let mut payload = self.pool.acquire();
        payload.fill(self.guild_id, session_id, endpoint, token, volume, resume_sequence);
        Some(payload)
    }

    fn owner_volume(&self) -> u16 {
        self.owner.upgrade().map_or(100, |owner| owner.volume())
    }

    /// Reenvía los datos de voz actuales (p. ej. tras reanudar la sesión del nodo)
    pub fn resend_voice_update(self: &Arc<Self>) -> bool {
        if self.is_destroyed() || !self.state.lock().check_voice_data() {
            return false;
        }
        self.schedule_voice_update();
        true
    }

    /// Intenta reanudar la conexión de voz en el nodo
    pub async fn attempt_resume(self: &Arc<Self>) -> bool {
        let volume = self.owner_volume();
        let resuming = self.owner.upgrade().is_some_and(|owner| owner.is_resuming());

        let payload = {
            let mut state = self.state.lock();
            let valid = state.check_voice_data();
            let can_attempt = !self.is_destroyed()
                && state.reconnect_attempts < MAX_RECONNECT_ATTEMPTS
                && !state.attempting_resume
                && !state.disconnecting;

            if !valid || !can_attempt {
                let missing = state.voice_data_stale || state.session_id.is_none();
                let exhausted = state.reconnect_attempts >= MAX_RECONNECT_ATTEMPTS;
                let request = missing && resuming && !exhausted && !self.is_destroyed();
                if request {
                    state.reconnect_attempts += 1;
                }
                drop(state);

                if request {
                    self.request_voice_state();
                } else if exhausted {
                    self.handle_disconnect();
                }
                return false;
            }

            state.attempting_resume = true;
            state.reconnect_attempts += 1;
            debug!(
                "Resume de voz para guild {} (intento {}/{})",
                self.guild_id, state.reconnect_attempts, MAX_RECONNECT_ATTEMPTS
            );
            self.build_payload(&state, volume, Some(state.sequence))
        };

        let Some(payload) = payload else {
            self.state.lock().attempting_resume = false;
            return false;
        };

        let result = self
            .transport
            .update_player(self.guild_id, &payload.update, false)
            .await;
        self.pool.release(payload);

        match result {
            Ok(_) => {
                let mut state = self.state.lock();
                state.reset_resume_counters();
                state.attempting_resume = false;
                drop(state);
                info!("✅ Voz reanudada en guild {}", self.guild_id);
                if let Some(owner) = self.owner.upgrade() {
                    owner.voice_resumed();
                }
                true
            }
            Err(e) => {
                let (retry, attempts) = {
                    let mut state = self.state.lock();
                    state.attempting_resume = false;
                    state.consecutive_failures += 1;
                    (
                        state.reconnect_attempts < MAX_RECONNECT_ATTEMPTS
                            && state.consecutive_failures < MAX_CONSECUTIVE_FAILURES,
                        state.reconnect_attempts,
                    )
                };
                self.events.debug(format!(
                    "[Voice] Resume fallido en guild {} (intento {}): {}",
                    self.guild_id, attempts, e
                ));

                if self.is_destroyed() {
                    return false;
                }
                if retry {
                    self.set_reconnect_timer(resume_backoff(attempts));
                } else {
                    self.handle_disconnect();
                }
                false
            }
        }
    }

    fn request_voice_state(self: &Arc<Self>) -> bool {
        let Some(owner) = self.owner.upgrade() else {
            return false;
        };
        if !owner.request_voice_state() {
            return false;
        }
        self.set_reconnect_timer(VOICE_STATE_RETRY);
        true
    }

    fn set_reconnect_timer(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(connection) = weak.upgrade() else {
                return;
            };
            connection.state.lock().reconnect_timer = None;
            if !connection.is_destroyed() {
                connection.attempt_resume().await;
            }
        });

        let mut state = self.state.lock();
        state.clear_timer();
        state.reconnect_timer = Some(handle);
    }

    /// Cancela timers y limpia todo el estado; idempotente
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.state.lock();
        state.clear_timer();
        *state = VoiceSessionState::default();
    }
}
