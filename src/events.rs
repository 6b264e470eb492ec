use serde_json::Value;
use serenity::model::id::{ChannelId, GuildId};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use crate::node::protocol::{PlayerUpdateState, TrackEndReason};
use crate::player::track::{Track, TrackException};

const EVENT_CAPACITY: usize = 1024;

/// Eventos publicados por el cluster
#[derive(Debug, Clone)]
pub enum AquaEvent {
    NodeCreate { node: String },
    NodeConnect { node: String },
    NodeReady { node: String, resumed: bool },
    NodeDisconnect { node: String, code: u16, reason: String },
    NodeReconnect { node: String, attempt: u32, delay: Duration, infinite: bool },
    NodeError { node: String, message: String },
    NodeDestroy { node: String },
    NodeCustomOp { node: String, op: String, payload: Value },
    NodeFailover { node: String },
    NodeFailoverComplete { node: String, succeeded: usize, failed: usize },
    PlayersRebuilt { node: String, count: usize },

    PlayerCreate { guild_id: GuildId, node: String },
    PlayerDestroy { guild_id: GuildId },
    PlayerMove { guild_id: GuildId, old_channel: Option<ChannelId>, new_channel: ChannelId },
    PlayerMigrated { guild_id: GuildId, from: String, to: String },
    PlayerUpdate { guild_id: GuildId, state: PlayerUpdateState },
    PlayerReconnected { guild_id: GuildId },

    TrackStart { guild_id: GuildId, track: Box<Track> },
    TrackEnd { guild_id: GuildId, track: Box<Track>, reason: TrackEndReason },
    TrackError { guild_id: GuildId, track: Box<Track>, exception: TrackException },
    TrackStuck { guild_id: GuildId, track: Box<Track>, threshold_ms: u64 },
    QueueEnd { guild_id: GuildId },
    SocketClosed { guild_id: GuildId, code: u16, reason: String },
    Lyrics { guild_id: Option<GuildId>, op: String, payload: Value },

    Debug { message: String },
    Error { message: String },
}

/// Canal broadcast de eventos; emitir sin suscriptores no es un error
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AquaEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn emit(&self, event: AquaEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AquaEvent> {
        self.sender.subscribe()
    }

    pub fn debug(&self, message: impl Into<String>) {
        let message = message.into();
        debug!("{}", message);
        self.emit(AquaEvent::Debug { message });
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{}", message);
        self.emit(AquaEvent::Error { message });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) fn drain(rx: &mut broadcast::Receiver<AquaEvent>) -> Vec<AquaEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
