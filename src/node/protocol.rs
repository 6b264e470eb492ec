//! Wire types of the Lavalink v4 WebSocket and REST protocol.

use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId};

use crate::player::track::{Track, TrackException};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyPayload {
    #[serde(default)]
    pub resumed: bool,
    pub session_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerUpdateState {
    pub time: u64,
    pub position: u64,
    pub connected: bool,
    pub ping: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdatePayload {
    pub guild_id: GuildId,
    pub state: PlayerUpdateState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

/// Eventos de reproducción (`op: "event"`)
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum PlayerEvent {
    TrackStartEvent {
        track: Track,
    },
    TrackEndEvent {
        track: Track,
        reason: TrackEndReason,
    },
    TrackExceptionEvent {
        track: Track,
        exception: TrackException,
    },
    TrackStuckEvent {
        track: Track,
        #[serde(rename = "thresholdMs")]
        threshold_ms: u64,
    },
    WebSocketClosedEvent {
        code: u16,
        #[serde(default)]
        reason: String,
        #[serde(rename = "byRemote", default)]
        by_remote: bool,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Memory {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Cpu {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

/// Estadísticas acumuladas de un nodo
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub players: u32,
    pub playing_players: u32,
    pub uptime: u64,
    pub memory: Memory,
    pub cpu: Cpu,
    pub frame_stats: FrameStats,
    pub ping: i64,
}

/// Mensaje `stats`; los campos ausentes conservan el valor anterior
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatsPayload {
    pub players: Option<u32>,
    pub playing_players: Option<u32>,
    pub uptime: Option<u64>,
    pub memory: Option<Memory>,
    pub cpu: Option<Cpu>,
    pub frame_stats: Option<FrameStats>,
    pub ping: Option<i64>,
}

impl NodeStats {
    pub fn merge(&mut self, payload: &StatsPayload) {
        if let Some(players) = payload.players {
            self.players = players;
        }
        if let Some(playing) = payload.playing_players {
            self.playing_players = playing;
        }
        if let Some(uptime) = payload.uptime {
            self.uptime = uptime;
        }
        if let Some(memory) = payload.memory {
            self.memory = memory;
        }
        if let Some(cpu) = payload.cpu {
            self.cpu = cpu;
        }
        if let Some(frames) = payload.frame_stats {
            self.frame_stats = frames;
        }
        if let Some(ping) = payload.ping {
            self.ping = ping;
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeVersion {
    pub semver: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
}

/// Respuesta de `/v4/info`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeInfo {
    pub version: NodeVersion,
    pub build_time: u64,
    pub jvm: String,
    pub lavaplayer: String,
    pub source_managers: Vec<String>,
    pub filters: Vec<String>,
    pub plugins: Vec<PluginInfo>,
    pub is_nodelink: bool,
}

/// Datos de voz enviados al nodo dentro de `PATCH .../players/{guild}`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceData {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTrack {
    /// `None` se serializa como `null` y detiene el track actual
    pub encoded: Option<String>,
}

/// Cuerpo de `PATCH /v4/sessions/{sid}/players/{guild}`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<UpdateTrack>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceData>,
}

impl UpdatePlayer {
    pub fn play(encoded: &str, volume: u16) -> Self {
        Self {
            track: Some(UpdateTrack {
                encoded: Some(encoded.to_string()),
            }),
            volume: Some(volume),
            position: Some(0),
            paused: Some(false),
            ..Default::default()
        }
    }

    pub fn stop() -> Self {
        Self {
            track: Some(UpdateTrack { encoded: None }),
            ..Default::default()
        }
    }

    pub fn paused(paused: bool) -> Self {
        Self {
            paused: Some(paused),
            ..Default::default()
        }
    }

    pub fn seek(position: u64) -> Self {
        Self {
            position: Some(position),
            ..Default::default()
        }
    }

    pub fn volume(volume: u16) -> Self {
        Self {
            volume: Some(volume),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSession {
    pub resuming: bool,
    pub timeout: u64,
}
