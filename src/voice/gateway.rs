use serde::{Deserialize, Serialize};
use serde_json::Value;
use serenity::model::event::VoiceServerUpdateEvent;
use serenity::model::id::{ChannelId, GuildId, UserId};
use serenity::model::voice::VoiceState;
use tokio::sync::mpsc;

use crate::error::AquaError;

/// Opcode 4 del gateway de Discord (Voice State Update)
pub const VOICE_STATE_OPCODE: u8 = 4;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoiceStateRequest {
    pub guild_id: GuildId,
    pub channel_id: Option<ChannelId>,
    pub self_deaf: bool,
    pub self_mute: bool,
}

/// Payload saliente hacia el shard que maneja la guild
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayPayload {
    pub op: u8,
    pub d: VoiceStateRequest,
}

impl GatewayPayload {
    pub fn voice_state(request: VoiceStateRequest) -> Self {
        Self {
            op: VOICE_STATE_OPCODE,
            d: request,
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.d.guild_id
    }
}

/// Envío de payloads al gateway de Discord (lo implementa el bot)
#[cfg_attr(test, mockall::automock)]
pub trait GatewaySender: Send + Sync {
    fn send(&self, payload: GatewayPayload) -> Result<(), AquaError>;
}

impl GatewaySender for mpsc::UnboundedSender<GatewayPayload> {
    fn send(&self, payload: GatewayPayload) -> Result<(), AquaError> {
        mpsc::UnboundedSender::send(self, payload)
            .map_err(|e| AquaError::Gateway(format!("gateway channel closed ({})", e.0.guild_id())))
    }
}

/// VOICE_SERVER_UPDATE
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VoiceServerUpdate {
    pub guild_id: GuildId,
    #[serde(default)]
    pub endpoint: Option<String>,
    pub token: String,
}

/// VOICE_STATE_UPDATE (solo los campos que usa el cliente)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VoiceStateEvent {
    pub guild_id: GuildId,
    pub user_id: UserId,
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    pub session_id: String,
    #[serde(default)]
    pub self_deaf: bool,
    #[serde(default)]
    pub self_mute: bool,
}

/// Eventos de voz entrantes
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    Server(VoiceServerUpdate),
    State(VoiceStateEvent),
}

impl VoiceEvent {
    pub fn guild_id(&self) -> GuildId {
        match self {
            Self::Server(update) => update.guild_id,
            Self::State(state) => state.guild_id,
        }
    }

    /// Interpreta un paquete crudo `{t, d}` del gateway
    pub fn from_raw(kind: &str, data: &Value) -> Option<Self> {
        match kind {
            "VOICE_SERVER_UPDATE" => serde_json::from_value(data.clone()).ok().map(Self::Server),
            "VOICE_STATE_UPDATE" => serde_json::from_value(data.clone()).ok().map(Self::State),
            _ => None,
        }
    }
}

impl TryFrom<&VoiceServerUpdateEvent> for VoiceServerUpdate {
    type Error = AquaError;

    fn try_from(event: &VoiceServerUpdateEvent) -> Result<Self, Self::Error> {
        let guild_id = event
            .guild_id
            .ok_or_else(|| AquaError::Gateway("voice server update without guild".to_string()))?;
        Ok(Self {
            guild_id,
            endpoint: event.endpoint.clone(),
            token: event.token.clone(),
        })
    }
}

impl TryFrom<&VoiceState> for VoiceStateEvent {
    type Error = AquaError;

    fn try_from(state: &VoiceState) -> Result<Self, Self::Error> {
        let guild_id = state
            .guild_id
            .ok_or_else(|| AquaError::Gateway("voice state without guild".to_string()))?;
        Ok(Self {
            guild_id,
            user_id: state.user_id,
            channel_id: state.channel_id,
            session_id: state.session_id.clone(),
            self_deaf: state.self_deaf,
            self_mute: state.self_mute,
        })
    }
}
