//! Cliente Lavalink v4 multi-nodo con failover, migración de players y
//! recuperación de sesiones de voz.

pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod node;
pub mod player;
pub mod storage;
pub mod voice;

pub use crate::cluster::Aqua;
pub use crate::config::{Config, FailoverConfig, LoadBalancer, NodeConfig};
pub use crate::error::{AquaError, AquaResult, RestError};
pub use crate::events::{AquaEvent, EventBus};
pub use crate::node::Node;
pub use crate::player::queue::LoopMode;
pub use crate::player::track::{LoadResult, Requester, Track};
pub use crate::player::{Player, PlayerOptions, PlayerSnapshot};
pub use crate::voice::gateway::{GatewayPayload, GatewaySender, VoiceEvent};
