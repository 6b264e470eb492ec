use reqwest::Method;
use serenity::model::id::GuildId;
use std::time::Duration;
use thiserror::Error;

/// Errores del transporte REST de un nodo
#[derive(Debug, Error)]
pub enum RestError {
    #[error("session id required for this endpoint")]
    NoSession,

    #[error("invalid encoded track format")]
    InvalidTrack,

    #[error("one or more tracks have an invalid format")]
    InvalidTracks,

    #[error("response too large: {size} bytes (limit {limit})")]
    ResponseTooLarge { size: u64, limit: usize },

    #[error("HTTP {status} on {method} {url}")]
    Http {
        status: u16,
        method: Method,
        url: String,
        body: Option<serde_json::Value>,
    },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("REST transport destroyed")]
    Destroyed,
}

impl RestError {
    /// Código HTTP si el error proviene de una respuesta
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Errores del núcleo (cluster, nodos, sesiones de guild)
#[derive(Debug, Error)]
pub enum AquaError {
    #[error("cluster not initialized")]
    NotInitialized,

    #[error("no nodes available")]
    NoNodesAvailable,

    #[error("no node connected within {0:?}")]
    NoNodesConnected(Duration),

    #[error("no failover nodes available for {0}")]
    NoFailoverNodes(String),

    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("node {0} is not connected")]
    NodeUnavailable(String),

    #[error("no player for guild {0}")]
    PlayerNotFound(GuildId),

    #[error("player for guild {0} was destroyed")]
    PlayerDestroyed(GuildId),

    #[error("guild {0} is already being rebuilt or migrated")]
    GuildBusy(GuildId),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("gateway send failed: {0}")]
    Gateway(String),

    #[error(transparent)]
    Rest(#[from] RestError),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type AquaResult<T> = Result<T, AquaError>;
