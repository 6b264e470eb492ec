//! Runtime configuration for the cluster, loaded from the environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Conexión a un nodo Lavalink
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub regions: Vec<String>,
    /// Sesión previa a reanudar tras un reinicio del cliente
    #[serde(default)]
    pub session_id: Option<String>,
}

fn default_port() -> u16 {
    2333
}

fn default_password() -> String {
    "youshallnotpass".to_string()
}

impl NodeConfig {
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            name: None,
            host: host.into(),
            port,
            password: password.into(),
            secure: false,
            regions: Vec::new(),
            session_id: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Nombre lógico: `name` o `host:port`
    pub fn identifier(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.host, self.port))
    }

    /// Host apto para URL (IPv6 entre corchetes)
    pub fn url_host(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}/v4/websocket", scheme, self.url_host(), self.port)
    }

    pub fn http_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.url_host(), self.port)
    }
}

/// Estrategia de selección de nodos
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LoadBalancer {
    #[default]
    LeastLoad,
    LeastRest,
    Random,
}

impl FromStr for LoadBalancer {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "leastload" | "least_load" => Ok(Self::LeastLoad),
            "leastrest" | "least_rest" => Ok(Self::LeastRest),
            "random" => Ok(Self::Random),
            other => anyhow::bail!("Unknown load balancer: {}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailoverConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub preserve_position: bool,
    pub resume_playback: bool,
    pub cooldown: Duration,
    pub max_failover_attempts: u32,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            preserve_position: true,
            resume_playback: true,
            cooldown: Duration::from_millis(5000),
            max_failover_attempts: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub nodes: Vec<NodeConfig>,
    pub client_name: String,
    pub load_balancer: LoadBalancer,

    // Transporte
    pub use_http2: bool,
    pub rest_timeout: Duration,
    pub max_response_size: usize,
    pub max_payload: usize,
    pub handshake_timeout: Duration,
    pub fetch_node_info: bool,

    // Reconexión
    pub auto_resume: bool,
    pub infinite_reconnects: bool,
    pub reconnect_timeout: Duration,
    pub reconnect_tries: u32,
    /// Segundos que el nodo mantiene la sesión tras una desconexión
    pub resume_timeout: u64,

    pub failover: FailoverConfig,

    // Reproducción
    pub default_volume: u16,
    pub players_file: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let nodes = match std::env::var("LAVALINK_NODES") {
            Ok(raw) if !raw.trim().is_empty() => serde_json::from_str::<Vec<NodeConfig>>(&raw)
                .context("LAVALINK_NODES must be a JSON array of nodes")?,
            _ => vec![NodeConfig {
                name: std::env::var("LAVALINK_NAME").ok(),
                host: std::env::var("LAVALINK_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: env_or("LAVALINK_PORT", 2333)?,
                password: std::env::var("LAVALINK_PASSWORD")
                    .unwrap_or_else(|_| default_password()),
                secure: env_or("LAVALINK_SECURE", false)?,
                regions: Vec::new(),
                session_id: None,
            }],
        };

        let failover = FailoverConfig {
            enabled: env_or("FAILOVER_ENABLED", defaults.failover.enabled)?,
            max_retries: env_or("FAILOVER_MAX_RETRIES", defaults.failover.max_retries)?,
            retry_delay: env_duration("FAILOVER_RETRY_DELAY", defaults.failover.retry_delay)?,
            preserve_position: env_or(
                "FAILOVER_PRESERVE_POSITION",
                defaults.failover.preserve_position,
            )?,
            resume_playback: env_or("FAILOVER_RESUME_PLAYBACK", defaults.failover.resume_playback)?,
            cooldown: env_duration("FAILOVER_COOLDOWN", defaults.failover.cooldown)?,
            max_failover_attempts: env_or(
                "FAILOVER_MAX_ATTEMPTS",
                defaults.failover.max_failover_attempts,
            )?,
        };

        let config = Self {
            nodes,
            client_name: std::env::var("CLIENT_NAME").unwrap_or(defaults.client_name),
            load_balancer: env_or("LOAD_BALANCER", defaults.load_balancer)?,
            use_http2: env_or("USE_HTTP2", defaults.use_http2)?,
            rest_timeout: env_duration("REST_TIMEOUT", defaults.rest_timeout)?,
            max_response_size: env_or("MAX_RESPONSE_SIZE", defaults.max_response_size)?,
            max_payload: env_or("MAX_PAYLOAD", defaults.max_payload)?,
            handshake_timeout: env_duration("HANDSHAKE_TIMEOUT", defaults.handshake_timeout)?,
            fetch_node_info: env_or("FETCH_NODE_INFO", defaults.fetch_node_info)?,
            auto_resume: env_or("AUTO_RESUME", defaults.auto_resume)?,
            infinite_reconnects: env_or("INFINITE_RECONNECTS", defaults.infinite_reconnects)?,
            reconnect_timeout: env_duration("RECONNECT_TIMEOUT", defaults.reconnect_timeout)?,
            reconnect_tries: env_or("RECONNECT_TRIES", defaults.reconnect_tries)?,
            resume_timeout: env_or("RESUME_TIMEOUT", defaults.resume_timeout)?,
            failover,
            default_volume: env_or("DEFAULT_VOLUME", defaults.default_volume)?,
            players_file: std::env::var("PLAYERS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.players_file),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// - At least one node, each with a non-empty host and a parseable URL
    /// - Volume between 0 and 200
    /// - Non-zero size limits and timeouts
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            anyhow::bail!("At least one Lavalink node must be configured");
        }

        for node in &self.nodes {
            if node.host.trim().is_empty() {
                anyhow::bail!("Node host cannot be empty");
            }
            url::Url::parse(&node.ws_url())
                .with_context(|| format!("Invalid WebSocket URL for node {}", node.identifier()))?;
        }

        let mut names: Vec<_> = self.nodes.iter().map(NodeConfig::identifier).collect();
        names.sort();
        names.dedup();
        if names.len() != self.nodes.len() {
            anyhow::bail!("Node names must be unique");
        }

        if self.default_volume > 200 {
            anyhow::bail!("Default volume must be between 0 and 200, got: {}", self.default_volume);
        }

        if self.max_response_size == 0 || self.max_payload == 0 {
            anyhow::bail!("Size limits must be greater than 0");
        }

        if self.rest_timeout.is_zero() || self.handshake_timeout.is_zero() {
            anyhow::bail!("Timeouts must be greater than 0");
        }

        Ok(())
    }

    /// Returns a formatted summary of the configuration.
    pub fn summary(&self) -> String {
        let nodes = self
            .nodes
            .iter()
            .map(|n| format!("{} ({})", n.identifier(), n.http_url()))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "Aqualink Configuration:\n\
             - Nodes: {}\n\
             - Load balancer: {:?}\n\
             - HTTP/2: {}\n\
             - Auto resume: {} (timeout {}s)\n\
             - Reconnect: base {:?}, tries {}, infinite {}\n\
             - Failover: {} (retries {}, cooldown {:?})\n\
             - Default volume: {}\n\
             - Players file: {}",
            nodes,
            self.load_balancer,
            self.use_http2,
            self.auto_resume,
            self.resume_timeout,
            self.reconnect_timeout,
            self.reconnect_tries,
            self.infinite_reconnects,
            self.failover.enabled,
            self.failover.max_retries,
            self.failover.cooldown,
            self.default_volume,
            self.players_file.display(),
        )
    }
}

impl Default for Config {
    /// Default values match the stock Lavalink client settings:
    /// 15s REST timeout, 10MiB response ceiling, 1MiB frames, 2s reconnect base.
    fn default() -> Self {
        Self {
            nodes: vec![NodeConfig::new("localhost", default_port(), default_password())],
            client_name: format!("aqualink/{}", env!("CARGO_PKG_VERSION")),
            load_balancer: LoadBalancer::LeastLoad,
            use_http2: false,
            rest_timeout: Duration::from_millis(15_000),
            max_response_size: 10 * 1024 * 1024,
            max_payload: 1024 * 1024,
            handshake_timeout: Duration::from_millis(15_000),
            fetch_node_info: true,
            auto_resume: true,
            infinite_reconnects: false,
            reconnect_timeout: Duration::from_millis(2000),
            reconnect_tries: 3,
            resume_timeout: 60,
            failover: FailoverConfig::default(),
            default_volume: 100,
            players_file: PathBuf::from("AquaPlayers.jsonl"),
        }
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {}", key, e)),
        _ => Ok(default),
    }
}

fn env_duration(key: &str, default: Duration) -> Result<Duration> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => humantime::parse_duration(raw.trim())
            .with_context(|| format!("Invalid duration for {}", key)),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_response_size, 10_485_760);
        assert!(config.summary().contains("localhost"));
    }

    #[test]
    fn test_ipv6_hosts_are_bracketed() {
        let node = NodeConfig::new("::1", 2333, "pw");
        assert_eq!(node.ws_url(), "ws://[::1]:2333/v4/websocket");

        let mut secure = NodeConfig::new("lava.example.com", 443, "pw");
        secure.secure = true;
        assert_eq!(secure.http_url(), "https://lava.example.com:443");
    }

    #[test]
    fn test_validate_rejects_duplicates_and_volume() {
        let mut config = Config::default();
        config.nodes.push(NodeConfig::new("localhost", 2333, "other"));
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.default_volume = 250;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_node_list_from_json() {
        let nodes: Vec<NodeConfig> = serde_json::from_str(
            r#"[{"name":"main","host":"10.0.0.2","password":"x","regions":["us-east"]}]"#,
        )
        .unwrap();
        assert_eq!(nodes[0].port, 2333);
        assert_eq!(nodes[0].identifier(), "main");
        assert_eq!(nodes[0].regions, vec!["us-east".to_string()]);
    }

    #[test]
    fn test_load_balancer_from_str() {
        assert_eq!("leastRest".parse::<LoadBalancer>().unwrap(), LoadBalancer::LeastRest);
        assert!("fastest".parse::<LoadBalancer>().is_err());
    }
}
