use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use serenity::model::id::GuildId;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use super::protocol::{NodeInfo, StatsPayload, UpdatePlayer, UpdateSession};
use crate::config::{Config, NodeConfig};
use crate::error::RestError;
use crate::player::track::{LoadResult, Track};

/// Payloads a partir de este tamaño usan el cliente HTTP/2
pub const HTTP2_THRESHOLD: usize = 1024;
const API_BASE: &str = "/v4";
const ACCEPT_VALUE: &str = "application/json, */*;q=0.5";
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(15);
const POOL_MAX_IDLE_PER_HOST: usize = 64;

/// Envío de actualizaciones de player hacia un nodo
#[async_trait]
pub trait PlayerTransport: Send + Sync {
    async fn update_player(
        &self,
        guild_id: GuildId,
        update: &UpdatePlayer,
        no_replace: bool,
    ) -> Result<Option<Value>, RestError>;
}

/// Cliente REST de un nodo
pub struct Rest {
    http1: reqwest::Client,
    http2: Option<reqwest::Client>,
    base_url: String,
    password: String,
    session_id: RwLock<Option<String>>,
    timeout: Duration,
    max_response_size: usize,
    calls: AtomicU64,
    in_flight: AtomicUsize,
    destroyed: AtomicBool,
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Rest {
    pub fn new(node: &NodeConfig, config: &Config) -> Result<Self, RestError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_VALUE));

        // Accept-Encoding (br, gzip, deflate) lo agrega reqwest junto con la descompresión
        let builder = || {
            reqwest::Client::builder()
                .default_headers(headers.clone())
                .user_agent(config.client_name.as_str())
                .timeout(config.rest_timeout)
                .connect_timeout(config.rest_timeout)
                .pool_idle_timeout(POOL_IDLE_TIMEOUT)
                .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
                .tcp_nodelay(true)
                .tcp_keepalive(Duration::from_secs(30))
        };

        let http1 = builder().http1_only().build()?;
        let http2 = if config.use_http2 {
            Some(builder().http2_prior_knowledge().build()?)
        } else {
            None
        };

        Ok(Self {
            http1,
            http2,
            base_url: node.http_url(),
            password: node.password.clone(),
            session_id: RwLock::new(node.session_id.clone()),
            timeout: config.rest_timeout,
            max_response_size: config.max_response_size,
            calls: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn set_session_id(&self, session_id: Option<String>) {
        *self.session_id.write() = session_id;
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    /// Peticiones en curso
    pub fn outstanding_calls(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn total_calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    fn session_path(&self) -> Result<String, RestError> {
        self.session_id
            .read()
            .as_deref()
            .map(|sid| format!("{}/sessions/{}", API_BASE, sid))
            .ok_or(RestError::NoSession)
    }

    /// Petición genérica; `Ok(None)` para 204 o cuerpo vacío
    pub async fn make_request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Option<Value>, RestError> {
        let payload = body.map(serde_json::to_vec).transpose()?;
        self.send(method, endpoint, payload).await
    }

    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        payload: Option<Vec<u8>>,
    ) -> Result<Option<Value>, RestError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(RestError::Destroyed);
        }

        let url = format!("{}{}", self.base_url, endpoint);
        let payload_len = payload.as_ref().map_or(0, Vec::len);
        let client = match &self.http2 {
            Some(h2) if payload_len >= HTTP2_THRESHOLD => h2,
            _ => &self.http1,
        };

        let mut request = client
            .request(method.clone(), &url)
            .header(AUTHORIZATION, self.password.as_str());
        if let Some(payload) = payload {
            request = request.header(CONTENT_TYPE, "application/json").body(payload);
        }

        self.calls.fetch_add(1, Ordering::Relaxed);
        let _in_flight = InFlight::enter(&self.in_flight);

        let response = request.send().await.map_err(|e| self.classify(e))?;
        self.read_response(method, url, response).await
    }

    fn classify(&self, error: reqwest::Error) -> RestError {
        if error.is_timeout() {
            RestError::Timeout(self.timeout)
        } else {
            RestError::Network(error)
        }
    }

    async fn read_response(
        &self,
        method: Method,
        url: String,
        response: reqwest::Response,
    ) -> Result<Option<Value>, RestError> {
        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        // El tamaño declarado se valida antes de leer el cuerpo
        if let Some(length) = response.content_length() {
            ensure_within_limit(length, self.max_response_size)?;
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let body = read_limited(response.bytes_stream(), self.max_response_size)
            .await
            .map_err(|e| match e {
                RestError::Network(inner) => self.classify(inner),
                other => other,
            })?;

        if status.as_u16() >= 400 {
            let body = (!body.is_empty()).then(|| lenient_body(&body));
            return Err(RestError::Http {
                status: status.as_u16(),
                method,
                url,
                body,
            });
        }

        if body.is_empty() {
            return Ok(None);
        }

        parse_body(&body, &content_type).map(Some)
    }

    // ---- Endpoints de sesión ----

    pub async fn update_player(
        &self,
        guild_id: GuildId,
        update: &UpdatePlayer,
        no_replace: bool,
    ) -> Result<Option<Value>, RestError> {
        let endpoint = format!(
            "{}/players/{}?noReplace={}",
            self.session_path()?,
            guild_id,
            no_replace
        );
        let payload = serde_json::to_vec(update)?;
        self.send(Method::PATCH, &endpoint, Some(payload)).await
    }

    pub async fn get_player(&self, guild_id: GuildId) -> Result<Option<Value>, RestError> {
        let endpoint = format!("{}/players/{}", self.session_path()?, guild_id);
        self.send(Method::GET, &endpoint, None).await
    }

    pub async fn get_players(&self) -> Result<Vec<Value>, RestError> {
        let endpoint = format!("{}/players", self.session_path()?);
        match self.send(Method::GET, &endpoint, None).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    pub async fn destroy_player(&self, guild_id: GuildId) -> Result<(), RestError> {
        let endpoint = format!("{}/players/{}", self.session_path()?, guild_id);
        self.send(Method::DELETE, &endpoint, None).await.map(|_| ())
    }

    /// Activa la reanudación de sesión en el nodo
    pub async fn update_session(
        &self,
        resuming: bool,
        timeout: u64,
    ) -> Result<Option<Value>, RestError> {
        let endpoint = self.session_path()?;
        let payload = serde_json::to_vec(&UpdateSession { resuming, timeout })?;
        self.send(Method::PATCH, &endpoint, Some(payload)).await
    }

    // ---- Tracks ----

    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResult, RestError> {
        let endpoint = format!(
            "{}/loadtracks?identifier={}",
            API_BASE,
            urlencoding::encode(identifier)
        );
        match self.send(Method::GET, &endpoint, None).await? {
            Some(value) => Ok(LoadResult::from_value(value)?),
            None => Ok(LoadResult::Empty),
        }
    }

    pub async fn decode_track(&self, encoded: &str) -> Result<Track, RestError> {
        if !is_valid_encoded_track(encoded) {
            return Err(RestError::InvalidTrack);
        }
        let endpoint = format!(
            "{}/decodetrack?encodedTrack={}",
            API_BASE,
            urlencoding::encode(encoded)
        );
        let value = self.send(Method::GET, &endpoint, None).await?;
        Ok(serde_json::from_value(value.unwrap_or(Value::Null))?)
    }

    pub async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<Track>, RestError> {
        if encoded.is_empty() || !encoded.iter().all(|t| is_valid_encoded_track(t)) {
            return Err(RestError::InvalidTracks);
        }
        let endpoint = format!("{}/decodetracks", API_BASE);
        let payload = serde_json::to_vec(encoded)?;
        match self.send(Method::POST, &endpoint, Some(payload)).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    // ---- Información del nodo ----

    pub async fn get_stats(&self) -> Result<StatsPayload, RestError> {
        let endpoint = format!("{}/stats", API_BASE);
        let value = self.send(Method::GET, &endpoint, None).await?;
        Ok(serde_json::from_value(value.unwrap_or(Value::Null))?)
    }

    pub async fn get_info(&self) -> Result<NodeInfo, RestError> {
        let endpoint = format!("{}/info", API_BASE);
        let value = self.send(Method::GET, &endpoint, None).await?;
        Ok(serde_json::from_value(value.unwrap_or(Value::Null))?)
    }

    /// `/version` responde texto plano
    pub async fn get_version(&self) -> Result<String, RestError> {
        match self.send(Method::GET, "/version", None).await? {
            Some(Value::String(version)) => Ok(version),
            Some(other) => Ok(other.to_string()),
            None => Ok(String::new()),
        }
    }

    // ---- Route planner ----

    pub async fn get_route_planner_status(&self) -> Result<Option<Value>, RestError> {
        let endpoint = format!("{}/routeplanner/status", API_BASE);
        self.send(Method::GET, &endpoint, None).await
    }

    pub async fn free_route_planner_address(&self, address: &str) -> Result<(), RestError> {
        let endpoint = format!("{}/routeplanner/free/address", API_BASE);
        let payload = serde_json::to_vec(&serde_json::json!({ "address": address }))?;
        self.send(Method::POST, &endpoint, Some(payload)).await.map(|_| ())
    }

    pub async fn free_all_route_planner_addresses(&self) -> Result<(), RestError> {
        let endpoint = format!("{}/routeplanner/free/all", API_BASE);
        self.send(Method::POST, &endpoint, None).await.map(|_| ())
    }

    // ---- Letras ----

    /// Busca letras: player de la guild, luego el track codificado, luego título/autor
    pub async fn get_lyrics(
        &self,
        guild_id: Option<GuildId>,
        track: Option<&Track>,
        skip_track_source: bool,
    ) -> Result<Option<Value>, RestError> {
        let encoded = track
            .map(|t| t.encoded.as_str())
            .filter(|e| is_valid_encoded_track(e));
        let title = track
            .map(|t| t.info.title.as_str())
            .filter(|t| !t.is_empty());

        if guild_id.is_none() && encoded.is_none() && title.is_none() {
            return Err(RestError::InvalidTrack);
        }

        if let Some(guild_id) = guild_id {
            if let Ok(path) = self.session_path() {
                let endpoint = format!(
                    "{}/players/{}/track/lyrics?skipTrackSource={}",
                    path, guild_id, skip_track_source
                );
                if let Some(lyrics) = self.try_lyrics(&endpoint).await {
                    return Ok(Some(lyrics));
                }
            }
        }

        if let Some(encoded) = encoded {
            let endpoint = format!(
                "{}/lyrics?track={}&skipTrackSource={}",
                API_BASE,
                urlencoding::encode(encoded),
                skip_track_source
            );
            if let Some(lyrics) = self.try_lyrics(&endpoint).await {
                return Ok(Some(lyrics));
            }
        }

        if let (Some(title), Some(track)) = (title, track) {
            let query = if track.info.author.is_empty() {
                title.to_string()
            } else {
                format!("{} {}", title, track.info.author)
            };
            let endpoint = format!("{}/lyrics/search?query={}", API_BASE, urlencoding::encode(&query));
            if let Some(lyrics) = self.try_lyrics(&endpoint).await {
                return Ok(Some(lyrics));
            }
        }

        Ok(None)
    }

    async fn try_lyrics(&self, endpoint: &str) -> Option<Value> {
        match self.send(Method::GET, endpoint, None).await {
            Ok(Some(value)) if has_lyrics(&value) => Some(value),
            Ok(_) => None,
            Err(e) => {
                debug!("Letras no disponibles en {}: {}", endpoint, e);
                None
            }
        }
    }

    pub async fn subscribe_live_lyrics(&self, guild_id: GuildId, skip_track_source: bool) -> bool {
        let Ok(path) = self.session_path() else {
            return false;
        };
        let endpoint = format!(
            "{}/players/{}/lyrics/subscribe?skipTrackSource={}",
            path, guild_id, skip_track_source
        );
        matches!(self.send(Method::POST, &endpoint, None).await, Ok(None))
    }

    pub async fn unsubscribe_live_lyrics(&self, guild_id: GuildId) -> bool {
        let Ok(path) = self.session_path() else {
            return false;
        };
        let endpoint = format!("{}/players/{}/lyrics/subscribe", path, guild_id);
        matches!(self.send(Method::DELETE, &endpoint, None).await, Ok(None))
    }
}

#[async_trait]
impl PlayerTransport for Rest {
    async fn update_player(
        &self,
        guild_id: GuildId,
        update: &UpdatePlayer,
        no_replace: bool,
    ) -> Result<Option<Value>, RestError> {
        Rest::update_player(self, guild_id, update, no_replace).await
    }
}

fn ensure_within_limit(size: u64, limit: usize) -> Result<(), RestError> {
    if size > limit as u64 {
        return Err(RestError::ResponseTooLarge { size, limit });
    }
    Ok(())
}

/// Lee el cuerpo por partes abortando en cuanto supera `limit`
pub(crate) async fn read_limited<S, E>(stream: S, limit: usize) -> Result<Vec<u8>, RestError>
where
    S: Stream<Item = Result<Bytes, E>>,
    RestError: From<E>,
{
    futures::pin_mut!(stream);
    let mut body = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        ensure_within_limit((body.len() + chunk.len()) as u64, limit)?;
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

fn parse_body(body: &[u8], content_type: &str) -> Result<Value, RestError> {
    if content_type.contains("application/json") {
        Ok(serde_json::from_slice(body)?)
    } else {
        Ok(Value::String(String::from_utf8_lossy(body).into_owned()))
    }
}

fn lenient_body(body: &[u8]) -> Value {
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

fn has_lyrics(value: &Value) -> bool {
    match value {
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        _ => false,
    }
}

/// Un track codificado válido es base64 (estándar o URL-safe) no vacío
pub fn is_valid_encoded_track(encoded: &str) -> bool {
    use base64::engine::general_purpose::{STANDARD, URL_SAFE};

    !encoded.is_empty() && (STANDARD.decode(encoded).is_ok() || URL_SAFE.decode(encoded).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Servidor HTTP de un solo uso que responde con `response` tal cual
    async fn serve_once(response: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.flush().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        port
    }

    fn rest_for(port: u16) -> Rest {
        Rest::new(&NodeConfig::new("127.0.0.1", port, "pw"), &Config::default()).unwrap()
    }

    #[tokio::test]
    async fn test_declared_size_over_limit_is_rejected() {
        let port = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 20000000\r\n\r\n",
        )
        .await;
        let rest = rest_for(port);

        let result = rest.get_route_planner_status().await;
        assert!(matches!(
            result,
            Err(RestError::ResponseTooLarge { size: 20_000_000, limit: 10_485_760 })
        ));
        assert_eq!(rest.outstanding_calls(), 0);
        assert_eq!(rest.total_calls(), 1);
    }

    #[tokio::test]
    async fn test_no_content_returns_none() {
        let port = serve_once("HTTP/1.1 204 No Content\r\n\r\n").await;
        let rest = rest_for(port);
        let result = rest.make_request(Method::GET, "/v4/stats", None).await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_error_status_carries_body() {
        let port = serve_once(
            "HTTP/1.1 404 Not Found\r\nContent-Type: application/json\r\nContent-Length: 27\r\n\r\n{\"error\":\"Unknown session\"}",
        )
        .await;
        let rest = rest_for(port);

        match rest.make_request(Method::GET, "/v4/info", None).await {
            Err(RestError::Http { status, method, body, .. }) => {
                assert_eq!(status, 404);
                assert_eq!(method, Method::GET);
                assert_eq!(body, Some(serde_json::json!({"error": "Unknown session"})));
            }
            other => panic!("expected HTTP error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_plain_text_version() {
        let port = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\n4.0.8",
        )
        .await;
        assert_eq!(rest_for(port).get_version().await.unwrap(), "4.0.8");
    }

    #[tokio::test]
    async fn test_session_endpoints_require_session() {
        // Puerto sin servidor: el error debe producirse antes de cualquier I/O
        let rest = rest_for(9);
        let result = rest.update_player(GuildId::new(1), &UpdatePlayer::stop(), false).await;
        assert!(matches!(result, Err(RestError::NoSession)));
        assert!(matches!(rest.destroy_player(GuildId::new(1)).await, Err(RestError::NoSession)));
        assert_eq!(rest.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_destroyed_transport_rejects_requests() {
        let rest = rest_for(9);
        rest.destroy();
        let result = rest.get_version().await;
        assert!(matches!(result, Err(RestError::Destroyed)));
    }

    #[tokio::test]
    async fn test_streamed_body_is_capped() {
        let chunks = vec![
            Ok::<_, std::io::Error>(Bytes::from(vec![b'a'; 600])),
            Ok(Bytes::from(vec![b'b'; 600])),
        ];
        let result = read_limited(futures::stream::iter(chunks), 1000).await;
        assert!(matches!(result, Err(RestError::ResponseTooLarge { size: 1200, .. })));

        let ok = read_limited(
            futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(b"{}"))]),
            1000,
        )
        .await
        .unwrap();
        assert_eq!(ok, b"{}".to_vec());
    }

    #[tokio::test]
    async fn test_decode_rejects_invalid_tracks_locally() {
        let rest = rest_for(9);
        assert!(matches!(rest.decode_track("not base64!").await, Err(RestError::InvalidTrack)));
        assert!(matches!(rest.decode_tracks(&[]).await, Err(RestError::InvalidTracks)));
    }

    #[test]
    fn test_encoded_track_validation() {
        assert!(is_valid_encoded_track("QAAAjQIAJVJpY2sgQXN0bGV5"));
        assert!(!is_valid_encoded_track(""));
        assert!(!is_valid_encoded_track("not base64!"));
    }
}
