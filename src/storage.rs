use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::player::queue::LoopMode;
use crate::player::track::Requester;
use crate::player::PlayerSnapshot;

/// Tracks de cola que se guardan por guild
pub const MAX_QUEUE_SAVE: usize = 10;

/// Una línea del archivo NDJSON de players
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    #[serde(rename = "g")]
    pub guild_id: GuildId,
    #[serde(rename = "t", default)]
    pub text_channel: Option<ChannelId>,
    #[serde(rename = "v", default)]
    pub voice_channel: Option<ChannelId>,
    #[serde(rename = "u", default)]
    pub current_uri: Option<String>,
    #[serde(rename = "p", default)]
    pub position: u64,
    #[serde(rename = "ts", default)]
    pub timestamp: i64,
    #[serde(rename = "q", default)]
    pub queue: Vec<String>,
    /// `id:username`
    #[serde(rename = "r", default)]
    pub requester: Option<String>,
    #[serde(rename = "vol", default = "default_volume")]
    pub volume: u16,
    #[serde(rename = "pa", default)]
    pub paused: bool,
    #[serde(rename = "pl", default)]
    pub playing: bool,
    #[serde(rename = "lp", default)]
    pub loop_mode: LoopMode,
    #[serde(default)]
    pub resuming: bool,
}

fn default_volume() -> u16 {
    100
}

impl PlayerRecord {
    pub fn from_snapshot(snapshot: &PlayerSnapshot) -> Self {
        let requester = snapshot
            .current
            .as_ref()
            .and_then(|track| track.requester.as_ref())
            .map(|r| format!("{}:{}", r.id, r.username));

        Self {
            guild_id: snapshot.guild_id,
            text_channel: snapshot.text_channel,
            voice_channel: snapshot.voice_channel,
            current_uri: snapshot
                .current
                .as_ref()
                .and_then(|track| track.uri().map(str::to_owned)),
            position: snapshot.position,
            timestamp: snapshot.captured_at.timestamp_millis(),
            queue: snapshot
                .queue
                .iter()
                .filter_map(|track| track.uri().map(str::to_owned))
                .take(MAX_QUEUE_SAVE)
                .collect(),
            requester,
            volume: snapshot.volume,
            paused: snapshot.paused,
            playing: snapshot.playing,
            loop_mode: snapshot.loop_mode,
            resuming: true,
        }
    }

    pub fn requester(&self) -> Option<Requester> {
        let (id, username) = self.requester.as_deref()?.split_once(':')?;
        Some(Requester::new(id, username))
    }
}

/// Persistencia NDJSON de players con archivo de lock y escritura atómica
#[derive(Debug, Clone)]
pub struct PlayerStorage {
    path: PathBuf,
}

impl PlayerStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    async fn acquire_lock(&self) -> Result<PathBuf> {
        let lock = self.sibling(".lock");
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                bail!("otra operación está usando {}", self.path.display())
            }
            Err(e) => return Err(e).context("no se pudo crear el lock"),
        };
        file.write_all(std::process::id().to_string().as_bytes()).await?;
        Ok(lock)
    }

    async fn release_lock(lock: &Path) {
        if let Err(e) = fs::remove_file(lock).await {
            debug!("No se pudo borrar el lock {}: {}", lock.display(), e);
        }
    }

    /// Escribe todos los registros (tmp + rename)
    pub async fn save(&self, records: &[PlayerRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let lock = self.acquire_lock().await?;
        let result = self.write_records(records).await;
        Self::release_lock(&lock).await;

        match result {
            Ok(()) => {
                info!("💾 {} players guardados en {}", records.len(), self.path.display());
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(self.sibling(".tmp")).await;
                Err(e)
            }
        }
    }

    async fn write_records(&self, records: &[PlayerRecord]) -> Result<()> {
        let tmp = self.sibling(".tmp");
        let mut buffer = String::new();
        for record in records {
            buffer.push_str(&serde_json::to_string(record)?);
            buffer.push('\n');
        }

        let mut file = fs::File::create(&tmp)
            .await
            .with_context(|| format!("no se pudo crear {}", tmp.display()))?;
        file.write_all(buffer.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("no se pudo renombrar {}", tmp.display()))?;
        Ok(())
    }

    /// Lee los registros y vacía el archivo; las líneas inválidas se descartan
    pub async fn load(&self) -> Result<Vec<PlayerRecord>> {
        if fs::metadata(&self.path).await.is_err() {
            return Ok(Vec::new());
        }
        let lock = self.acquire_lock().await?;
        let result = self.read_and_truncate().await;
        Self::release_lock(&lock).await;
        result
    }

    async fn read_and_truncate(&self) -> Result<Vec<PlayerRecord>> {
        let content = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("no se pudo leer {}", self.path.display()))?;

        let mut records = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PlayerRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Línea {} inválida en {}: {}", index + 1, self.path.display(), e),
            }
        }

        fs::write(&self.path, "").await?;
        if !records.is_empty() {
            info!("📂 {} players cargados de {}", records.len(), self.path.display());
        }
        Ok(records)
    }
}
