use parking_lot::Mutex;
use serenity::model::id::GuildId;

use crate::node::protocol::{UpdatePlayer, VoiceData};

/// Capacidad por defecto del pool de payloads de voz
pub const POOL_SIZE: usize = 12;

/// Payload de actualización de voz reutilizable
#[derive(Debug, Default)]
pub struct VoiceUpdate {
    pub guild_id: Option<GuildId>,
    pub update: UpdatePlayer,
}

impl VoiceUpdate {
    /// Rellena el payload conservando la memoria de los strings
    pub fn fill(
        &mut self,
        guild_id: GuildId,
        session_id: &str,
        endpoint: &str,
        token: &str,
        volume: u16,
        resume_sequence: Option<u64>,
    ) {
        self.guild_id = Some(guild_id);
        self.update.volume = Some(volume);

        let voice = self.update.voice.get_or_insert_with(VoiceData::default);
        voice.session_id.clear();
        voice.session_id.push_str(session_id);
        voice.endpoint.clear();
        voice.endpoint.push_str(endpoint);
        voice.token.clear();
        voice.token.push_str(token);
        voice.resume = resume_sequence.map(|_| true);
        voice.sequence = resume_sequence;
    }

    fn reset(&mut self) {
        self.guild_id = None;
        self.update.volume = None;
        if let Some(voice) = self.update.voice.as_mut() {
            voice.session_id.clear();
            voice.endpoint.clear();
            voice.token.clear();
            voice.channel_id = None;
            voice.resume = None;
            voice.sequence = None;
        }
    }
}

/// Free-list de payloads de voz con capacidad fija
#[derive(Debug)]
pub struct PayloadPool {
    free: Mutex<Vec<VoiceUpdate>>,
    capacity: usize,
}

impl PayloadPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn acquire(&self) -> VoiceUpdate {
        self.free.lock().pop().unwrap_or_default()
    }

    /// Devuelve el payload; se descarta si el pool está lleno
    pub fn release(&self, mut payload: VoiceUpdate) {
        payload.reset();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(payload);
        }
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for PayloadPool {
    fn default() -> Self {
        Self::new(POOL_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_release_resets_and_respects_capacity() {
        let pool = PayloadPool::new(2);
        let mut payloads: Vec<_> = (0..3).map(|_| pool.acquire()).collect();
        payloads[0].fill(GuildId::new(1), "sess", "us-east1.discord.media", "tok", 100, Some(7));

        for payload in payloads {
            pool.release(payload);
        }
        assert_eq!(pool.available(), 2);

        let reused = pool.acquire();
        assert_eq!(reused.guild_id, None);
        assert_eq!(reused.update.volume, None);
        if let Some(voice) = reused.update.voice {
            assert!(voice.token.is_empty());
            assert_eq!(voice.sequence, None);
        }
    }

    #[test]
    fn test_fill_sets_resume_fields() {
        let mut payload = VoiceUpdate::default();
        payload.fill(GuildId::new(1), "sess", "endpoint", "tok", 80, None);
        let voice = payload.update.voice.as_ref().unwrap();
        assert_eq!(voice.resume, None);

        payload.fill(GuildId::new(1), "sess", "endpoint", "tok", 80, Some(12));
        let voice = payload.update.voice.as_ref().unwrap();
        assert_eq!(voice.resume, Some(true));
        assert_eq!(voice.sequence, Some(12));
    }
}
