use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info};

use super::track::Track;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    #[default]
    None,
    Track,
    Queue,
}

/// Cola FIFO de tracks de una guild
#[derive(Debug, Clone, Default)]
pub struct Queue {
    items: VecDeque<Track>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, track: Track) {
        debug!("➕ Agregado a la cola: {}", track.title());
        self.items.push_back(track);
    }

    pub fn extend(&mut self, tracks: impl IntoIterator<Item = Track>) -> usize {
        let before = self.items.len();
        self.items.extend(tracks);
        let added = self.items.len() - before;
        if added > 0 {
            debug!("➕ Agregadas {} canciones a la cola", added);
        }
        added
    }

    /// Coloca un track al frente (lo siguiente en sonar)
    pub fn push_front(&mut self, track: Track) {
        self.items.push_front(track);
    }

    pub fn pop_front(&mut self) -> Option<Track> {
        self.items.pop_front()
    }

    pub fn remove(&mut self, index: usize) -> Option<Track> {
        self.items.remove(index)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn shuffle(&mut self) {
        let items = self.items.make_contiguous();
        items.shuffle(&mut rand::thread_rng());
        info!("🔀 Cola mezclada");
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.items.iter()
    }

    /// Copia de los primeros `limit` tracks
    pub fn head(&self, limit: usize) -> Vec<Track> {
        self.items.iter().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::track::test_track;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fifo_order_and_front_insert() {
        let mut queue = Queue::new();
        queue.push(test_track("a", 1000));
        queue.extend(vec![test_track("b", 1000), test_track("c", 1000)]);
        queue.push_front(test_track("z", 1000));

        let ids: Vec<_> = queue.iter().map(|t| t.info.identifier.clone()).collect();
        assert_eq!(ids, vec!["z", "a", "b", "c"]);
        assert_eq!(queue.pop_front().map(|t| t.info.identifier), Some("z".to_string()));
        assert_eq!(queue.head(1).len(), 1);
    }

    #[test]
    fn test_shuffle_keeps_items() {
        let mut queue = Queue::new();
        queue.extend((0..20).map(|i| test_track(&i.to_string(), 1000)));
        queue.shuffle();
        assert_eq!(queue.len(), 20);
    }
}
