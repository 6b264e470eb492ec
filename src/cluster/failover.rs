//! Failover: migrating guild sessions off a failed node, keeping snapshots of
//! the broken ones and rebuilding them when their node comes back.

use futures::future::join_all;
use parking_lot::Mutex;
use serenity::model::id::GuildId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::Aqua;
use crate::config::FailoverConfig;
use crate::error::{AquaError, AquaResult};
use crate::events::AquaEvent;
use crate::node::Node;
use crate::player::{Player, PlayerSnapshot, SEEK_DELAY};

pub const BROKEN_PLAYER_TTL: Duration = Duration::from_secs(300);
pub const MAX_CONCURRENT_OPS: usize = 10;
const FAILOVER_STATE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Default)]
struct NodeFailoverState {
    in_progress: bool,
    last_attempt: Option<Instant>,
    attempts: u32,
}

/// Snapshot de un player cuyo nodo se cayó
#[derive(Debug, Clone)]
pub struct BrokenPlayer {
    pub snapshot: PlayerSnapshot,
    pub original_node: String,
    pub broken_at: Instant,
}

impl BrokenPlayer {
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.duration_since(self.broken_at) < BROKEN_PLAYER_TTL
    }
}

/// Estado de failover propio del cluster, separado del estado de cada nodo
#[derive(Debug, Default)]
pub(crate) struct FailoverState {
    nodes: Mutex<HashMap<String, NodeFailoverState>>,
    broken: Mutex<HashMap<GuildId, BrokenPlayer>>,
    busy_guilds: Mutex<HashSet<GuildId>>,
}

/// Reserva de una guild mientras se migra o reconstruye
pub(crate) struct GuildLock<'a> {
    state: &'a FailoverState,
    guild_id: GuildId,
}

impl Drop for GuildLock<'_> {
    fn drop(&mut self) {
        self.state.busy_guilds.lock().remove(&self.guild_id);
    }
}

impl FailoverState {
    /// Marca el failover como en curso si no lo bloquean el cooldown ni el límite
    pub fn try_begin(&self, node: &str, config: &FailoverConfig, now: Instant) -> bool {
        let mut nodes = self.nodes.lock();
        let state = nodes.entry(node.to_string()).or_default();
        if state.in_progress {
            debug!("Failover de {} ya en curso", node);
            return false;
        }
        if state
            .last_attempt
            .is_some_and(|at| now.duration_since(at) < config.cooldown)
        {
            debug!("Failover de {} en cooldown", node);
            return false;
        }
        if state.attempts >= config.max_failover_attempts {
            warn!("⚠️ Límite de failovers alcanzado para {}", node);
            return false;
        }
        state.in_progress = true;
        state.last_attempt = Some(now);
        state.attempts += 1;
        true
    }

    pub fn finish(&self, node: &str) {
        if let Some(state) = self.nodes.lock().get_mut(node) {
            state.in_progress = false;
        }
    }

    #[cfg(test)]
    pub fn is_in_progress(&self, node: &str) -> bool {
        self.nodes.lock().get(node).is_some_and(|s| s.in_progress)
    }

    /// El nodo volvió: se reinicia el contador de intentos
    pub fn reset_attempts(&self, node: &str) {
        if let Some(state) = self.nodes.lock().get_mut(node) {
            state.attempts = 0;
        }
    }

    pub fn store_broken(&self, snapshot: PlayerSnapshot, original_node: &str, now: Instant) {
        self.broken.lock().insert(
            snapshot.guild_id,
            BrokenPlayer {
                snapshot,
                original_node: original_node.to_string(),
                broken_at: now,
            },
        );
    }

    pub fn remove_broken(&self, guild_id: GuildId) -> Option<BrokenPlayer> {
        self.broken.lock().remove(&guild_id)
    }

    pub fn broken_count(&self) -> usize {
        self.broken.lock().len()
    }

    /// Snapshots vigentes del nodo; los caducados se descartan
    pub fn fresh_for(&self, node: &str, now: Instant) -> Vec<BrokenPlayer> {
        let mut broken = self.broken.lock();
        broken.retain(|_, b| b.is_fresh(now));
        let mut fresh: Vec<BrokenPlayer> = broken
            .values()
            .filter(|b| b.original_node == node)
            .cloned()
            .collect();
        fresh.sort_by_key(|b| b.snapshot.guild_id);
        fresh
    }

    pub fn lock_guild(&self, guild_id: GuildId) -> Option<GuildLock<'_>> {
        self.busy_guilds
            .lock()
            .insert(guild_id)
            .then_some(GuildLock {
                state: self,
                guild_id,
            })
    }

    /// Purga snapshots caducados y estado de nodos viejos o ya no registrados
    pub fn cleanup(&self, now: Instant, registered: impl Fn(&str) -> bool) -> usize {
        let mut removed = 0;
        {
            let mut broken = self.broken.lock();
            let before = broken.len();
            broken.retain(|_, b| b.is_fresh(now));
            removed += before - broken.len();
        }
        {
            let mut nodes = self.nodes.lock();
            let before = nodes.len();
            nodes.retain(|name, state| {
                let expired = !state.in_progress
                    && state
                        .last_attempt
                        .is_some_and(|at| now.duration_since(at) >= FAILOVER_STATE_TTL);
                registered(name.as_str()) && !expired
            });
            removed += before - nodes.len();
        }
        removed
    }
}

/// Reparto voraz: cada player va al candidato con menor carga + asignados
pub(crate) struct MigrationPlanner {
    candidates: Vec<(Arc<Node>, f64)>,
    assigned: Mutex<Vec<u32>>,
}

impl MigrationPlanner {
    pub fn new(candidates: Vec<(Arc<Node>, f64)>) -> Self {
        let assigned = Mutex::new(vec![0; candidates.len()]);
        Self {
            candidates,
            assigned,
        }
    }

    /// Candidato conectado con menor carga + asignados; empata a favor del primero
    pub fn pick(&self) -> Option<Arc<Node>> {
        let mut assigned = self.assigned.lock();
        let mut best: Option<(usize, f64)> = None;
        for (index, (node, load)) in self.candidates.iter().enumerate() {
            if !node.is_connected() {
                continue;
            }
            let score = load + f64::from(assigned[index]);
            if best.map_or(true, |(_, best_score)| score < best_score) {
                best = Some((index, score));
            }
        }
        let (index, _) = best?;
        assigned[index] += 1;
        Some(Arc::clone(&self.candidates[index].0))
    }

    /// Devuelve la asignación de un intento fallido
    pub fn release(&self, node: &Arc<Node>) {
        let mut assigned = self.assigned.lock();
        if let Some(index) = self.candidates.iter().position(|(c, _)| Arc::ptr_eq(c, node)) {
            assigned[index] = assigned[index].saturating_sub(1);
        }
    }

    pub fn assigned(&self) -> Vec<u32> {
        self.assigned.lock().clone()
    }
}

#[derive(Debug)]
pub enum MigrationOutcome {
    Migrated { guild_id: GuildId, node: String },
    Failed { guild_id: GuildId, error: AquaError },
}

impl MigrationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Migrated { .. })
    }
}

/// Resultado agregado de una ronda de failover
#[derive(Debug, Default)]
pub struct FailoverReport {
    pub results: Vec<MigrationOutcome>,
}

impl FailoverReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}

fn retry_delay(base: Duration, retry: u32) -> Duration {
    base.mul_f64(1.5f64.powi(retry.min(10) as i32))
}

impl Aqua {
    /// Migra todos los players de un nodo caído a los demás nodos conectados
    pub async fn handle_node_failover(self: &Arc<Self>, failed: Arc<Node>) -> Option<FailoverReport> {
        let config = &self.config.failover;
        if !config.enabled || self.is_destroyed() {
            return None;
        }
        let name = failed.name().to_string();
        if !self.failover.try_begin(&name, config, Instant::now()) {
            return None;
        }
        let report = self.run_failover(&failed).await;
        self.failover.finish(&name);
        report
    }

    async fn run_failover(self: &Arc<Self>, failed: &Arc<Node>) -> Option<FailoverReport> {
        let name = failed.name().to_string();
        let mut affected: Vec<Arc<Player>> = self
            .players
            .iter()
            .filter(|entry| Arc::ptr_eq(entry.value().node(), failed))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        if affected.is_empty() {
            debug!("Failover de {}: sin players afectados", name);
            return None;
        }
        affected.sort_by_key(|player| player.guild_id());

        let candidates: Vec<(Arc<Node>, f64)> = self
            .nodes()
            .into_iter()
            .filter(|node| node.is_connected() && !Arc::ptr_eq(node, failed))
            .map(|node| {
                let load = self.balancer.node_load(&node);
                (node, load)
            })
            .collect();
        if candidates.is_empty() {
            self.events.error(AquaError::NoFailoverNodes(name.clone()).to_string());
            return None;
        }

        warn!(
            "🚑 Failover de {}: migrando {} players a {} nodos",
            name,
            affected.len(),
            candidates.len()
        );
        self.events.emit(AquaEvent::NodeFailover { node: name.clone() });

        let planner = MigrationPlanner::new(candidates);
        let mut report = FailoverReport::default();
        for chunk in affected.chunks(MAX_CONCURRENT_OPS) {
            let batch = chunk
                .iter()
                .map(|player| self.migrate_player(Arc::clone(player), &planner));
            report.results.extend(join_all(batch).await);
        }
        debug!("Reparto del failover de {}: {:?}", name, planner.assigned());

        info!(
            "✅ Failover de {} completado: {} migrados, {} fallidos",
            name,
            report.succeeded(),
            report.failed()
        );
        self.events.emit(AquaEvent::NodeFailoverComplete {
            node: name,
            succeeded: report.succeeded(),
            failed: report.failed(),
        });
        Some(report)
    }

    async fn migrate_player(
        self: &Arc<Self>,
        player: Arc<Player>,
        planner: &MigrationPlanner,
    ) -> MigrationOutcome {
        let guild_id = player.guild_id();
        let Some(_lock) = self.failover.lock_guild(guild_id) else {
            return MigrationOutcome::Failed {
                guild_id,
                error: AquaError::GuildBusy(guild_id),
            };
        };
        let from = player.node().name().to_string();
        let initial = player.capture();
        let retries = self.config.failover.max_retries.max(1);
        let mut last_error = AquaError::NoFailoverNodes(from.clone());

        for attempt in 0..retries {
            if attempt > 0 {
                tokio::time::sleep(retry_delay(self.config.failover.retry_delay, attempt - 1)).await;
            }
            if self.is_destroyed() {
                return MigrationOutcome::Failed {
                    guild_id,
                    error: AquaError::NotInitialized,
                };
            }
            // Cada intento elige destino de nuevo: el anterior pudo caerse
            let Some(target) = planner.pick() else {
                last_error = AquaError::NoFailoverNodes(from.clone());
                continue;
            };
            // Mientras el player original siga vivo se vuelve a capturar su estado
            let snapshot = if player.is_destroyed() {
                initial.clone()
            } else {
                player.capture()
            };

            match self.move_to(&snapshot, &target).await {
                Ok(()) => {
                    self.failover.remove_broken(guild_id);
                    info!("🔀 Guild {} migrada de {} a {}", guild_id, from, target.name());
                    self.events.emit(AquaEvent::PlayerMigrated {
                        guild_id,
                        from,
                        to: target.name().to_string(),
                    });
                    return MigrationOutcome::Migrated {
                        guild_id,
                        node: target.name().to_string(),
                    };
                }
                Err(e) => {
                    debug!(
                        "Intento {} de migrar guild {} a {} falló: {}",
                        attempt + 1,
                        guild_id,
                        target.name(),
                        e
                    );
                    planner.release(&target);
                    last_error = e;
                }
            }
        }

        warn!("❌ No se pudo migrar guild {}: {}", guild_id, last_error);
        MigrationOutcome::Failed {
            guild_id,
            error: last_error,
        }
    }

    /// Crea el player en `target` y le restaura el snapshot
    async fn move_to(self: &Arc<Self>, snapshot: &PlayerSnapshot, target: &Arc<Node>) -> AquaResult<()> {
        if !target.is_connected() {
            return Err(AquaError::NodeUnavailable(target.name().to_string()));
        }
        let options = snapshot
            .options()
            .ok_or_else(|| AquaError::Gateway(format!("guild {} has no voice channel", snapshot.guild_id)))?;
        let player = self.install_player(Arc::clone(target), &options);
        if let Err(e) = player.connect() {
            player.destroy(true);
            return Err(e);
        }
        self.restore_state(&player, snapshot).await;
        Ok(())
    }

    /// Cola, volumen y loop; luego reanuda el track actual si corresponde.
    /// Los fallos de reproducción no deshacen el player: la cola se conserva.
    pub(crate) async fn restore_state(&self, player: &Arc<Player>, snapshot: &PlayerSnapshot) {
        let config = &self.config.failover;
        player.apply_snapshot(snapshot, true);

        if snapshot.current.is_none() || !config.resume_playback || !(snapshot.playing || snapshot.paused) {
            return;
        }
        if let Err(e) = player.play().await {
            self.events.debug(format!(
                "[Failover] No se pudo reanudar la reproducción en guild {}: {}",
                snapshot.guild_id, e
            ));
            return;
        }
        if config.preserve_position && snapshot.position > 0 {
            player.seek_after(snapshot.position, SEEK_DELAY);
        }
        if snapshot.paused {
            if let Err(e) = player.pause(true).await {
                self.events.debug(format!(
                    "[Failover] No se pudo pausar guild {}: {}",
                    snapshot.guild_id, e
                ));
            }
        }
    }

    /// Guarda un snapshot de cada player del nodo caído
    pub(crate) fn store_broken_players(&self, node: &Arc<Node>) -> usize {
        let now = Instant::now();
        let mut stored = 0;
        for entry in self.players.iter() {
            let player = entry.value();
            if Arc::ptr_eq(player.node(), node) && !player.is_destroyed() {
                self.failover.store_broken(player.capture(), node.name(), now);
                stored += 1;
            }
        }
        if stored > 0 {
            debug!("{} players rotos guardados para {}", stored, node.name());
        }
        stored
    }

    /// Reconstruye en su nodo original los players rotos aún vigentes
    pub async fn rebuild_broken_players(self: &Arc<Self>, node: Arc<Node>, resumed: bool) -> usize {
        let pending = self.failover.fresh_for(node.name(), Instant::now());
        if pending.is_empty() {
            return 0;
        }
        info!("🔧 Reconstruyendo {} players en {}", pending.len(), node.name());

        let mut rebuilt = 0;
        for chunk in pending.chunks(MAX_CONCURRENT_OPS) {
            let batch = chunk
                .iter()
                .map(|broken| self.rebuild_player(&node, broken, resumed));
            for result in join_all(batch).await {
                match result {
                    Ok(()) => rebuilt += 1,
                    Err(e) => debug!("Reconstrucción fallida en {}: {}", node.name(), e),
                }
            }
        }

        self.events.emit(AquaEvent::PlayersRebuilt {
            node: node.name().to_string(),
            count: rebuilt,
        });
        rebuilt
    }

    async fn rebuild_player(
        self: &Arc<Self>,
        node: &Arc<Node>,
        broken: &BrokenPlayer,
        resumed: bool,
    ) -> AquaResult<()> {
        let guild_id = broken.snapshot.guild_id;
        let _lock = self
            .failover
            .lock_guild(guild_id)
            .ok_or(AquaError::GuildBusy(guild_id))?;

        if !broken.is_fresh(Instant::now()) {
            self.failover.remove_broken(guild_id);
            return Err(AquaError::Timeout("broken player snapshot"));
        }

        let existing = self.get_player(guild_id);
        if let Some(existing) = &existing {
            let on_this_node = Arc::ptr_eq(existing.node(), node);
            if resumed && on_this_node {
                // La sesión se reanudó: el player remoto sigue vivo
                self.failover.remove_broken(guild_id);
                return Ok(());
            }
            if !on_this_node && existing.node().is_connected() {
                self.failover.remove_broken(guild_id);
                return Ok(());
            }
        }

        let options = broken
            .snapshot
            .options()
            .ok_or_else(|| AquaError::Gateway(format!("guild {} has no voice channel", guild_id)))?;
        let player = self.install_player(Arc::clone(node), &options);
        player.connect()?;
        self.restore_state(&player, &broken.snapshot).await;
        self.failover.remove_broken(guild_id);
        Ok(())
    }

    /// Limpieza periódica de snapshots y estado de failover
    pub fn perform_cleanup(&self) {
        let registered: Vec<String> = self.nodes().iter().map(|n| n.name().to_string()).collect();
        let removed = self
            .failover
            .cleanup(Instant::now(), |name| registered.iter().any(|r| r == name));
        self.balancer.retain(|name| registered.iter().any(|r| r == name));
        if removed > 0 {
            debug!(
                "Limpieza: {} entradas de failover eliminadas ({} players rotos pendientes)",
                removed,
                self.failover.broken_count()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::{test_aqua, test_node};
    use crate::node::protocol::{Cpu, StatsPayload};
    use crate::player::PlayerOptions;
    use pretty_assertions::assert_eq;
    use serenity::model::id::ChannelId;

    fn with_load(node: &Arc<Node>, system_load: f64) {
        node.update_stats(&StatsPayload {
            cpu: Some(Cpu {
                cores: 1,
                system_load,
                lavalink_load: 0.0,
            }),
            ..Default::default()
        });
    }

    fn failover_config() -> FailoverConfig {
        FailoverConfig {
            cooldown: Duration::from_secs(5),
            max_failover_attempts: 2,
            ..FailoverConfig::default()
        }
    }

    #[test]
    fn test_retry_delay_grows() {
        let base = Duration::from_millis(1000);
        assert_eq!(retry_delay(base, 0), Duration::from_millis(1000));
        assert_eq!(retry_delay(base, 1), Duration::from_millis(1500));
        assert_eq!(retry_delay(base, 2), Duration::from_millis(2250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_guards() {
        let state = FailoverState::default();
        let config = failover_config();

        assert!(state.try_begin("a", &config, Instant::now()));
        assert!(!state.try_begin("a", &config, Instant::now()));
        state.finish("a");
        assert!(!state.try_begin("a", &config, Instant::now()));

        tokio::time::advance(config.cooldown).await;
        assert!(state.try_begin("a", &config, Instant::now()));
        state.finish("a");

        tokio::time::advance(config.cooldown).await;
        assert!(!state.try_begin("a", &config, Instant::now()));
        state.reset_attempts("a");
        assert!(state.try_begin("a", &config, Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_snapshot_ttl() {
        let aqua = test_aqua();
        let node = test_node(&aqua, "a", true);
        let player = aqua.install_player(
            Arc::clone(&node),
            &PlayerOptions::new(GuildId::new(1), ChannelId::new(10)),
        );

        let state = FailoverState::default();
        let recorded_at = Instant::now();
        state.store_broken(player.capture(), "a", recorded_at);

        tokio::time::advance(BROKEN_PLAYER_TTL - Duration::from_millis(1)).await;
        assert_eq!(state.fresh_for("a", Instant::now()).len(), 1);
        assert!(state.fresh_for("b", Instant::now()).is_empty());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(state.fresh_for("a", Instant::now()).is_empty());
        assert_eq!(state.broken_count(), 0);
    }

    #[tokio::test]
    async fn test_guild_lock_is_exclusive() {
        let state = FailoverState::default();
        let lock = state.lock_guild(GuildId::new(1));
        assert!(lock.is_some());
        assert!(state.lock_guild(GuildId::new(1)).is_none());
        assert!(state.lock_guild(GuildId::new(2)).is_some());
        drop(lock);
        assert!(state.lock_guild(GuildId::new(1)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_drops_unregistered_and_expired() {
        let state = FailoverState::default();
        let config = failover_config();
        assert!(state.try_begin("gone", &config, Instant::now()));
        state.finish("gone");
        assert!(state.try_begin("kept", &config, Instant::now()));
        state.finish("kept");

        assert_eq!(state.cleanup(Instant::now(), |name| name == "kept"), 1);
        assert!(!state.is_in_progress("kept"));

        tokio::time::advance(FAILOVER_STATE_TTL).await;
        assert_eq!(state.cleanup(Instant::now(), |_| true), 1);
    }

    #[tokio::test]
    async fn test_greedy_spread_example() {
        let aqua = test_aqua();
        let b = test_node(&aqua, "b", true);
        let c = test_node(&aqua, "c", true);
        let planner = MigrationPlanner::new(vec![(Arc::clone(&b), 10.0), (Arc::clone(&c), 10.5)]);

        let picks: Vec<String> = (0..3)
            .filter_map(|_| planner.pick())
            .map(|node| node.name().to_string())
            .collect();
        assert_eq!(picks, vec!["b", "c", "b"]);
        assert_eq!(planner.assigned(), vec![2, 1]);
        assert!(MigrationPlanner::new(Vec::new()).pick().is_none());
    }

    #[tokio::test]
    async fn test_greedy_keeps_filling_much_lighter_node() {
        let aqua = test_aqua();
        let b = test_node(&aqua, "b", true);
        let c = test_node(&aqua, "c", true);
        // Cada asignación suma 1 al puntaje: 20 puntos de diferencia no se cierran con 3 players
        let planner = MigrationPlanner::new(vec![(Arc::clone(&b), 10.0), (Arc::clone(&c), 30.0)]);

        let picks: Vec<String> = (0..3)
            .filter_map(|_| planner.pick())
            .map(|node| node.name().to_string())
            .collect();
        assert_eq!(picks, vec!["b", "b", "b"]);
        assert_eq!(planner.assigned(), vec![3, 0]);
    }

    #[tokio::test]
    async fn test_planner_skips_disconnected_and_releases() {
        let aqua = test_aqua();
        let b = test_node(&aqua, "b", true);
        let c = test_node(&aqua, "c", true);
        let planner = MigrationPlanner::new(vec![(Arc::clone(&b), 0.0), (Arc::clone(&c), 50.0)]);

        let first = planner.pick().unwrap();
        assert_eq!(first.name(), "b");
        planner.release(&first);
        assert_eq!(planner.assigned(), vec![0, 0]);

        b.set_state(crate::node::NodeState::Disconnected);
        assert_eq!(planner.pick().unwrap().name(), "c");
        c.set_state(crate::node::NodeState::Disconnected);
        assert!(planner.pick().is_none());
        assert_eq!(planner.assigned(), vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_migration_picks_a_new_target_on_each_retry() {
        let aqua = test_aqua();
        let a = test_node(&aqua, "a", true);
        let b = test_node(&aqua, "b", true);
        let c = test_node(&aqua, "c", false);
        let player = aqua.install_player(
            Arc::clone(&a),
            &PlayerOptions::new(GuildId::new(1), ChannelId::new(10)),
        );
        let planner = MigrationPlanner::new(vec![(Arc::clone(&b), 0.0), (Arc::clone(&c), 50.0)]);

        // El destino preferido cae y otro nodo vuelve antes del reintento
        b.set_state(crate::node::NodeState::Disconnected);
        let revived = Arc::clone(&c);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            revived.set_state(crate::node::NodeState::Connected);
        });

        let outcome = aqua.migrate_player(player, &planner).await;
        assert!(matches!(
            outcome,
            MigrationOutcome::Migrated { ref node, .. } if node == "c"
        ));
        assert!(Arc::ptr_eq(aqua.get_player(GuildId::new(1)).unwrap().node(), &c));
        assert_eq!(planner.assigned(), vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_keeps_playing_guild_and_queue() {
        let aqua = test_aqua();
        let a = test_node(&aqua, "a", true);
        let b = test_node(&aqua, "b", true);
        let player = aqua.install_player(
            Arc::clone(&a),
            &PlayerOptions::new(GuildId::new(1), ChannelId::new(10)),
        );
        player.add(crate::player::track::test_track("y", 60_000));
        player.force_playing(crate::player::track::test_track("x", 120_000), 30_000);
        a.set_state(crate::node::NodeState::Disconnected);

        // Sin playerUpdate del nodo nuevo, play() agota su espera de conexión
        let report = aqua.handle_node_failover(Arc::clone(&a)).await.unwrap();
        assert_eq!((report.succeeded(), report.failed()), (1, 0));

        let migrated = aqua.get_player(GuildId::new(1)).unwrap();
        assert!(Arc::ptr_eq(migrated.node(), &b));
        assert!(!migrated.is_destroyed());
        assert_eq!(migrated.queue_len(), 2);
        assert_eq!(b.player_count(), 1);
    }

    #[tokio::test]
    async fn test_failover_moves_every_guild_exactly_once() {
        let aqua = test_aqua();
        let a = test_node(&aqua, "a", true);
        let b = test_node(&aqua, "b", true);
        let c = test_node(&aqua, "c", true);
        with_load(&b, 0.10);
        with_load(&c, 0.105);

        for guild in 1..=3 {
            aqua.install_player(
                Arc::clone(&a),
                &PlayerOptions::new(GuildId::new(guild), ChannelId::new(100 + guild)),
            );
        }
        a.set_state(crate::node::NodeState::Disconnected);
        aqua.store_broken_players(&a);
        assert_eq!(aqua.failover.broken_count(), 3);

        let report = aqua.handle_node_failover(Arc::clone(&a)).await.unwrap();
        assert_eq!((report.succeeded(), report.failed()), (3, 0));

        let placement: Vec<(u64, String)> = (1..=3)
            .map(|guild| {
                let player = aqua.get_player(GuildId::new(guild)).unwrap();
                (guild, player.node().name().to_string())
            })
            .collect();
        assert_eq!(
            placement,
            vec![(1, "b".to_string()), (2, "c".to_string()), (3, "b".to_string())]
        );
        assert_eq!(a.player_count(), 0);
        assert_eq!(b.player_count() + c.player_count(), 3);
        assert_eq!(aqua.failover.broken_count(), 0);
        assert_eq!(
            aqua.get_player(GuildId::new(2)).unwrap().voice_channel(),
            Some(ChannelId::new(102))
        );
        assert!(!aqua.failover.is_in_progress("a"));
    }

    #[tokio::test]
    async fn test_failover_without_candidates_keeps_players() {
        let aqua = test_aqua();
        let a = test_node(&aqua, "a", false);
        let _b = test_node(&aqua, "b", false);
        let player = aqua.install_player(
            Arc::clone(&a),
            &PlayerOptions::new(GuildId::new(1), ChannelId::new(10)),
        );
        let mut events = aqua.events().subscribe();

        assert!(aqua.handle_node_failover(Arc::clone(&a)).await.is_none());
        assert!(Arc::ptr_eq(&aqua.get_player(GuildId::new(1)).unwrap(), &player));
        let errors = crate::events::drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, AquaEvent::Error { .. }))
            .count();
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn test_rebuild_on_original_node() {
        let aqua = test_aqua();
        let a = test_node(&aqua, "a", true);
        let player = aqua.install_player(
            Arc::clone(&a),
            &PlayerOptions::new(GuildId::new(7), ChannelId::new(70)).with_volume(55),
        );
        player.add(crate::player::track::test_track("x", 1000));
        aqua.store_broken_players(&a);

        assert_eq!(aqua.rebuild_broken_players(Arc::clone(&a), false).await, 1);
        let rebuilt = aqua.get_player(GuildId::new(7)).unwrap();
        assert!(!Arc::ptr_eq(&rebuilt, &player));
        assert!(player.is_destroyed());
        assert_eq!(rebuilt.volume(), 55);
        assert_eq!(rebuilt.queue_len(), 1);
        assert_eq!(aqua.failover.broken_count(), 0);
        assert_eq!(a.player_count(), 1);
    }
}
