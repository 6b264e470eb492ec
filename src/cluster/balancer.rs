use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::LoadBalancer;
use crate::node::protocol::NodeStats;
use crate::node::Node;

pub const LOAD_CACHE_TTL: Duration = Duration::from_secs(5);
pub const LEAST_USED_CACHE_TTL: Duration = Duration::from_secs(12);
const LOAD_CACHE_CAPACITY: usize = 20;

/// CPU normalizada + players activos + memoria + llamadas REST pendientes
pub fn compute_load(stats: &NodeStats, outstanding_rest_calls: usize) -> f64 {
    let cores = f64::from(stats.cpu.cores.max(1));
    let reservable = stats.memory.reservable.max(1) as f64;

    (stats.cpu.system_load / cores) * 100.0
        + f64::from(stats.playing_players) * 0.75
        + (stats.memory.used as f64 / reservable) * 40.0
        + outstanding_rest_calls as f64 * 0.001
}

pub(crate) struct Balancer {
    strategy: LoadBalancer,
    loads: Mutex<HashMap<String, (f64, Instant)>>,
    least_used: Mutex<Option<(Vec<Arc<Node>>, Instant)>>,
}

impl Balancer {
    pub fn new(strategy: LoadBalancer) -> Self {
        Self {
            strategy,
            loads: Mutex::new(HashMap::new()),
            least_used: Mutex::new(None),
        }
    }

    /// Carga del nodo, cacheada durante 5s
    pub fn node_load(&self, node: &Node) -> f64 {
        let now = Instant::now();
        let mut loads = self.loads.lock();
        if let Some((load, at)) = loads.get(node.name()) {
            if now.duration_since(*at) < LOAD_CACHE_TTL {
                return *load;
            }
        }

        let load = compute_load(&node.stats(), node.rest().outstanding_calls());
        if loads.len() >= LOAD_CACHE_CAPACITY && !loads.contains_key(node.name()) {
            let oldest = loads
                .iter()
                .min_by_key(|(_, (_, at))| *at)
                .map(|(name, _)| name.clone());
            if let Some(oldest) = oldest {
                loads.remove(&oldest);
            }
        }
        loads.insert(node.name().to_string(), (load, now));
        load
    }

    pub fn invalidate(&self) {
        *self.least_used.lock() = None;
    }

    pub fn forget(&self, name: &str) {
        self.loads.lock().remove(name);
        self.invalidate();
    }

    pub fn retain(&self, registered: impl Fn(&str) -> bool) {
        self.loads.lock().retain(|name, _| registered(name.as_str()));
    }

    pub fn clear(&self) {
        self.loads.lock().clear();
        self.invalidate();
    }

    fn sort_by_load(&self, nodes: Vec<Arc<Node>>) -> Vec<Arc<Node>> {
        let mut scored: Vec<(f64, Arc<Node>)> = nodes
            .into_iter()
            .map(|node| (self.node_load(&node), node))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        scored.into_iter().map(|(_, node)| node).collect()
    }

    fn order(&self, nodes: Vec<Arc<Node>>) -> Vec<Arc<Node>> {
        match self.strategy {
            LoadBalancer::LeastLoad => self.sort_by_load(nodes),
            LoadBalancer::LeastRest => {
                let mut nodes = nodes;
                nodes.sort_by_key(|node| node.rest().outstanding_calls());
                nodes
            }
            LoadBalancer::Random => {
                let mut nodes = nodes;
                fastrand::shuffle(&mut nodes);
                nodes
            }
        }
    }

    /// Nodos conectados ordenados por la estrategia, cacheado 12s
    pub fn least_used(&self, nodes: &[Arc<Node>]) -> Vec<Arc<Node>> {
        let now = Instant::now();
        if let Some((cached, at)) = self.least_used.lock().as_ref() {
            if now.duration_since(*at) < LEAST_USED_CACHE_TTL {
                return cached.clone();
            }
        }

        let connected: Vec<Arc<Node>> = nodes.iter().filter(|n| n.is_connected()).cloned().collect();
        let ordered = self.order(connected);
        *self.least_used.lock() = Some((ordered.clone(), now));
        ordered
    }

    /// Nodos conectados que anuncian la región, por carga
    pub fn by_region(&self, nodes: &[Arc<Node>], region: &str) -> Vec<Arc<Node>> {
        let region = region.to_ascii_lowercase();
        let matching: Vec<Arc<Node>> = nodes
            .iter()
            .filter(|n| n.is_connected() && n.regions().iter().any(|r| *r == region))
            .cloned()
            .collect();
        self.sort_by_load(matching)
    }
}
