//! Weighted Least Connections load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::{backend::ServerHandle, LoadBalancer};

/// Weighted least connections selector.
/// Selects the backend minimizing `connections / weight`, compared by
/// cross-multiplication. In case of tie, the first one is selected (stability).
#[derive(Debug)]
pub struct WeightedLeastConnections {
    servers: Vec<Arc<ServerHandle>>,
}

impl WeightedLeastConnections {
    pub fn new(handles: &[Arc<ServerHandle>]) -> Self {
        Self {
            servers: handles.iter().filter(|h| h.weight() > 0).cloned().collect(),
        }
    }
}

impl LoadBalancer for WeightedLeastConnections {
    fn next_server(&self) -> Option<Arc<ServerHandle>> {
        let mut best: Option<(&Arc<ServerHandle>, u64, u64)> = None;

        for server in &self.servers {
            let weight = server.weight() as u64;
            // weights may have changed to zero since the snapshot was built
            if weight == 0 || !server.is_healthy() {
                continue;
            }
            let conns = server.connection_count() as u64;
            match best {
                Some((_, best_conns, best_weight)) if best_conns * weight <= conns * best_weight => {}
                _ => best = Some((server, conns, weight)),
            }
        }
        best.map(|(server, _, _)| server.clone())
    }
}
