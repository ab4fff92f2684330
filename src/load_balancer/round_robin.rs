//! Weighted round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::load_balancer::{backend::ServerHandle, LoadBalancer};

/// Weighted round-robin selector.
/// Walks a precomputed sequence of indices whose counts match the weights.
#[derive(Debug)]
pub struct WeightedRoundRobin {
    servers: Vec<Arc<ServerHandle>>,
    sequence: Vec<usize>,
    cursor: AtomicUsize,
}

impl WeightedRoundRobin {
    /// Build over the positive-weight members of `handles` with a random rotation.
    pub fn new(handles: &[Arc<ServerHandle>]) -> Self {
        let servers = positive(handles);
        let len: usize = servers.iter().map(|s| s.weight() as usize).sum();
        let offset = if len == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..len)
        };
        Self::build(servers, offset)
    }

    /// Build with a fixed rotation offset.
    pub fn with_offset(handles: &[Arc<ServerHandle>], offset: usize) -> Self {
        Self::build(positive(handles), offset)
    }

    fn build(servers: Vec<Arc<ServerHandle>>, offset: usize) -> Self {
        let weights: Vec<u32> = servers.iter().map(|s| s.weight()).collect();
        let plain = build_sequence(&weights);
        let len = plain.len();
        let mut sequence = vec![0; len];
        for (i, idx) in plain.into_iter().enumerate() {
            sequence[(i + offset) % len] = idx;
        }
        Self {
            servers,
            sequence,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn sequence(&self) -> &[usize] {
        &self.sequence
    }
}

fn positive(handles: &[Arc<ServerHandle>]) -> Vec<Arc<ServerHandle>> {
    handles.iter().filter(|h| h.weight() > 0).cloned().collect()
}

/// Smooth weighted sequence: `weights.sum()` picks, each weight picked `weight` times.
///
/// Each step picks the largest current value (first wins ties), subtracts the
/// total from it, then adds every weight back.
pub fn build_sequence(weights: &[u32]) -> Vec<usize> {
    let total: i64 = weights.iter().map(|&w| w as i64).sum();
    let mut current: Vec<i64> = weights.iter().map(|&w| w as i64).collect();
    let mut sequence = Vec::with_capacity(total as usize);

    for _ in 0..total {
        let mut max = 0;
        for i in 1..current.len() {
            if current[i] > current[max] {
                max = i;
            }
        }
        sequence.push(max);
        current[max] -= total;
        for (c, &w) in current.iter_mut().zip(weights) {
            *c += w as i64;
        }
    }
    sequence
}

impl LoadBalancer for WeightedRoundRobin {
    fn next_server(&self) -> Option<Arc<ServerHandle>> {
        let len = self.sequence.len();
        if len == 0 {
            return None;
        }

        // bounded: every slot of the sequence is visited at most once
        for _ in 0..len {
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
            let server = &self.servers[self.sequence[idx]];
            if server.is_healthy() {
                return Some(server.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::backend::tests::handle;

    #[test]
    fn test_sequence_for_5_3_2() {
        assert_eq!(build_sequence(&[5, 3, 2]), vec![0, 1, 2, 0, 0, 1, 0, 2, 1, 0]);
    }

    #[test]
    fn test_sequence_length_is_weight_sum() {
        assert_eq!(build_sequence(&[2, 2]).len(), 4);
        assert_eq!(build_sequence(&[1]), vec![0]);
        assert!(build_sequence(&[]).is_empty());
    }

    #[test]
    fn test_full_cycle_matches_weights_for_every_offset() {
        let handles = vec![
            handle("a", 1, 5, true),
            handle("b", 2, 3, true),
            handle("c", 3, 2, true),
        ];
        for offset in 0..10 {
            let wrr = WeightedRoundRobin::with_offset(&handles, offset);
            let mut counts = [0usize; 3];
            for _ in 0..10 {
                let picked = wrr.next_server().unwrap();
                let i = handles.iter().position(|h| Arc::ptr_eq(h, &picked)).unwrap();
                counts[i] += 1;
            }
            assert_eq!(counts, [5, 3, 2], "offset {}", offset);
        }
    }

    #[test]
    fn test_offset_rotates_sequence() {
        let handles = vec![handle("a", 1, 5, true), handle("b", 2, 3, true), handle("c", 3, 2, true)];
        let wrr = WeightedRoundRobin::with_offset(&handles, 3);
        assert_eq!(wrr.sequence(), &[2, 1, 0, 0, 1, 2, 0, 0, 1, 0]);

        // offsets past the length wrap around
        let wrapped = WeightedRoundRobin::with_offset(&handles, 13);
        assert_eq!(wrapped.sequence(), wrr.sequence());
    }

    #[test]
    fn test_random_offset_keeps_counts() {
        let handles = vec![handle("a", 1, 5, true), handle("b", 2, 3, true), handle("c", 3, 2, true)];
        let wrr = WeightedRoundRobin::new(&handles);
        let mut sorted = wrr.sequence().to_vec();
        sorted.sort();
        assert_eq!(sorted, vec![0, 0, 0, 0, 0, 1, 1, 1, 2, 2]);
    }

    #[test]
    fn test_skips_unhealthy_and_zero_weight() {
        let handles = vec![
            handle("a", 1, 3, false),
            handle("b", 2, 0, true),
            handle("c", 3, 1, true),
        ];
        let wrr = WeightedRoundRobin::with_offset(&handles, 0);
        for _ in 0..8 {
            assert_eq!(wrr.next_server().unwrap().alias(), "c");
        }
    }

    #[test]
    fn test_none_when_nothing_selectable() {
        let unhealthy = vec![handle("a", 1, 3, false), handle("b", 2, 2, false)];
        assert!(WeightedRoundRobin::new(&unhealthy).next_server().is_none());

        let zero = vec![handle("a", 1, 0, true)];
        assert!(WeightedRoundRobin::new(&zero).next_server().is_none());

        assert!(WeightedRoundRobin::new(&[]).next_server().is_none());
    }
}
