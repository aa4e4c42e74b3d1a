//! Load Balancer Service
//!
//! Pure selection logic over a snapshot of healthy instances.
//! The registry owns the shared state (cursor, connection counters, RNG);
//! this module only decides which instance a given input maps to.

use crate::domain::entities::Instance;
use std::fmt;
use std::str::FromStr;

/// Instance selection algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    /// Cycle through healthy instances in registration order
    #[default]
    RoundRobin,
    /// Pick proportionally to instance weight
    Weighted,
    /// Pick the instance with the fewest active connections
    LeastConnections,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "round_robin",
            Algorithm::Weighted => "weighted",
            Algorithm::LeastConnections => "least_connections",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "round_robin" | "rr" => Ok(Algorithm::RoundRobin),
            "weighted" => Ok(Algorithm::Weighted),
            "least_connections" | "least_conn" => Ok(Algorithm::LeastConnections),
            other => Err(format!("unknown selection algorithm: {}", other)),
        }
    }
}

/// Load balancer service.
pub struct LoadBalancer;

impl LoadBalancer {
    /// Round-robin: map a cursor ticket onto the healthy set.
    ///
    /// Consecutive tickets visit every instance once per `len` tickets,
    /// in slice order.
    pub fn pick_round_robin(healthy: &[Instance], ticket: usize) -> Option<&Instance> {
        if healthy.is_empty() {
            return None;
        }
        healthy.get(ticket % healthy.len())
    }

    /// Weighted: return the instance whose cumulative weight range
    /// contains `draw`, where `draw` is uniform over `[0, total_weight)`.
    pub fn pick_weighted(healthy: &[Instance], draw: f64) -> Option<&Instance> {
        let mut cumulative = 0.0;
        for instance in healthy {
            cumulative += instance.weight.max(1) as f64;
            if draw < cumulative {
                return Some(instance);
            }
        }
        // draw at or past the total (float rounding) lands on the last one
        healthy.last()
    }

    /// Sum of weights of the given instances.
    pub fn total_weight(healthy: &[Instance]) -> u64 {
        healthy.iter().map(|i| i.weight.max(1) as u64).sum()
    }

    /// Least connections: minimum active count, ties broken by slice order.
    pub fn pick_least_connections<F>(healthy: &[Instance], get_conn_count: F) -> Option<&Instance>
    where
        F: Fn(&str) -> usize,
    {
        let mut best: Option<(&Instance, usize)> = None;

        for instance in healthy {
            let count = get_conn_count(&instance.id);
            match best {
                Some((_, best_count)) if count >= best_count => {}
                _ => best = Some((instance, count)),
            }
        }

        best.map(|(instance, _)| instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instances(weights: &[u32]) -> Vec<Instance> {
        weights
            .iter()
            .enumerate()
            .map(|(i, w)| Instance::new(format!("i{}", i), "10.0.0.1", 8000 + i as u16, *w))
            .collect()
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!("round_robin".parse::<Algorithm>(), Ok(Algorithm::RoundRobin));
        assert_eq!("Round-Robin".parse::<Algorithm>(), Ok(Algorithm::RoundRobin));
        assert_eq!("weighted".parse::<Algorithm>(), Ok(Algorithm::Weighted));
        assert_eq!(
            "least_connections".parse::<Algorithm>(),
            Ok(Algorithm::LeastConnections)
        );
        assert!("random".parse::<Algorithm>().is_err());
    }

    #[test]
    fn test_algorithm_display_roundtrip() {
        for algo in [
            Algorithm::RoundRobin,
            Algorithm::Weighted,
            Algorithm::LeastConnections,
        ] {
            assert_eq!(algo.to_string().parse::<Algorithm>(), Ok(algo));
        }
    }

    #[test]
    fn test_round_robin_empty() {
        assert!(LoadBalancer::pick_round_robin(&[], 0).is_none());
    }

    #[test]
    fn test_round_robin_cycles_in_order() {
        let set = instances(&[1, 1, 1]);
        let picked: Vec<_> = (0..6)
            .map(|t| LoadBalancer::pick_round_robin(&set, t).unwrap().id.clone())
            .collect();
        assert_eq!(picked, ["i0", "i1", "i2", "i0", "i1", "i2"]);
    }

    #[test]
    fn test_weighted_ranges() {
        let set = instances(&[1, 3]);
        assert_eq!(LoadBalancer::total_weight(&set), 4);
        assert_eq!(LoadBalancer::pick_weighted(&set, 0.0).unwrap().id, "i0");
        assert_eq!(LoadBalancer::pick_weighted(&set, 0.99).unwrap().id, "i0");
        assert_eq!(LoadBalancer::pick_weighted(&set, 1.0).unwrap().id, "i1");
        assert_eq!(LoadBalancer::pick_weighted(&set, 3.99).unwrap().id, "i1");
        assert_eq!(LoadBalancer::pick_weighted(&set, 4.0).unwrap().id, "i1");
    }

    #[test]
    fn test_weighted_empty() {
        assert!(LoadBalancer::pick_weighted(&[], 0.5).is_none());
    }

    #[test]
    fn test_least_connections_minimum() {
        let set = instances(&[1, 1, 1]);
        let picked = LoadBalancer::pick_least_connections(&set, |id| match id {
            "i0" => 5,
            "i1" => 2,
            _ => 3,
        });
        assert_eq!(picked.unwrap().id, "i1");
    }

    #[test]
    fn test_least_connections_tie_uses_order() {
        let set = instances(&[1, 1, 1]);
        let picked = LoadBalancer::pick_least_connections(&set, |id| match id {
            "i0" => 4,
            _ => 1,
        });
        assert_eq!(picked.unwrap().id, "i1");
    }
}
