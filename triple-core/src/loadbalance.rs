use std::str::FromStr;
use std::sync::{LazyLock, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::directory::Snapshot;
use crate::endpoint::Endpoint;
use crate::error::TripleError;

/// Per-process PRNG shared by every selector, seeded once from the clock.
static PROCESS_RNG: LazyLock<Mutex<SmallRng>> = LazyLock::new(|| {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x5eed_5eed);
    Mutex::new(SmallRng::seed_from_u64(seed))
});

/// Endpoint selection policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadBalance {
    /// Uniform pick over the address list.
    #[default]
    Random,
    /// Weighted pick with `weight = max(1, 100 - cpu)`.
    CpuWeighted,
}

impl LoadBalance {
    /// Pick an endpoint out of a snapshot. Returns `None` only for an
    /// empty snapshot; the caller owns the empty-list policy.
    pub fn pick<'s>(&self, snapshot: &'s Snapshot) -> Option<&'s Endpoint> {
        let endpoints = &snapshot.endpoints;
        if endpoints.is_empty() {
            return None;
        }
        let mut rng = PROCESS_RNG.lock().expect("selector RNG poisoned");
        match self {
            LoadBalance::Random => {
                let idx = rng.gen_range(0..endpoints.len());
                Some(&endpoints[idx])
            }
            LoadBalance::CpuWeighted => {
                let total = snapshot.total_cpu_weight.max(1);
                let mut ticket = rng.gen_range(0..total);
                for endpoint in endpoints {
                    let weight = u64::from(endpoint.cpu_weight());
                    if ticket < weight {
                        return Some(endpoint);
                    }
                    ticket -= weight;
                }
                // Rounding drift lands on the last endpoint.
                endpoints.last()
            }
        }
    }
}

impl FromStr for LoadBalance {
    type Err = TripleError;

    fn from_str(raw: &str) -> Result<LoadBalance, TripleError> {
        match raw {
            "random" => Ok(LoadBalance::Random),
            "cpu" => Ok(LoadBalance::CpuWeighted),
            other => Err(TripleError::InvalidArgument(format!(
                "unknown loadbalance policy {other:?} (expected \"random\" or \"cpu\")"
            ))),
        }
    }
}

impl std::fmt::Display for LoadBalance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadBalance::Random => f.write_str("random"),
            LoadBalance::CpuWeighted => f.write_str("cpu"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointMetadata;

    fn snapshot_of(endpoints: Vec<Endpoint>) -> Snapshot {
        Snapshot::build(endpoints, 1)
    }

    fn with_cpu(host: &str, cpu: u32) -> Endpoint {
        Endpoint::new(host, 1000).with_metadata(EndpointMetadata {
            cpu: Some(cpu),
            ..EndpointMetadata::default()
        })
    }

    #[test]
    fn empty_snapshot_yields_none() {
        let snapshot = snapshot_of(Vec::new());
        assert!(LoadBalance::Random.pick(&snapshot).is_none());
        assert!(LoadBalance::CpuWeighted.pick(&snapshot).is_none());
    }

    #[test]
    fn random_only_returns_listed_endpoints() {
        let snapshot = snapshot_of(vec![with_cpu("a", 0), with_cpu("b", 0)]);
        for _ in 0..64 {
            let picked = LoadBalance::Random.pick(&snapshot).unwrap();
            assert!(picked.host == "a" || picked.host == "b");
        }
    }

    #[test]
    fn cpu_weighted_prefers_idle_endpoints() {
        // Weights 100 vs 1: the busy endpoint should be picked rarely.
        let snapshot = snapshot_of(vec![with_cpu("idle", 0), with_cpu("busy", 100)]);
        let mut idle = 0;
        for _ in 0..500 {
            if LoadBalance::CpuWeighted.pick(&snapshot).unwrap().host == "idle" {
                idle += 1;
            }
        }
        assert!(idle > 400, "idle endpoint picked only {idle}/500 times");
    }

    #[test]
    fn parses_policy_names() {
        assert_eq!("random".parse::<LoadBalance>().unwrap(), LoadBalance::Random);
        assert_eq!("cpu".parse::<LoadBalance>().unwrap(), LoadBalance::CpuWeighted);
        assert!("roundrobin".parse::<LoadBalance>().is_err());
    }
}
