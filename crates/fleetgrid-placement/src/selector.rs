//! Candidate filtering and headroom ranking.

use std::collections::HashMap;

use tracing::debug;

use fleetgrid_state::{Affinity, DeviceId, ResourceSpec};

/// A compute device as seen by the selector: a point-in-time copy of its
/// labels, liveness, and ledger state.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CandidateDevice {
    pub device_id: DeviceId,
    pub online: bool,
    pub labels: HashMap<String, String>,
    /// Total resources the device reports.
    pub total: ResourceSpec,
    /// Free resources at snapshot time (total minus committed).
    pub free: ResourceSpec,
}

/// A qualifying device with its headroom score.
#[derive(Debug, Clone)]
pub struct DeviceScore {
    pub device_id: DeviceId,
    /// Minimum normalized free/total ratio after the reservation.
    /// Range 0.0..=1.0; higher is better.
    pub headroom: f64,
}

/// Whether a device can take the request right now.
///
/// An exact selector pin short-circuits label matching; otherwise every
/// required label pair must hold. Either way the device must be online and
/// have the request covered by its free resources in every dimension.
pub fn qualifies(candidate: &CandidateDevice, request: &ResourceSpec, affinity: &Affinity) -> bool {
    if !candidate.online {
        return false;
    }

    match &affinity.node_selector {
        Some(pinned) => {
            if candidate.device_id != *pinned {
                return false;
            }
        }
        None => {
            let labels_ok = affinity
                .node_affinity
                .iter()
                .all(|(k, v)| candidate.labels.get(k).is_some_and(|cv| cv == v));
            if !labels_ok {
                return false;
            }
        }
    }

    request.fits_within(&candidate.free)
}

/// Normalized headroom the device would be left with after reserving
/// `request`: the minimum across dimensions of `(free − request) / total`.
///
/// A dimension with zero total is neutral (1.0) — a device without GPUs is
/// not penalized for GPU-free workloads. Callers must have checked
/// `qualifies` first, so `free ≥ request` holds.
pub fn headroom(candidate: &CandidateDevice, request: &ResourceSpec) -> f64 {
    let left = candidate.free.saturating_sub(request);
    let ratio = |left: u64, total: u64| -> f64 {
        if total == 0 {
            1.0
        } else {
            left as f64 / total as f64
        }
    };

    let cpu = ratio(u64::from(left.cpu_cores), u64::from(candidate.total.cpu_cores));
    let mem = ratio(left.memory_bytes, candidate.total.memory_bytes);
    let gpu = ratio(u64::from(left.gpu_count), u64::from(candidate.total.gpu_count));

    cpu.min(mem).min(gpu)
}

/// Rank qualifying devices: greatest headroom first, ties broken by lowest
/// device id so repeated runs with identical inputs pick identically.
pub fn rank(
    request: &ResourceSpec,
    affinity: &Affinity,
    candidates: &[CandidateDevice],
) -> Vec<DeviceScore> {
    let mut scores: Vec<DeviceScore> = candidates
        .iter()
        .filter(|c| qualifies(c, request, affinity))
        .map(|c| DeviceScore {
            device_id: c.device_id.clone(),
            headroom: headroom(c, request),
        })
        .collect();

    scores.sort_by(|a, b| {
        b.headroom
            .partial_cmp(&a.headroom)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.device_id.cmp(&b.device_id))
    });

    debug!(candidates = candidates.len(), qualifying = scores.len(), "ranked devices");
    scores
}

/// Pick the best device for the request, or `None` if nobody qualifies.
pub fn select(
    request: &ResourceSpec,
    affinity: &Affinity,
    candidates: &[CandidateDevice],
) -> Option<DeviceId> {
    rank(request, affinity, candidates)
        .into_iter()
        .next()
        .map(|s| s.device_id)
}

/// Whether any known device's *total* capacity could ever satisfy the
/// request under the affinity constraint, regardless of current liveness
/// or commitments.
///
/// When this is false the workload is a hard failure, not a queue entry.
pub fn satisfiable(
    request: &ResourceSpec,
    affinity: &Affinity,
    candidates: &[CandidateDevice],
) -> bool {
    candidates.iter().any(|c| {
        let constrained_ok = match &affinity.node_selector {
            Some(pinned) => c.device_id == *pinned,
            None => affinity
                .node_affinity
                .iter()
                .all(|(k, v)| c.labels.get(k).is_some_and(|cv| cv == v)),
        };
        constrained_ok && request.fits_within(&c.total)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gib(n: u64) -> u64 {
        n * 1024 * 1024 * 1024
    }

    fn candidate(id: &str, total: ResourceSpec, free: ResourceSpec) -> CandidateDevice {
        CandidateDevice {
            device_id: id.to_string(),
            online: true,
            labels: HashMap::new(),
            total,
            free,
        }
    }

    #[test]
    fn offline_device_never_qualifies() {
        let mut c = candidate(
            "dev-a",
            ResourceSpec::new(4, gib(8), 0),
            ResourceSpec::new(4, gib(8), 0),
        );
        c.online = false;

        assert!(!qualifies(&c, &ResourceSpec::new(1, 1, 0), &Affinity::any()));
    }

    #[test]
    fn insufficient_free_disqualifies() {
        let c = candidate(
            "dev-a",
            ResourceSpec::new(4, gib(8), 0),
            ResourceSpec::new(1, gib(1), 0),
        );

        assert!(!qualifies(&c, &ResourceSpec::new(2, gib(1), 0), &Affinity::any()));
        assert!(qualifies(&c, &ResourceSpec::new(1, gib(1), 0), &Affinity::any()));
    }

    #[test]
    fn required_labels_must_all_match() {
        let mut c = candidate(
            "dev-a",
            ResourceSpec::new(4, gib(8), 0),
            ResourceSpec::new(4, gib(8), 0),
        );
        c.labels.insert("zone".to_string(), "barn".to_string());

        let mut affinity = Affinity::any();
        affinity
            .node_affinity
            .insert("zone".to_string(), "barn".to_string());
        assert!(qualifies(&c, &ResourceSpec::new(1, 1, 0), &affinity));

        affinity
            .node_affinity
            .insert("tier".to_string(), "gpu".to_string());
        assert!(!qualifies(&c, &ResourceSpec::new(1, 1, 0), &affinity));
    }

    #[test]
    fn selector_pin_overrides_labels() {
        // The pinned device lacks the label, but the pin short-circuits.
        let c = candidate(
            "dev-a",
            ResourceSpec::new(4, gib(8), 0),
            ResourceSpec::new(4, gib(8), 0),
        );
        let mut affinity = Affinity::pinned("dev-a");
        affinity
            .node_affinity
            .insert("zone".to_string(), "barn".to_string());

        assert!(qualifies(&c, &ResourceSpec::new(1, 1, 0), &affinity));

        let other = candidate(
            "dev-b",
            ResourceSpec::new(8, gib(16), 0),
            ResourceSpec::new(8, gib(16), 0),
        );
        assert!(!qualifies(&other, &ResourceSpec::new(1, 1, 0), &affinity));
    }

    #[test]
    fn headroom_is_min_dimension() {
        // Free 2 CPU / 6 GiB on an 8 CPU / 8 GiB device; request 1 CPU / 2 GiB.
        // CPU left: 1/8 = 0.125, memory left: 4/8 = 0.5. Min is CPU.
        let c = candidate(
            "dev-a",
            ResourceSpec::new(8, gib(8), 0),
            ResourceSpec::new(2, gib(6), 0),
        );
        let h = headroom(&c, &ResourceSpec::new(1, gib(2), 0));
        assert!((h - 0.125).abs() < 1e-9);
    }

    #[test]
    fn zero_gpu_total_is_neutral() {
        let c = candidate(
            "dev-a",
            ResourceSpec::new(4, gib(4), 0),
            ResourceSpec::new(4, gib(4), 0),
        );
        let h = headroom(&c, &ResourceSpec::new(0, 0, 0));
        assert!((h - 1.0).abs() < 1e-9);
    }

    #[test]
    fn select_prefers_greater_min_headroom() {
        // A: free 2 CPU / 4 GiB of total 4 / 8 GiB → min((2-1)/4, (4-1)/8) = 0.25
        // B: free 4 CPU / 2 GiB of total 8 / 8 GiB → min((4-1)/8, (2-1)/8) = 0.125
        let a = candidate(
            "dev-a",
            ResourceSpec::new(4, gib(8), 0),
            ResourceSpec::new(2, gib(4), 0),
        );
        let b = candidate(
            "dev-b",
            ResourceSpec::new(8, gib(8), 0),
            ResourceSpec::new(4, gib(2), 0),
        );
        let request = ResourceSpec::new(1, gib(1), 0);

        let picked = select(&request, &Affinity::any(), &[a, b]);
        assert_eq!(picked.as_deref(), Some("dev-a"));
    }

    #[test]
    fn select_is_deterministic_on_ties() {
        // Identical devices: the lowest id must win, on every run.
        let total = ResourceSpec::new(4, gib(8), 0);
        let candidates = vec![
            candidate("dev-c", total, total),
            candidate("dev-a", total, total),
            candidate("dev-b", total, total),
        ];
        let request = ResourceSpec::new(1, gib(1), 0);

        for _ in 0..10 {
            let picked = select(&request, &Affinity::any(), &candidates);
            assert_eq!(picked.as_deref(), Some("dev-a"));
        }
    }

    #[test]
    fn select_none_when_nobody_qualifies() {
        let c = candidate(
            "dev-a",
            ResourceSpec::new(1, gib(1), 0),
            ResourceSpec::new(0, 0, 0),
        );
        assert_eq!(select(&ResourceSpec::new(1, 1, 0), &Affinity::any(), &[c]), None);
    }

    #[test]
    fn rank_orders_best_first() {
        let a = candidate(
            "dev-a",
            ResourceSpec::new(4, gib(8), 0),
            ResourceSpec::new(4, gib(8), 0),
        );
        let b = candidate(
            "dev-b",
            ResourceSpec::new(4, gib(8), 0),
            ResourceSpec::new(2, gib(2), 0),
        );
        let ranked = rank(&ResourceSpec::new(1, gib(1), 0), &Affinity::any(), &[b, a]);

        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].device_id, "dev-a");
        assert!(ranked[0].headroom >= ranked[1].headroom);
    }

    #[test]
    fn satisfiable_checks_total_not_free() {
        // Fully committed device: request is unqualified now but satisfiable.
        let c = candidate(
            "dev-a",
            ResourceSpec::new(4, gib(8), 0),
            ResourceSpec::ZERO,
        );
        let request = ResourceSpec::new(2, gib(2), 0);

        assert_eq!(select(&request, &Affinity::any(), std::slice::from_ref(&c)), None);
        assert!(satisfiable(&request, &Affinity::any(), &[c]));
    }

    #[test]
    fn oversized_request_is_unsatisfiable() {
        let c = candidate(
            "dev-a",
            ResourceSpec::new(4, gib(8), 0),
            ResourceSpec::new(4, gib(8), 0),
        );
        // More GPUs than any device has ever reported.
        let request = ResourceSpec::new(1, gib(1), 2);
        assert!(!satisfiable(&request, &Affinity::any(), &[c]));
    }

    #[test]
    fn pinned_selector_to_small_device_is_unsatisfiable() {
        let small = candidate(
            "dev-small",
            ResourceSpec::new(1, gib(1), 0),
            ResourceSpec::new(1, gib(1), 0),
        );
        let big = candidate(
            "dev-big",
            ResourceSpec::new(16, gib(64), 4),
            ResourceSpec::new(16, gib(64), 4),
        );
        let request = ResourceSpec::new(8, gib(8), 0);

        assert!(!satisfiable(&request, &Affinity::pinned("dev-small"), &[small.clone(), big.clone()]));
        assert!(satisfiable(&request, &Affinity::any(), &[small, big]));
    }

    #[test]
    fn satisfiable_respects_affinity_labels() {
        let mut labeled = candidate(
            "dev-a",
            ResourceSpec::new(8, gib(16), 0),
            ResourceSpec::ZERO,
        );
        labeled.labels.insert("zone".to_string(), "barn".to_string());
        let unlabeled = candidate(
            "dev-b",
            ResourceSpec::new(8, gib(16), 0),
            ResourceSpec::ZERO,
        );

        let mut affinity = Affinity::any();
        affinity
            .node_affinity
            .insert("zone".to_string(), "house".to_string());

        // Only the labeled device is big enough, but its zone is wrong.
        let request = ResourceSpec::new(8, gib(16), 0);
        assert!(!satisfiable(&request, &affinity, &[labeled, unlabeled.clone()]));
        assert!(satisfiable(&request, &Affinity::any(), &[unlabeled]));
    }
}
