//! Conversion from registry state into selector candidates.

use fleetgrid_state::{DeviceRecord, ResourceSpec};

use crate::selector::CandidateDevice;

/// Build selector candidates from a registry snapshot.
///
/// Only devices holding the compute role are candidates. `free_of` looks up
/// the device's free resources in the ledger; devices without a ledger
/// entry are treated as fully committed rather than dropped, so the
/// satisfiability check still sees their totals.
pub fn build_candidates(
    records: &[DeviceRecord],
    free_of: impl Fn(&str) -> Option<ResourceSpec>,
) -> Vec<CandidateDevice> {
    records
        .iter()
        .filter(|r| r.roles.is_compute)
        .map(|r| CandidateDevice {
            device_id: r.id.clone(),
            online: r.is_online(),
            labels: r.labels.clone(),
            total: r.resources,
            free: free_of(&r.id).unwrap_or(ResourceSpec::ZERO),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_state::{DeviceRoles, Liveness};
    use std::collections::HashMap;

    fn record(id: &str, is_compute: bool) -> DeviceRecord {
        DeviceRecord {
            id: id.to_string(),
            name: id.to_string(),
            roles: DeviceRoles {
                is_compute,
                ..DeviceRoles::default()
            },
            resources: ResourceSpec::new(4, 1024, 0),
            labels: HashMap::new(),
            liveness: Liveness::Online,
            last_heartbeat: 0,
        }
    }

    #[test]
    fn only_compute_devices_become_candidates() {
        let records = vec![record("camera", false), record("box", true)];
        let candidates = build_candidates(&records, |_| Some(ResourceSpec::new(4, 1024, 0)));

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].device_id, "box");
    }

    #[test]
    fn missing_ledger_entry_means_no_free_resources() {
        let records = vec![record("box", true)];
        let candidates = build_candidates(&records, |_| None);

        assert_eq!(candidates[0].free, ResourceSpec::ZERO);
        assert_eq!(candidates[0].total, ResourceSpec::new(4, 1024, 0));
    }

    #[test]
    fn offline_devices_kept_with_liveness_flag() {
        let mut r = record("box", true);
        r.liveness = Liveness::Offline;
        let candidates = build_candidates(&[r], |_| Some(ResourceSpec::ZERO));

        assert_eq!(candidates.len(), 1);
        assert!(!candidates[0].online);
    }
}
