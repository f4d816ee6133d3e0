//! Host eligibility checks.
//!
//! Usability is fleet-wide (a locked or unhealthy host serves nobody);
//! eligibility is per entry (a host missing one entry's dependency labels
//! may still serve another).

use std::collections::HashSet;

use crate::host::Host;
use crate::store::{Datastore, EntryStatus, HostId, HostQueueEntry};

/// Whether a host may receive new work at all.
pub fn is_host_usable(host: &Host) -> bool {
    !host.locked && !host.invalid && host.status.is_usable()
}

/// Hosts that must not be considered for `entry` regardless of usability:
/// hosts bound to another entry that is active, or that was handed a host
/// this tick but has not started yet.
pub fn ineligible_hosts_for_entry(store: &Datastore, entry: &HostQueueEntry) -> HashSet<HostId> {
    store
        .entries_where(|e| {
            e.id != entry.id
                && e.host.is_some()
                && (e.status.is_active()
                    || (e.status == EntryStatus::Queued && e.meta_host.is_some()))
        })
        .into_iter()
        .filter_map(|e| e.host)
        .collect()
}

/// Entry-specific check: every dependency label must be carried by the host.
pub fn is_eligible_for_entry(host: &Host, entry: &HostQueueEntry) -> bool {
    entry.deps.iter().all(|dep| host.labels.contains(dep))
}
