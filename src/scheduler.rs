//! Metahost scheduling.
//!
//! Resolves a label-targeted ("meta-host") queue entry to one concrete
//! host. Candidates are visited in a uniformly random permutation so that
//! hosts sorting last are not systematically starved and wear spreads
//! evenly across the fleet. Each candidate is filtered through the
//! usability check, the entry-specific eligibility check, and a bounded
//! reachability probe; the first survivor is bound. Hosts rejected along
//! the way are removed from the label's in-tick working set so no other
//! entry re-evaluates them this pass.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::eligibility::{ineligible_hosts_for_entry, is_eligible_for_entry, is_host_usable};
use crate::error::CorralError;
use crate::labels::{LabelPool, RememberingIterator};
use crate::probe::{ProbeOutcome, Prober};
use crate::store::{Datastore, HostId, HostQueueEntry, SharedDatastore};

pub struct MetahostScheduler {
    rng: StdRng,
}

impl MetahostScheduler {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { rng }
    }

    pub fn can_schedule_metahost(&self, entry: &HostQueueEntry) -> bool {
        entry.meta_host.is_some()
    }

    /// Tries to bind one concrete host to a meta-host entry.
    ///
    /// Returns the bound host id, or `None` when no candidate survived (the
    /// entry stays Queued and re-enters with a fresh permutation next tick).
    /// Only datastore failures on the commit path propagate; probe failures
    /// and ineligibility are absorbed into "try the next candidate".
    pub async fn schedule_metahost_entry(
        &mut self,
        store: &SharedDatastore,
        pool: &mut LabelPool,
        prober: &dyn Prober,
        entry: &HostQueueEntry,
    ) -> Result<Option<HostId>, CorralError> {
        let label = match entry.meta_host {
            Some(label) => label,
            None => return Ok(None),
        };

        // Candidate pool, taken once per entry per tick. Sorting before the
        // shuffle makes runs reproducible under a fixed seed.
        let mut candidates: Vec<HostId> = {
            let store = store.lock().expect("Datastore lock poisoned.");
            let ineligible = ineligible_hosts_for_entry(&store, entry);
            pool.hosts_in_label(label)
                .difference(&ineligible)
                .copied()
                .collect()
        };
        candidates.sort_unstable();
        candidates.shuffle(&mut self.rng);

        let mut candidates = RememberingIterator::new(candidates.into_iter());
        while let Some(host_id) = candidates.next() {
            let host = {
                let store = store.lock().expect("Datastore lock poisoned.");
                store.host(host_id).cloned()
            };
            let host = match host {
                Some(host) => host,
                None => {
                    // Decommissioned between snapshot and now.
                    pool.remove_host_from_label(host_id, label);
                    continue;
                }
            };
            if !is_host_usable(&host) {
                // Unusable fleet-wide, not just for this entry.
                pool.remove_host_from_label(host_id, label);
                continue;
            }
            if !is_eligible_for_entry(&host, entry) {
                // May still be eligible for an entry with other dependencies.
                continue;
            }
            if prober.probe(&host).await == ProbeOutcome::Unreachable {
                // Keep other entries from paying for the same failed probe
                // this tick.
                pool.remove_host_from_label(host_id, label);
                continue;
            }
            // Claimed. The bind is the single commit point; if the entry was
            // aborted while we probed, the stale result is discarded.
            pool.remove_host_from_label(host_id, label);
            let bound = {
                let mut store = store.lock().expect("Datastore lock poisoned.");
                store.assign_host(entry.id, host_id)?
            };
            return Ok(if bound { Some(host_id) } else { None });
        }

        let considered = candidates.get_all_items().len();
        if considered > 0 {
            eprintln!(
                "[Corral] No eligible host among {} candidates for entry {}.",
                considered, entry.id
            );
        }
        Ok(None)
    }

    /// Explicit-host path: the pinned host must be usable, eligible, and not
    /// claimed by another entry. No probe-driven pool removal happens here.
    pub fn schedule_explicit_entry(
        &mut self,
        store: &SharedDatastore,
        entry: &HostQueueEntry,
    ) -> Result<Option<HostId>, CorralError> {
        let host_id = match entry.host {
            Some(host_id) => host_id,
            None => return Ok(None),
        };
        let mut store = store.lock().expect("Datastore lock poisoned.");
        let host = match store.host(host_id) {
            Some(host) => host.clone(),
            None => {
                return Err(CorralError::DatastoreError(format!(
                    "entry {} is pinned to unknown host {}",
                    entry.id, host_id
                )))
            }
        };
        if !is_host_usable(&host)
            || !is_eligible_for_entry(&host, entry)
            || ineligible_hosts_for_entry(&store, entry).contains(&host_id)
        {
            return Ok(None);
        }
        let bound = store.assign_host(entry.id, host_id)?;
        Ok(if bound { Some(host_id) } else { None })
    }
}
