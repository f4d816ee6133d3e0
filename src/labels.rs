//! In-tick label membership and replayable host cursors.
//!
//! Persisted label membership lives in the datastore and is never mutated
//! by scheduling. Each tick works against a `LabelPool` copy: hosts claimed
//! or found unusable during the pass are removed from the copy only, so no
//! host can be handed to two entries in the same tick.

use std::collections::{HashMap, HashSet};

use crate::store::{Datastore, HostId, LabelId};

/// Working copy of label membership for one scheduling pass.
#[derive(Debug, Clone)]
pub struct LabelPool {
    membership: HashMap<LabelId, HashSet<HostId>>,
}

impl LabelPool {
    /// Snapshots the persisted membership of every label.
    pub fn snapshot(store: &Datastore) -> Self {
        let membership = store
            .labels()
            .map(|label| (label.id, label.hosts.clone()))
            .collect();
        Self { membership }
    }

    /// Current working membership of a label. Unknown labels are empty.
    pub fn hosts_in_label(&self, label: LabelId) -> HashSet<HostId> {
        self.membership.get(&label).cloned().unwrap_or_default()
    }

    /// Removes a host from a label for the remainder of this pass. The
    /// persisted membership is untouched.
    pub fn remove_host_from_label(&mut self, host: HostId, label: LabelId) {
        if let Some(hosts) = self.membership.get_mut(&label) {
            hosts.remove(&host);
        }
    }
}

/// A lazily-materializing, replayable cursor over a one-shot iterator.
///
/// Items pulled through the live cursor (`next`) are buffered, so the full
/// original sequence can later be forced with `get_all_items` without
/// re-querying the source. Once forced, repeated calls return the cached
/// buffer; the source is never pulled again.
pub struct RememberingIterator<I: Iterator> {
    source: I,
    seen: Vec<I::Item>,
    cursor: usize,
}

impl<I: Iterator> RememberingIterator<I>
where
    I::Item: Clone,
{
    pub fn new(source: I) -> Self {
        Self {
            source,
            seen: Vec::new(),
            cursor: 0,
        }
    }

    /// Forces full materialization and returns the entire original sequence,
    /// including items already consumed through the live cursor.
    pub fn get_all_items(&mut self) -> &[I::Item] {
        for item in self.source.by_ref() {
            self.seen.push(item);
        }
        &self.seen
    }
}

impl<I: Iterator> Iterator for RememberingIterator<I>
where
    I::Item: Clone,
{
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor < self.seen.len() {
            let item = self.seen[self.cursor].clone();
            self.cursor += 1;
            return Some(item);
        }
        match self.source.next() {
            Some(item) => {
                self.seen.push(item.clone());
                self.cursor += 1;
                Some(item)
            }
            None => None,
        }
    }
}
