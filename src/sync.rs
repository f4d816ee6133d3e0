//! Advisory host locking for multi-step external operations.
//!
//! A suite run that spans many ticks can hold a set of hosts exclusively so
//! the scheduler leaves them alone. Acquisition and release are explicit;
//! release-on-drop is a safety net for callers that forgot, not the primary
//! discipline.

use crate::error::CorralError;
use crate::store::{HostId, SharedDatastore};

pub struct HostLockManager {
    store: SharedDatastore,
    holder: String,
    locked: Vec<HostId>,
}

impl HostLockManager {
    pub fn new(store: SharedDatastore, holder: &str) -> Self {
        Self {
            store,
            holder: holder.to_owned(),
            locked: Vec::new(),
        }
    }

    /// Locks the named hosts. Fails without locking anything if any host is
    /// unknown or already locked by someone else.
    pub fn lock(&mut self, hostnames: &[&str]) -> Result<(), CorralError> {
        let mut store = self.store.lock().expect("Datastore lock poisoned.");
        let mut ids = Vec::with_capacity(hostnames.len());
        for hostname in hostnames {
            let host = store.host_by_name(hostname).ok_or_else(|| {
                CorralError::DatastoreError(format!("no host named '{}'", hostname))
            })?;
            if host.locked {
                return Err(CorralError::DatastoreError(format!(
                    "host {} already locked by {}",
                    host.hostname,
                    host.lock_holder.as_deref().unwrap_or("unknown")
                )));
            }
            ids.push(host.id);
        }
        for &id in &ids {
            store.lock_host(id, &self.holder)?;
        }
        self.locked.extend(ids);
        Ok(())
    }

    pub fn unlock(&mut self) {
        let mut store = self.store.lock().expect("Datastore lock poisoned.");
        for id in self.locked.drain(..) {
            store.unlock_host(id);
        }
    }

    pub fn locked_hosts(&self) -> &[HostId] {
        &self.locked
    }
}

impl Drop for HostLockManager {
    fn drop(&mut self) {
        if self.locked.is_empty() {
            return;
        }
        if let Ok(mut store) = self.store.lock() {
            for id in self.locked.drain(..) {
                store.unlock_host(id);
            }
        }
    }
}
