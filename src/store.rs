//! In-process datastore for fleet state.
//!
//! Every read and write the scheduler performs against persisted state goes
//! through `Datastore`. The operation surface mirrors the frontend's RPC
//! boundary (filtered host lookup, bulk update by filter, queue-entry abort,
//! special-task creation) and guarantees read-your-writes within a tick.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::error::CorralError;
use crate::host::{Host, HostDef, HostStatus};

pub type HostId = u64;
pub type LabelId = u64;
pub type EntryId = u64;
pub type TaskId = u64;
pub type UserId = u64;

/// A named tag grouping hosts by capability/board/pool. Also used to express
/// per-job required capabilities (dependencies).
#[derive(Debug, Clone)]
pub struct Label {
    pub id: LabelId,
    pub name: String,
    pub hosts: HashSet<HostId>,
}

/// Lifecycle status of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Queued,
    Verifying,
    Pending,
    Starting,
    Running,
    Gathering,
    Parsing,
    Archiving,
    Completed,
    Failed,
    Aborted,
    Stopped,
}

impl EntryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EntryStatus::Completed | EntryStatus::Failed | EntryStatus::Aborted | EntryStatus::Stopped
        )
    }

    /// Whether an agent is (or should be) working on this entry.
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != EntryStatus::Queued
    }
}

/// One job's pending/active binding to a host. Either pinned to a specific
/// host at submission, or tagged with a meta-host label to be resolved by
/// the metahost scheduler.
#[derive(Debug, Clone)]
pub struct HostQueueEntry {
    pub id: EntryId,
    pub job_name: String,
    pub owner: String,
    /// Command template dispatched to the assigned host.
    pub command: String,
    pub priority: i32,
    pub meta_host: Option<LabelId>,
    pub host: Option<HostId>,
    /// Labels the assigned host must carry.
    pub deps: HashSet<LabelId>,
    pub status: EntryStatus,
    pub aborted: bool,
    /// Terminal status an entry parked in Archiving will move to.
    pub final_status: Option<EntryStatus>,
}

/// Kind of an out-of-band maintenance task. Declaration order is scheduling
/// priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskKind {
    Repair,
    Cleanup,
    Verify,
    Reset,
    Provision,
}

impl TaskKind {
    /// Hook executable run on the host for this task kind.
    pub fn command(self) -> &'static str {
        match self {
            TaskKind::Repair => "corral-repair",
            TaskKind::Cleanup => "corral-cleanup",
            TaskKind::Verify => "corral-verify",
            TaskKind::Reset => "corral-reset",
            TaskKind::Provision => "corral-provision",
        }
    }

    /// Host status while this task is in flight.
    pub fn running_status(self) -> HostStatus {
        match self {
            TaskKind::Repair => HostStatus::Repairing,
            TaskKind::Cleanup | TaskKind::Reset => HostStatus::Cleaning,
            TaskKind::Verify => HostStatus::Verifying,
            TaskKind::Provision => HostStatus::Provisioning,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            TaskKind::Repair => "Repair",
            TaskKind::Cleanup => "Cleanup",
            TaskKind::Verify => "Verify",
            TaskKind::Reset => "Reset",
            TaskKind::Provision => "Provision",
        };
        write!(f, "{}", name)
    }
}

/// A maintenance action bound to a host, injected ahead of user jobs.
#[derive(Debug, Clone)]
pub struct SpecialTask {
    pub id: TaskId,
    pub host: HostId,
    pub task: TaskKind,
    pub requested_by: UserId,
    pub queue_entry: Option<EntryId>,
    pub is_active: bool,
    pub is_complete: bool,
    pub is_aborted: bool,
}

#[derive(Debug, Default)]
pub struct Datastore {
    hosts: HashMap<HostId, Host>,
    labels: HashMap<LabelId, Label>,
    label_names: HashMap<String, LabelId>,
    entries: HashMap<EntryId, HostQueueEntry>,
    tasks: HashMap<TaskId, SpecialTask>,
    users: HashMap<String, UserId>,
    next_host_id: HostId,
    next_label_id: LabelId,
    next_entry_id: EntryId,
    next_task_id: TaskId,
    next_user_id: UserId,
}

/// Handle shared between the dispatcher and external multi-step operations
/// such as the host lock manager. Guard scope is kept to single operations;
/// nothing holds it across an await point.
pub type SharedDatastore = Arc<Mutex<Datastore>>;

pub fn shared(store: Datastore) -> SharedDatastore {
    Arc::new(Mutex::new(store))
}

impl Datastore {
    pub fn new() -> Self {
        Self::default()
    }

    // ===== Users =====

    pub fn add_user(&mut self, name: &str) -> UserId {
        if let Some(&id) = self.users.get(name) {
            return id;
        }
        self.next_user_id += 1;
        self.users.insert(name.to_string(), self.next_user_id);
        self.next_user_id
    }

    pub fn user_id(&self, name: &str) -> Option<UserId> {
        self.users.get(name).copied()
    }

    // ===== Labels =====

    pub fn ensure_label(&mut self, name: &str) -> LabelId {
        if let Some(&id) = self.label_names.get(name) {
            return id;
        }
        self.next_label_id += 1;
        let id = self.next_label_id;
        self.labels.insert(
            id,
            Label {
                id,
                name: name.to_string(),
                hosts: HashSet::new(),
            },
        );
        self.label_names.insert(name.to_string(), id);
        id
    }

    pub fn label_id(&self, name: &str) -> Option<LabelId> {
        self.label_names.get(name).copied()
    }

    pub fn label(&self, id: LabelId) -> Option<&Label> {
        self.labels.get(&id)
    }

    pub fn labels(&self) -> impl Iterator<Item = &Label> {
        self.labels.values()
    }

    // ===== Hosts =====

    /// Enrolls a host from the hosts file, creating its labels as needed.
    pub fn enroll_host(&mut self, def: &HostDef) -> HostId {
        self.next_host_id += 1;
        let id = self.next_host_id;
        let mut host = Host::new(id, def.hostname.clone());
        host.locked = def.locked;
        if def.locked {
            host.lock_holder = Some("hosts-file".to_string());
        }
        for label_name in &def.labels {
            let label_id = self.ensure_label(label_name);
            host.labels.insert(label_id);
            self.labels
                .get_mut(&label_id)
                .expect("label created above")
                .hosts
                .insert(id);
        }
        self.hosts.insert(id, host);
        id
    }

    pub fn host(&self, id: HostId) -> Option<&Host> {
        self.hosts.get(&id)
    }

    pub fn host_by_name(&self, hostname: &str) -> Option<&Host> {
        self.hosts.values().find(|h| h.hostname == hostname)
    }

    /// Filtered host lookup, RPC-style.
    pub fn get_hosts_where(&self, pred: impl Fn(&Host) -> bool) -> Vec<Host> {
        let mut hosts: Vec<Host> = self.hosts.values().filter(|h| pred(h)).cloned().collect();
        hosts.sort_by_key(|h| h.id);
        hosts
    }

    /// Bulk update by filter, RPC-style. Returns the number of hosts touched.
    pub fn modify_hosts(
        &mut self,
        pred: impl Fn(&Host) -> bool,
        apply: impl Fn(&mut Host),
    ) -> usize {
        let mut touched = 0;
        for host in self.hosts.values_mut() {
            if pred(host) {
                apply(host);
                touched += 1;
            }
        }
        touched
    }

    pub fn set_host_status(&mut self, id: HostId, status: HostStatus) {
        if let Some(host) = self.hosts.get_mut(&id) {
            host.status = status;
        }
    }

    pub fn lock_host(&mut self, id: HostId, holder: &str) -> Result<(), CorralError> {
        let host = self
            .hosts
            .get_mut(&id)
            .ok_or_else(|| CorralError::DatastoreError(format!("no host with id {}", id)))?;
        if host.locked {
            return Err(CorralError::DatastoreError(format!(
                "host {} already locked by {}",
                host.hostname,
                host.lock_holder.as_deref().unwrap_or("unknown")
            )));
        }
        host.locked = true;
        host.lock_holder = Some(holder.to_string());
        Ok(())
    }

    pub fn unlock_host(&mut self, id: HostId) {
        if let Some(host) = self.hosts.get_mut(&id) {
            host.locked = false;
            host.lock_holder = None;
        }
    }

    // ===== Queue entries =====

    #[allow(clippy::too_many_arguments)]
    pub fn create_queue_entry(
        &mut self,
        job_name: &str,
        owner: &str,
        command: &str,
        priority: i32,
        meta_host: Option<LabelId>,
        host: Option<HostId>,
        deps: HashSet<LabelId>,
    ) -> EntryId {
        self.next_entry_id += 1;
        let id = self.next_entry_id;
        self.entries.insert(
            id,
            HostQueueEntry {
                id,
                job_name: job_name.to_string(),
                owner: owner.to_string(),
                command: command.to_string(),
                priority,
                meta_host,
                host,
                deps,
                status: EntryStatus::Queued,
                aborted: false,
                final_status: None,
            },
        );
        id
    }

    pub fn entry(&self, id: EntryId) -> Option<&HostQueueEntry> {
        self.entries.get(&id)
    }

    pub fn entries_where(&self, pred: impl Fn(&HostQueueEntry) -> bool) -> Vec<HostQueueEntry> {
        let mut entries: Vec<HostQueueEntry> =
            self.entries.values().filter(|e| pred(e)).cloned().collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    pub fn set_entry_status(&mut self, id: EntryId, status: EntryStatus) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.status = status;
        }
    }

    pub fn set_entry_final_status(&mut self, id: EntryId, status: EntryStatus) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.final_status = Some(status);
        }
    }

    /// The single atomic commit point of scheduling: binds `host` to `entry`.
    ///
    /// Returns `Ok(false)` and leaves the entry untouched when the entry was
    /// aborted or already left `Queued` while the caller was probing, so a
    /// stale probe result is discarded rather than committed.
    pub fn assign_host(&mut self, entry: EntryId, host: HostId) -> Result<bool, CorralError> {
        if !self.hosts.contains_key(&host) {
            return Err(CorralError::DatastoreError(format!(
                "no host with id {}",
                host
            )));
        }
        let entry = self
            .entries
            .get_mut(&entry)
            .ok_or_else(|| CorralError::DatastoreError(format!("no queue entry with id {}", entry)))?;
        if entry.aborted || entry.status != EntryStatus::Queued {
            return Ok(false);
        }
        entry.host = Some(host);
        Ok(true)
    }

    /// Pending entries in scheduling order: priority first, then entries
    /// that already have a host, then meta-host entries, then submission
    /// order.
    pub fn pending_queue_entries(&self) -> Vec<HostQueueEntry> {
        let mut entries: Vec<HostQueueEntry> = self
            .entries
            .values()
            .filter(|e| e.status == EntryStatus::Queued && !e.aborted)
            .cloned()
            .collect();
        entries.sort_by_key(|e| {
            (
                std::cmp::Reverse(e.priority),
                e.host.is_none(),
                e.meta_host.is_none(),
                e.id,
            )
        });
        entries
    }

    /// Flags matching not-yet-complete entries as aborted. The dispatcher
    /// honors the flag on its next tick.
    pub fn abort_host_queue_entries(&mut self, pred: impl Fn(&HostQueueEntry) -> bool) -> usize {
        let mut flagged = 0;
        for entry in self.entries.values_mut() {
            if !entry.status.is_terminal() && pred(entry) {
                entry.aborted = true;
                flagged += 1;
            }
        }
        flagged
    }

    /// Operator-facing bulk abort by job name pattern and owner.
    pub fn abort_suite(&mut self, name_pattern: &str, owner: &str) -> usize {
        self.abort_host_queue_entries(|e| e.owner == owner && e.job_name.contains(name_pattern))
    }

    // ===== Special tasks =====

    pub fn create_special_task(
        &mut self,
        host: HostId,
        task: TaskKind,
        requested_by: UserId,
        queue_entry: Option<EntryId>,
    ) -> TaskId {
        self.next_task_id += 1;
        let id = self.next_task_id;
        self.tasks.insert(
            id,
            SpecialTask {
                id,
                host,
                task,
                requested_by,
                queue_entry,
                is_active: false,
                is_complete: false,
                is_aborted: false,
            },
        );
        id
    }

    pub fn special_task(&self, id: TaskId) -> Option<&SpecialTask> {
        self.tasks.get(&id)
    }

    /// Whether the host has a special task that has not started yet.
    pub fn host_has_scheduled_special_task(&self, host: HostId) -> bool {
        self.tasks
            .values()
            .any(|t| t.host == host && !t.is_active && !t.is_complete)
    }

    /// Queued special tasks ordered for repair first, then cleanup, verify,
    /// reset, and provision. Tasks on locked hosts and on hosts with an
    /// active queue entry (other than the task's own) are held back.
    pub fn prioritized_special_tasks(&self) -> Vec<SpecialTask> {
        let mut tasks: Vec<SpecialTask> = self
            .tasks
            .values()
            .filter(|t| !t.is_active && !t.is_complete && !t.is_aborted)
            .filter(|t| self.hosts.get(&t.host).map(|h| !h.locked).unwrap_or(false))
            .filter(|t| {
                !self.entries.values().any(|e| {
                    e.host == Some(t.host) && e.status.is_active() && t.queue_entry != Some(e.id)
                })
            })
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.task, t.id));
        tasks
    }

    pub fn set_task_active(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.is_active = true;
        }
    }

    pub fn complete_task(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.is_active = false;
            task.is_complete = true;
        }
    }
}
