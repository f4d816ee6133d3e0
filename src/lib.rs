//! Corral: A Test-Fleet Job Scheduler.

// Serde helper module.
mod serde;
// Command line arguments and configuration.
pub mod config;
// How to parse and represent hosts.
pub mod host;
// How to parse and represent jobs.
pub mod job;
// Fleet state datastore.
pub mod store;
// In-tick label membership and replayable cursors.
pub mod labels;
// Host eligibility checks.
pub mod eligibility;
// Host reachability probing.
pub mod probe;
// Metahost scheduling.
pub mod scheduler;
// The dispatcher tick loop.
pub mod dispatcher;
// Advisory host locking.
pub mod sync;
// SSH transport.
pub mod session;
// Error handling.
pub mod error;

pub use config::{Config, Mode, SchedulerConfig};
pub use dispatcher::{Completion, Dispatcher};
pub use eligibility::{ineligible_hosts_for_entry, is_eligible_for_entry, is_host_usable};
pub use error::CorralError;
pub use host::{get_hosts, Host, HostDef, HostStatus};
pub use job::{fill_command, submit_job, validate_queue_file, JobQueue, JobSpec};
pub use labels::{LabelPool, RememberingIterator};
pub use probe::{CommandProber, ProbeOutcome, Prober};
pub use scheduler::MetahostScheduler;
pub use session::{Session, SshSession};
pub use store::{
    shared, Datastore, EntryId, EntryStatus, HostId, HostQueueEntry, Label, LabelId,
    SharedDatastore, SpecialTask, TaskId, TaskKind, UserId,
};
pub use sync::HostLockManager;
