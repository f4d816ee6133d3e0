//! The dispatcher tick loop.
//!
//! Each tick runs to completion, single-threaded: drain completion
//! notifications from finished agents, honor abort flags, route unhealthy
//! hosts to maintenance, start queued special tasks, then schedule new
//! jobs. Remote work (jobs and special tasks) runs in spawned agents that
//! report back over a channel; the dispatcher itself never blocks on a
//! remote command.

use std::collections::HashSet;
use std::sync::Arc;

use colored::ColoredString;
use colourado::{Color, ColorPalette, PaletteType};
use futures::future::join_all;
use handlebars::Handlebars;

use crate::config::SchedulerConfig;
use crate::host::{Host, HostStatus};
use crate::job;
use crate::labels::LabelPool;
use crate::probe::Prober;
use crate::scheduler::MetahostScheduler;
use crate::session::Session;
use crate::store::{
    Datastore, EntryId, EntryStatus, HostId, SharedDatastore, SpecialTask, TaskId, TaskKind,
};

/// Message sent from a spawned agent back to the dispatcher when its remote
/// work finishes.
#[derive(Debug)]
pub enum Completion {
    Job {
        entry: EntryId,
        host: HostId,
        success: bool,
    },
    Special {
        task: TaskId,
        host: HostId,
        success: bool,
    },
}

pub struct Dispatcher {
    store: SharedDatastore,
    config: SchedulerConfig,
    scheduler: MetahostScheduler,
    session: Arc<dyn Session + Send + Sync>,
    prober: Arc<dyn Prober>,
    /// Handlebars registry for filling in job command templates.
    registry: Handlebars<'static>,
    completion_tx: flume::Sender<Completion>,
    completion_rx: flume::Receiver<Completion>,
    /// Hosts with an in-flight agent (job or special task).
    agents: HashSet<HostId>,
    /// Join handles of spawned agents, drained at shutdown.
    tasks: Vec<tokio::task::JoinHandle<()>>,
    palette: Vec<Color>,
}

impl Dispatcher {
    pub fn new(
        store: SharedDatastore,
        config: SchedulerConfig,
        session: Arc<dyn Session + Send + Sync>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let scheduler = MetahostScheduler::new(config.seed);
        let mut registry = Handlebars::new();
        handlebars_misc_helpers::register(&mut registry);
        let (completion_tx, completion_rx) = flume::unbounded();
        Self {
            store,
            config,
            scheduler,
            session,
            prober,
            registry,
            completion_tx,
            completion_rx,
            agents: HashSet::new(),
            tasks: Vec::new(),
            palette: ColorPalette::new(16, PaletteType::Pastel, false).colors,
        }
    }

    /// Startup recovery: hosts stuck in a mid-maintenance status from a
    /// previous run get a cleanup task queued.
    pub fn initialize(&mut self) {
        self.reverify_hosts_where(
            |host| {
                matches!(
                    host.status,
                    HostStatus::Repairing
                        | HostStatus::Verifying
                        | HostStatus::Cleaning
                        | HostStatus::Provisioning
                )
            },
            "Recovering active host (this probably indicates a scheduler bug):",
        );
    }

    /// One scheduler pass.
    pub async fn tick(&mut self) {
        self.process_completions();
        self.find_aborting();
        self.recover_hosts();
        self.schedule_special_tasks();
        self.schedule_new_jobs().await;
    }

    pub fn host_has_agent(&self, host: HostId) -> bool {
        self.agents.contains(&host)
    }

    /// No in-flight agents and no entries left to run.
    pub fn is_idle(&self) -> bool {
        if !self.agents.is_empty() {
            return false;
        }
        let store = self.store.lock().expect("Datastore lock poisoned.");
        store
            .entries_where(|e| !e.status.is_terminal())
            .is_empty()
    }

    /// Waits for all spawned agents to finish and applies their results.
    pub async fn drain(&mut self) {
        join_all(std::mem::take(&mut self.tasks)).await;
        self.process_completions();
    }

    fn colorhost(&self, host: &Host) -> ColoredString {
        host.prettify(self.palette[host.id as usize % self.palette.len()])
    }

    /// Applies completion notifications from finished agents, walking each
    /// finished entry through its tail lifecycle:
    /// Running -> Gathering -> Parsing -> [Archiving] -> terminal.
    fn process_completions(&mut self) {
        {
            // Entries parked in Archiving last tick reach their final status.
            let mut store = self.store.lock().expect("Datastore lock poisoned.");
            for entry in store.entries_where(|e| e.status == EntryStatus::Archiving) {
                let final_status = entry.final_status.unwrap_or(EntryStatus::Completed);
                store.set_entry_status(entry.id, final_status);
            }
        }
        while let Ok(completion) = self.completion_rx.try_recv() {
            match completion {
                Completion::Job {
                    entry,
                    host,
                    success,
                } => {
                    self.agents.remove(&host);
                    let mut store = self.store.lock().expect("Datastore lock poisoned.");
                    store.set_host_status(host, HostStatus::Ready);
                    store.set_entry_status(entry, EntryStatus::Gathering);
                    store.set_entry_status(entry, EntryStatus::Parsing);
                    let aborted = store.entry(entry).map(|e| e.aborted).unwrap_or(false);
                    let final_status = if aborted {
                        EntryStatus::Aborted
                    } else if success {
                        EntryStatus::Completed
                    } else {
                        EntryStatus::Failed
                    };
                    self.archive_results(&mut store, entry, final_status);
                }
                Completion::Special {
                    task,
                    host,
                    success,
                } => {
                    self.agents.remove(&host);
                    let mut store = self.store.lock().expect("Datastore lock poisoned.");
                    store.complete_task(task);
                    store.set_host_status(
                        host,
                        if success {
                            HostStatus::Ready
                        } else {
                            HostStatus::RepairFailed
                        },
                    );
                }
            }
        }
    }

    /// Archiving is a configurable pass-through stage: enabled, the entry
    /// parks in Archiving until the next tick; disabled, it goes straight to
    /// its final status.
    fn archive_results(&self, store: &mut Datastore, entry: EntryId, final_status: EntryStatus) {
        if self.config.archiving_enabled {
            store.set_entry_final_status(entry, final_status);
            store.set_entry_status(entry, EntryStatus::Archiving);
        } else {
            store.set_entry_status(entry, final_status);
        }
    }

    /// Honors abort flags set through the datastore. Entries whose host has
    /// an in-flight agent are left for process_completions to finalize; the
    /// remote command is not interrupted.
    fn find_aborting(&mut self) {
        let mut store = self.store.lock().expect("Datastore lock poisoned.");
        for entry in store.entries_where(|e| e.aborted && !e.status.is_terminal()) {
            if let Some(host) = entry.host {
                if self.agents.contains(&host) {
                    continue;
                }
            }
            eprintln!("[Corral] Aborting entry {} ({}).", entry.id, entry.job_name);
            store.set_entry_status(entry.id, EntryStatus::Aborted);
        }
    }

    /// Routes "Repair Failed" hosts back through cleanup.
    fn recover_hosts(&mut self) {
        self.reverify_hosts_where(
            |host| host.status == HostStatus::RepairFailed,
            "Reverifying dead host",
        );
    }

    /// Scans unlocked, valid hosts matching the filter and queues a Cleanup
    /// special task for each, unless the host already has an agent or an
    /// un-started special task. Attribution falls back to the configured
    /// default user id when the system user is not enrolled.
    fn reverify_hosts_where(&mut self, pred: impl Fn(&Host) -> bool, message: &str) {
        let mut store = self.store.lock().expect("Datastore lock poisoned.");
        let matches = store.get_hosts_where(|h| !h.locked && !h.invalid && pred(h));
        for host in matches {
            if self.agents.contains(&host.id) {
                // Host is already being recovered in some way.
                continue;
            }
            if store.host_has_scheduled_special_task(host.id) {
                // Host will have a special task run on an upcoming tick.
                continue;
            }
            eprintln!("[Corral] {} {}", message, self.colorhost(&host));
            let user = match store.user_id(&self.config.system_user) {
                Some(user) => user,
                None => {
                    eprintln!(
                        "[Corral] System user '{}' not found; attributing to user id {}.",
                        self.config.system_user, self.config.default_user_id
                    );
                    self.config.default_user_id
                }
            };
            store.create_special_task(host.id, TaskKind::Cleanup, user, None);
        }
    }

    /// Starts queued special tasks on idle hosts, repair first.
    fn schedule_special_tasks(&mut self) {
        let tasks = {
            let store = self.store.lock().expect("Datastore lock poisoned.");
            store.prioritized_special_tasks()
        };
        for task in tasks {
            if self.host_has_agent(task.host) {
                continue;
            }
            self.run_special_task(task);
        }
    }

    fn run_special_task(&mut self, task: SpecialTask) {
        let (hostname, colorhost) = {
            let mut store = self.store.lock().expect("Datastore lock poisoned.");
            let host = match store.host(task.host) {
                Some(host) => host.clone(),
                None => return,
            };
            store.set_task_active(task.id);
            store.set_host_status(task.host, task.task.running_status());
            (host.hostname.clone(), self.colorhost(&host))
        };
        self.agents.insert(task.host);

        let session = Arc::clone(&self.session);
        let tx = self.completion_tx.clone();
        let timeout = self.config.command_timeout;
        let command = task.task.command().to_string();
        eprintln!("{} Running {} task.", colorhost, task.task);
        self.tasks.push(tokio::spawn(async move {
            let result = session.run(&hostname, &command, timeout).await;
            let success = matches!(&result, Ok(status) if status.code() == Some(0));
            match result {
                Ok(status) => eprintln!("{} === {} done ({}) ===", colorhost, command, status),
                Err(error) => eprintln!("{} === {} done (error: {}) ===", colorhost, command, error),
            }
            let _ = tx.send(Completion::Special {
                task: task.id,
                host: task.host,
                success,
            });
        }));
    }

    /// Assigns hosts to pending queue entries and starts the ones that got
    /// one. A datastore failure aborts only that entry's processing; the
    /// entry stays Queued and is retried next tick.
    async fn schedule_new_jobs(&mut self) {
        let entries = {
            let store = self.store.lock().expect("Datastore lock poisoned.");
            store.pending_queue_entries()
        };
        if entries.is_empty() {
            return;
        }
        let mut pool = {
            let store = self.store.lock().expect("Datastore lock poisoned.");
            LabelPool::snapshot(&store)
        };
        eprintln!("[Corral] Processing {} queue entries.", entries.len());
        for entry in entries {
            let result = if entry.host.is_some() {
                self.scheduler.schedule_explicit_entry(&self.store, &entry)
            } else if self.scheduler.can_schedule_metahost(&entry) {
                self.scheduler
                    .schedule_metahost_entry(&self.store, &mut pool, self.prober.as_ref(), &entry)
                    .await
            } else {
                Ok(None)
            };
            match result {
                Ok(Some(host)) => {
                    if !self.host_has_agent(host) {
                        self.run_queue_entry(entry.id, host);
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    eprintln!(
                        "[Corral] Scheduling entry {} failed: {}. Will retry next tick.",
                        entry.id, error
                    );
                }
            }
        }
    }

    /// Starts the job agent for a bound entry.
    fn run_queue_entry(&mut self, entry: EntryId, host: HostId) {
        let (hostname, command, colorhost) = {
            let mut store = self.store.lock().expect("Datastore lock poisoned.");
            let (hostname, command, colorhost) = {
                let (entry, host) = match (store.entry(entry), store.host(host)) {
                    (Some(entry), Some(host)) => (entry, host),
                    _ => return,
                };
                let command = job::fill_command(&mut self.registry, &entry.command, host);
                (host.hostname.clone(), command, self.colorhost(host))
            };
            store.set_entry_status(entry, EntryStatus::Starting);
            store.set_host_status(host, HostStatus::Running);
            store.set_entry_status(entry, EntryStatus::Running);
            (hostname, command, colorhost)
        };
        self.agents.insert(host);

        let session = Arc::clone(&self.session);
        let tx = self.completion_tx.clone();
        let timeout = self.config.command_timeout;
        self.tasks.push(tokio::spawn(async move {
            eprintln!("{} === run '{}' ===", colorhost, command);
            let result = session.run(&hostname, &command, timeout).await;
            let success = matches!(&result, Ok(status) if status.code() == Some(0));
            match result {
                Ok(status) => eprintln!("{} === done ({}) ===", colorhost, status),
                Err(error) => eprintln!("{} === done (error: {}) ===", colorhost, error),
            }
            let _ = tx.send(Completion::Job {
                entry,
                host,
                success,
            });
        }));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::host::HostDef;
    use crate::probe::CommandProber;
    use crate::session::SshSession;
    use crate::store::shared;

    fn dispatcher_with_store(store: SharedDatastore) -> Dispatcher {
        let session: Arc<dyn Session + Send + Sync> = Arc::new(SshSession);
        let prober = Arc::new(CommandProber::new(
            Arc::clone(&session),
            Duration::from_secs(5),
        ));
        Dispatcher::new(store, SchedulerConfig::default(), session, prober)
    }

    fn store_with_repair_failed_host() -> SharedDatastore {
        let mut store = Datastore::new();
        store.add_user("corral-system");
        let host = store.enroll_host(&HostDef {
            hostname: "dead.lab".to_string(),
            labels: vec![],
            locked: false,
        });
        store.set_host_status(host, HostStatus::RepairFailed);
        shared(store)
    }

    #[tokio::test]
    async fn test_recover_hosts_creates_one_cleanup_task() {
        let store = store_with_repair_failed_host();
        let mut dispatcher = dispatcher_with_store(store.clone());
        dispatcher.recover_hosts();
        // A second pass without an intervening status change must not
        // create a duplicate.
        dispatcher.recover_hosts();

        let store = store.lock().unwrap();
        let host = store.host_by_name("dead.lab").unwrap().id;
        assert!(store.host_has_scheduled_special_task(host));
        assert_eq!(store.prioritized_special_tasks().len(), 1);
        assert_eq!(store.prioritized_special_tasks()[0].task, TaskKind::Cleanup);
    }

    #[tokio::test]
    async fn test_recover_hosts_skips_locked_hosts() {
        let store = store_with_repair_failed_host();
        {
            let mut store = store.lock().unwrap();
            let host = store.host_by_name("dead.lab").unwrap().id;
            store.lock_host(host, "operator").unwrap();
        }
        let mut dispatcher = dispatcher_with_store(store.clone());
        dispatcher.recover_hosts();

        let store = store.lock().unwrap();
        let host = store.host_by_name("dead.lab").unwrap().id;
        assert!(!store.host_has_scheduled_special_task(host));
    }

    #[tokio::test]
    async fn test_reverify_falls_back_to_default_user() {
        let store = shared({
            let mut store = Datastore::new();
            // No corral-system user enrolled.
            let host = store.enroll_host(&HostDef {
                hostname: "dead.lab".to_string(),
                labels: vec![],
                locked: false,
            });
            store.set_host_status(host, HostStatus::RepairFailed);
            store
        });
        let mut dispatcher = dispatcher_with_store(store.clone());
        dispatcher.recover_hosts();

        let store = store.lock().unwrap();
        let task = &store.prioritized_special_tasks()[0];
        assert_eq!(task.requested_by, SchedulerConfig::default().default_user_id);
    }

    #[tokio::test]
    async fn test_find_aborting_finalizes_unstarted_entries() {
        let store = shared(Datastore::new());
        let entry = {
            let mut store = store.lock().unwrap();
            let id = store.create_queue_entry(
                "job",
                "me",
                "true",
                0,
                None,
                None,
                Default::default(),
            );
            store.abort_host_queue_entries(|e| e.id == id);
            id
        };
        let mut dispatcher = dispatcher_with_store(store.clone());
        dispatcher.find_aborting();
        assert_eq!(
            store.lock().unwrap().entry(entry).unwrap().status,
            EntryStatus::Aborted
        );
    }

    #[tokio::test]
    async fn test_archive_results_pass_through_stage() {
        let store = shared(Datastore::new());
        let entry = store.lock().unwrap().create_queue_entry(
            "job",
            "me",
            "true",
            0,
            None,
            None,
            Default::default(),
        );

        // Enabled: entry parks in Archiving, then finalizes next pass.
        let dispatcher = dispatcher_with_store(store.clone());
        {
            let mut guard = store.lock().unwrap();
            dispatcher.archive_results(&mut guard, entry, EntryStatus::Completed);
            assert_eq!(guard.entry(entry).unwrap().status, EntryStatus::Archiving);
        }
        let mut dispatcher = dispatcher;
        dispatcher.process_completions();
        assert_eq!(
            store.lock().unwrap().entry(entry).unwrap().status,
            EntryStatus::Completed
        );

        // Disabled: straight to the final status.
        let entry2 = store.lock().unwrap().create_queue_entry(
            "job2",
            "me",
            "true",
            0,
            None,
            None,
            Default::default(),
        );
        let mut config = SchedulerConfig::default();
        config.archiving_enabled = false;
        let session: Arc<dyn Session + Send + Sync> = Arc::new(SshSession);
        let prober = Arc::new(CommandProber::new(
            Arc::clone(&session),
            Duration::from_secs(5),
        ));
        let dispatcher = Dispatcher::new(store.clone(), config, session, prober);
        let mut guard = store.lock().unwrap();
        dispatcher.archive_results(&mut guard, entry2, EntryStatus::Failed);
        assert_eq!(guard.entry(entry2).unwrap().status, EntryStatus::Failed);
    }
}
