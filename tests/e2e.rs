//! End-to-end tests for Corral scheduling.

use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use corral::{
    shared, CommandProber, CorralError, Datastore, Dispatcher, EntryStatus, HostDef, HostStatus,
    SchedulerConfig, Session, SharedDatastore, TaskKind,
};

fn exit_status(code: i32) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    ExitStatus::from_raw(code << 8)
}

/// Record of an executed remote command for testing.
#[derive(Debug, Clone)]
pub struct ExecutedCommand {
    pub hostname: String,
    pub command: String,
}

/// Mock transport that doesn't actually reach any host. Exit codes are
/// keyed by command so a probe and a job on the same host can behave
/// differently; unconfigured commands exit cleanly.
pub struct MockSession {
    executed: Arc<Mutex<Vec<ExecutedCommand>>>,
    exit_codes: HashMap<String, i32>,
    unreachable: Vec<String>,
    delay_ms: u64,
}

impl MockSession {
    pub fn new() -> Self {
        Self {
            executed: Arc::new(Mutex::new(Vec::new())),
            exit_codes: HashMap::new(),
            unreachable: Vec::new(),
            delay_ms: 0,
        }
    }

    pub fn with_exit_code(mut self, command: &str, code: i32) -> Self {
        self.exit_codes.insert(command.to_string(), code);
        self
    }

    pub fn with_unreachable(mut self, hostname: &str) -> Self {
        self.unreachable.push(hostname.to_string());
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn executed(&self) -> Arc<Mutex<Vec<ExecutedCommand>>> {
        Arc::clone(&self.executed)
    }
}

#[async_trait]
impl Session for MockSession {
    async fn run(
        &self,
        hostname: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExitStatus, CorralError> {
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        if self.unreachable.iter().any(|h| h == hostname) {
            return Err(CorralError::Timeout(timeout));
        }
        self.executed.lock().await.push(ExecutedCommand {
            hostname: hostname.to_string(),
            command: command.to_string(),
        });
        Ok(exit_status(
            self.exit_codes.get(command).copied().unwrap_or(0),
        ))
    }
}

fn fleet(hostnames: &[&str], label: &str) -> SharedDatastore {
    let mut store = Datastore::new();
    store.add_user("corral-system");
    for name in hostnames {
        store.enroll_host(&HostDef {
            hostname: name.to_string(),
            labels: vec![label.to_string()],
            locked: false,
        });
    }
    shared(store)
}

fn harness(store: SharedDatastore, session: MockSession, config: SchedulerConfig) -> Dispatcher {
    let session: Arc<dyn Session + Send + Sync> = Arc::new(session);
    let prober = Arc::new(CommandProber::new(
        Arc::clone(&session),
        config.probe_timeout,
    ));
    Dispatcher::new(store, config, session, prober)
}

fn enqueue_metahost(store: &SharedDatastore, label: &str, name: &str, command: &str) -> u64 {
    let mut store = store.lock().unwrap();
    let label = store.label_id(label).unwrap();
    store.create_queue_entry(name, "me", command, 0, Some(label), None, Default::default())
}

/// Ticks until nothing is left to do, draining agents between passes.
async fn run_to_idle(dispatcher: &mut Dispatcher) {
    for _ in 0..20 {
        dispatcher.tick().await;
        dispatcher.drain().await;
        if dispatcher.is_idle() {
            return;
        }
    }
    panic!("Dispatcher did not go idle within 20 ticks.");
}

#[tokio::test]
async fn test_single_job_runs_to_completion() {
    let store = fleet(&["a.lab"], "pool:x");
    let session = MockSession::new();
    let executed = session.executed();
    let mut dispatcher = harness(store.clone(), session, SchedulerConfig::default());

    let entry = enqueue_metahost(&store, "pool:x", "job", "run_suite --dut {{hostname}}");
    run_to_idle(&mut dispatcher).await;

    {
        let store = store.lock().unwrap();
        let entry = store.entry(entry).unwrap();
        assert_eq!(entry.status, EntryStatus::Completed);
        assert!(entry.host.is_some());
        let host = store.host(entry.host.unwrap()).unwrap();
        assert_eq!(host.status, HostStatus::Ready);
    }

    // The probe's no-op plus the templated job command.
    let executed = executed.lock().await;
    let commands: Vec<&str> = executed.iter().map(|e| e.command.as_str()).collect();
    assert_eq!(commands, vec!["true", "run_suite --dut a.lab"]);
}

#[tokio::test]
async fn test_no_two_entries_share_a_host() {
    let store = fleet(&["a.lab", "b.lab", "c.lab"], "pool:x");
    let session = MockSession::new().with_delay_ms(20);
    let mut config = SchedulerConfig::default();
    config.seed = Some(42);
    let mut dispatcher = harness(store.clone(), session, config);

    let entries: Vec<u64> = (0..6)
        .map(|i| enqueue_metahost(&store, "pool:x", &format!("job{}", i), "true"))
        .collect();

    // First tick: at most one entry per host may start.
    dispatcher.tick().await;
    {
        let store = store.lock().unwrap();
        let mut bound: Vec<u64> = Vec::new();
        for &entry in &entries {
            if let Some(host) = store.entry(entry).unwrap().host {
                bound.push(host);
            }
        }
        assert_eq!(bound.len(), 3);
        bound.sort_unstable();
        bound.dedup();
        assert_eq!(bound.len(), 3, "two entries were bound to the same host");
    }

    run_to_idle(&mut dispatcher).await;
    let store = store.lock().unwrap();
    for &entry in &entries {
        assert_eq!(store.entry(entry).unwrap().status, EntryStatus::Completed);
    }
}

#[tokio::test]
async fn test_unreachable_host_is_skipped_and_absorbed() {
    let store = fleet(&["a.lab", "b.lab"], "pool:x");
    let session = MockSession::new().with_unreachable("a.lab");
    let mut config = SchedulerConfig::default();
    config.seed = Some(7);
    let mut dispatcher = harness(store.clone(), session, config);

    let entry = enqueue_metahost(&store, "pool:x", "job", "true");
    run_to_idle(&mut dispatcher).await;

    let store = store.lock().unwrap();
    let entry = store.entry(entry).unwrap();
    assert_eq!(entry.status, EntryStatus::Completed);
    let host = store.host(entry.host.unwrap()).unwrap();
    assert_eq!(host.hostname, "b.lab");
}

#[tokio::test]
async fn test_failed_job_marks_entry_failed() {
    let store = fleet(&["a.lab"], "pool:x");
    let session = MockSession::new().with_exit_code("flaky_test", 1);
    let mut dispatcher = harness(store.clone(), session, SchedulerConfig::default());

    let entry = enqueue_metahost(&store, "pool:x", "job", "flaky_test");
    run_to_idle(&mut dispatcher).await;

    // The probe's no-op succeeded, so the job ran and its nonzero exit
    // became a Failed entry. The host goes back to Ready regardless.
    let store = store.lock().unwrap();
    assert_eq!(store.entry(entry).unwrap().status, EntryStatus::Failed);
    let host = store.host_by_name("a.lab").unwrap();
    assert_eq!(host.status, HostStatus::Ready);
}

#[tokio::test]
async fn test_repair_failed_host_gets_cleanup_then_ready() {
    let store = fleet(&["dead.lab"], "pool:x");
    {
        let mut store = store.lock().unwrap();
        let host = store.host_by_name("dead.lab").unwrap().id;
        store.set_host_status(host, HostStatus::RepairFailed);
    }
    let session = MockSession::new();
    let executed = session.executed();
    let mut dispatcher = harness(store.clone(), session, SchedulerConfig::default());

    dispatcher.tick().await;
    dispatcher.drain().await;
    dispatcher.tick().await;

    {
        let store = store.lock().unwrap();
        let host = store.host_by_name("dead.lab").unwrap();
        assert_eq!(host.status, HostStatus::Ready);
        assert!(!store.host_has_scheduled_special_task(host.id));
    }
    let executed = executed.lock().await;
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].command, TaskKind::Cleanup.command());
}

#[tokio::test]
async fn test_cleanup_failure_returns_host_to_repair_failed() {
    let store = fleet(&["dead.lab"], "pool:x");
    {
        let mut store = store.lock().unwrap();
        let host = store.host_by_name("dead.lab").unwrap().id;
        store.set_host_status(host, HostStatus::RepairFailed);
    }
    let session = MockSession::new().with_exit_code(TaskKind::Cleanup.command(), 2);
    let mut dispatcher = harness(store.clone(), session, SchedulerConfig::default());

    dispatcher.tick().await;
    dispatcher.drain().await;
    dispatcher.tick().await;

    let store = store.lock().unwrap();
    let host = store.host_by_name("dead.lab").unwrap();
    assert_eq!(host.status, HostStatus::RepairFailed);
}

#[tokio::test]
async fn test_locked_host_is_never_assigned() {
    let store = fleet(&["a.lab"], "pool:x");
    {
        let mut store = store.lock().unwrap();
        let host = store.host_by_name("a.lab").unwrap().id;
        store.lock_host(host, "operator").unwrap();
    }
    let session = MockSession::new();
    let executed = session.executed();
    let mut dispatcher = harness(store.clone(), session, SchedulerConfig::default());

    let entry = enqueue_metahost(&store, "pool:x", "job", "true");
    dispatcher.tick().await;
    dispatcher.drain().await;

    let store_guard = store.lock().unwrap();
    assert_eq!(store_guard.entry(entry).unwrap().status, EntryStatus::Queued);
    assert_eq!(store_guard.entry(entry).unwrap().host, None);
    drop(store_guard);
    assert!(executed.lock().await.is_empty());
}

#[tokio::test]
async fn test_abort_suite_stops_queued_entries() {
    let store = fleet(&["a.lab"], "pool:x");
    let session = MockSession::new();
    let mut dispatcher = harness(store.clone(), session, SchedulerConfig::default());

    let wifi1 = enqueue_metahost(&store, "pool:x", "suite-wifi/t1", "true");
    let wifi2 = enqueue_metahost(&store, "pool:x", "suite-wifi/t2", "true");
    store.lock().unwrap().abort_suite("suite-wifi", "me");

    run_to_idle(&mut dispatcher).await;

    let store = store.lock().unwrap();
    assert_eq!(store.entry(wifi1).unwrap().status, EntryStatus::Aborted);
    assert_eq!(store.entry(wifi2).unwrap().status, EntryStatus::Aborted);
}

#[tokio::test]
async fn test_archiving_disabled_skips_stage() {
    let store = fleet(&["a.lab"], "pool:x");
    let session = MockSession::new();
    let mut config = SchedulerConfig::default();
    config.archiving_enabled = false;
    let mut dispatcher = harness(store.clone(), session, config);

    let entry = enqueue_metahost(&store, "pool:x", "job", "true");
    dispatcher.tick().await;
    dispatcher.drain().await;
    // drain's completion pass finalizes directly, no Archiving stop-over
    // and no extra tick needed.
    let store = store.lock().unwrap();
    assert_eq!(store.entry(entry).unwrap().status, EntryStatus::Completed);
    assert_eq!(store.entry(entry).unwrap().final_status, None);
}

#[tokio::test]
async fn test_dependency_labels_route_to_matching_host() {
    let store = {
        let mut store = Datastore::new();
        store.add_user("corral-system");
        store.enroll_host(&HostDef {
            hostname: "plain.lab".to_string(),
            labels: vec!["pool:x".to_string()],
            locked: false,
        });
        store.enroll_host(&HostDef {
            hostname: "link.lab".to_string(),
            labels: vec!["pool:x".to_string(), "board:link".to_string()],
            locked: false,
        });
        shared(store)
    };
    let session = MockSession::new();
    let mut config = SchedulerConfig::default();
    config.seed = Some(3);
    let mut dispatcher = harness(store.clone(), session, config);

    let entry = {
        let mut store = store.lock().unwrap();
        let pool = store.label_id("pool:x").unwrap();
        let board = store.label_id("board:link").unwrap();
        store.create_queue_entry(
            "job",
            "me",
            "true",
            0,
            Some(pool),
            None,
            [board].into_iter().collect(),
        )
    };
    run_to_idle(&mut dispatcher).await;

    let store = store.lock().unwrap();
    let entry = store.entry(entry).unwrap();
    assert_eq!(entry.status, EntryStatus::Completed);
    let host = store.host(entry.host.unwrap()).unwrap();
    assert_eq!(host.hostname, "link.lab");
}
