//! Host reachability probing.
//!
//! Probing before assignment, rather than deferring to the post-assignment
//! verify task, keeps the scheduler from handing a job to a host that is
//! about to spend minutes failing verification.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::host::Host;
use crate::session::Session;

/// Outcome of a reachability probe. Transport failures of every kind
/// (timeout, connection refused, auth failure) fold into `Unreachable`;
/// a probe never raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable,
    Unreachable,
}

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, host: &Host) -> ProbeOutcome;
}

/// Probes by running a no-op command over the transport with a short
/// bounded timeout. Reachable iff the command exits cleanly in time.
pub struct CommandProber {
    session: Arc<dyn Session + Send + Sync>,
    timeout: Duration,
}

impl CommandProber {
    pub fn new(session: Arc<dyn Session + Send + Sync>, timeout: Duration) -> Self {
        Self { session, timeout }
    }
}

#[async_trait]
impl Prober for CommandProber {
    async fn probe(&self, host: &Host) -> ProbeOutcome {
        match self.session.run(&host.hostname, "true", self.timeout).await {
            Ok(status) if status.code() == Some(0) => ProbeOutcome::Reachable,
            _ => ProbeOutcome::Unreachable,
        }
    }
}
