//! SSH transport.
//!
//! The one operation the scheduler needs from the transport layer is "run a
//! command on a host with a timeout, return its exit status". The `Session`
//! trait keeps that boundary narrow so tests can substitute a mock, and so
//! transport-level failures stay typed instead of leaking openssh details
//! into scheduling control flow.

use std::process::ExitStatus;
use std::time::Duration;

use async_trait::async_trait;
use openssh::{KnownHosts, Session as SSHSession, Stdio};

use crate::error::CorralError;

/// Remote command execution. Implementations must distinguish
/// "unreachable or timed out" (an `Err`) from "ran and failed", which is a
/// clean `Ok` carrying a non-zero exit status.
#[async_trait]
pub trait Session {
    async fn run(
        &self,
        hostname: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExitStatus, CorralError>;
}

/// Runs commands over a fresh openssh connection per invocation. Hosts come
/// and go across ticks, so no connection state is cached here.
pub struct SshSession;

#[async_trait]
impl Session for SshSession {
    async fn run(
        &self,
        hostname: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExitStatus, CorralError> {
        let work = async {
            let session = SSHSession::connect_mux(hostname, KnownHosts::Add).await?;
            let mut cmd = session.command("sh");
            let process = cmd
                .arg("-c")
                .raw_arg(format!("'{}'", command))
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            let mut process = process.spawn().await?;
            let status = process.wait().await?;
            session.close().await?;
            Ok::<ExitStatus, CorralError>(status)
        };
        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(CorralError::Timeout(timeout)),
        }
    }
}
