use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CorralError {
    #[error("Failed to connect SSH session or execute SSH command: {0}")]
    SshError(#[from] openssh::Error),
    #[error("Remote command did not finish within {0:?}")]
    Timeout(Duration),
    #[error("Failed to execute local command: {0}")]
    LocalCommandError(#[from] std::io::Error),
    #[error("Datastore error: {0}")]
    DatastoreError(String),
    #[error("Invalid job spec: {0}")]
    JobSpecError(String),
}
