//! Configuration for Corral.
//!
//! Holds the clap structs for command line arguments and flags, plus the
//! `SchedulerConfig` value object that is resolved once at startup and
//! handed by reference to the components that need it. There is no global
//! configuration state anywhere else in the crate.

use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::store::UserId;

#[derive(Parser)]
#[command(version, author)]
pub struct Config {
    /// Run (r) the scheduler loop, or Check (c) that the queue file parses
    #[arg(value_enum)]
    pub mode: Mode,

    /// Don't terminate when the queue drains; keep watching for more jobs
    #[arg(long, short)]
    pub daemon: bool,

    /// Seconds between scheduler ticks
    #[arg(long, default_value = "5")]
    pub tick_interval: u64,

    /// Seconds before an SSH reachability probe is abandoned
    #[arg(long, default_value = "5")]
    pub probe_timeout: u64,

    /// Seconds before a dispatched remote command is abandoned
    #[arg(long, default_value = "3600")]
    pub command_timeout: u64,

    /// Skip the Archiving stage and move finished entries straight to their
    /// final status
    #[arg(long)]
    pub no_archiving: bool,

    /// Label that bare-string jobs are scheduled against
    #[arg(long, default_value = "default")]
    pub default_pool: String,

    /// Seed for the candidate shuffle. Useful for replaying a scheduling run.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Queue file to use. Defaults to `queue.yaml`
    #[arg(long, default_value = "queue.yaml")]
    pub queue_file: String,

    /// Host file to use. Defaults to `hosts.yaml`
    #[arg(long, default_value = "hosts.yaml")]
    pub hosts_file: String,
}

#[derive(PartialEq, Clone, ValueEnum)]
pub enum Mode {
    #[value(name = "r")]
    Run,
    #[value(name = "c")]
    Check,
}

/// Scheduler knobs, constructed once at process start.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Bound on the reachability probe's no-op command.
    pub probe_timeout: Duration,
    /// Bound on dispatched job and special-task commands.
    pub command_timeout: Duration,
    /// When false, finished entries skip the Archiving status entirely.
    pub archiving_enabled: bool,
    /// User that reverify-injected special tasks are attributed to.
    pub system_user: String,
    /// Fallback attribution when the system user is not enrolled.
    pub default_user_id: UserId,
    /// Label that jobs without a host or meta-host are scheduled against.
    pub default_pool: String,
    /// RNG seed for the metahost candidate shuffle.
    pub seed: Option<u64>,
}

impl SchedulerConfig {
    pub fn from_cli(cli: &Config) -> Self {
        Self {
            probe_timeout: Duration::from_secs(cli.probe_timeout),
            command_timeout: Duration::from_secs(cli.command_timeout),
            archiving_enabled: !cli.no_archiving,
            seed: cli.seed,
            default_pool: cli.default_pool.clone(),
            ..Self::default()
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(3600),
            archiving_enabled: true,
            system_user: "corral-system".to_string(),
            default_user_id: 1,
            default_pool: "default".to_string(),
            seed: None,
        }
    }
}
