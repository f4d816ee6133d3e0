//! Job intake: parsing and validating the queue file.
//!
//! A queue file is a YAML list of job specs. A bare string is a command for
//! the configured default pool; a mapping can pin a specific host, request
//! any host with a meta-host label, add dependency labels, and set a
//! priority. Malformed specs are reported back to the producer at
//! submission time and never reach the scheduler's tick loop.

use std::collections::HashSet;
use std::fmt::Debug;
use std::fs::File;
use std::str::FromStr;

use handlebars::Handlebars;
use serde::Deserialize;
use void::Void;

use crate::config::SchedulerConfig;
use crate::error::CorralError;
use crate::host::Host;
use crate::serde::string_or_mapping;
use crate::store::{Datastore, EntryId, LabelId, SharedDatastore};

#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec(#[serde(deserialize_with = "string_or_mapping")] JobSpecInner);

#[derive(Debug, Clone, Deserialize)]
pub struct JobSpecInner {
    /// Command (template) to run on the assigned host.
    command: String,
    /// Pin to this specific hostname.
    #[serde(default)]
    host: Option<String>,
    /// Or request any host carrying this label.
    #[serde(default)]
    meta_host: Option<String>,
    /// Labels the assigned host must also carry.
    #[serde(default)]
    deps: Vec<String>,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    owner: Option<String>,
}

impl FromStr for JobSpecInner {
    type Err = Void;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            command: s.to_string(),
            host: None,
            meta_host: None,
            deps: vec![],
            priority: 0,
            name: None,
            owner: None,
        })
    }
}

/// Validates that a queue file is properly parsable.
/// Returns Ok(job_count) if valid, Err with message if invalid.
pub fn validate_queue_file(path: &str) -> Result<usize, String> {
    let file = File::open(path).map_err(|e| format!("Failed to open file: {}", e))?;
    let specs: Vec<JobSpec> =
        serde_yaml::from_reader(file).map_err(|e| format!("Failed to parse YAML: {}", e))?;

    for (i, spec) in specs.iter().enumerate() {
        if spec.0.command.is_empty() {
            return Err(format!("Job {} has an empty command", i));
        }
        if spec.0.host.is_some() && spec.0.meta_host.is_some() {
            return Err(format!("Job {} names both 'host' and 'meta_host'", i));
        }
    }

    Ok(specs.len())
}

/// Resolves a spec against enrolled hosts and labels and creates its queue
/// entry. Conflicting or unresolvable specs are rejected here.
pub fn submit_job(
    store: &mut Datastore,
    spec: &JobSpec,
    config: &SchedulerConfig,
) -> Result<EntryId, CorralError> {
    let spec = &spec.0;
    if spec.command.is_empty() {
        return Err(CorralError::JobSpecError("empty command".to_string()));
    }
    if spec.host.is_some() && spec.meta_host.is_some() {
        return Err(CorralError::JobSpecError(format!(
            "'{}' names both 'host' and 'meta_host'",
            spec.command
        )));
    }

    let host = match &spec.host {
        Some(hostname) => Some(
            store
                .host_by_name(hostname)
                .ok_or_else(|| {
                    CorralError::JobSpecError(format!("unknown host '{}'", hostname))
                })?
                .id,
        ),
        None => None,
    };

    // Jobs without a host or meta-host fall back to the default pool label.
    let meta_host = match (&spec.host, &spec.meta_host) {
        (Some(_), _) => None,
        (None, Some(label)) => Some(resolve_label(store, label)?),
        (None, None) => Some(resolve_label(store, &config.default_pool)?),
    };

    let deps: HashSet<LabelId> = spec
        .deps
        .iter()
        .map(|label| resolve_label(store, label))
        .collect::<Result<_, _>>()?;

    let name = spec.name.clone().unwrap_or_else(|| spec.command.clone());
    let owner = spec.owner.as_deref().unwrap_or("corral");
    Ok(store.create_queue_entry(
        &name,
        owner,
        &spec.command,
        spec.priority,
        meta_host,
        host,
        deps,
    ))
}

fn resolve_label(store: &Datastore, name: &str) -> Result<LabelId, CorralError> {
    store.label_id(name).ok_or_else(|| {
        CorralError::JobSpecError(format!(
            "label '{}' has no enrolled hosts; the dependency set is unsatisfiable",
            name
        ))
    })
}

/// Fills a job command template with the assigned host's parameters.
pub fn fill_command(registry: &mut Handlebars, command: &str, host: &Host) -> String {
    if !registry.has_template(command) {
        registry
            .register_template_string(command, command)
            .expect("Failed to register template string.");
    }
    let mut params = std::collections::HashMap::new();
    params.insert("hostname".to_string(), host.hostname.clone());
    registry.render(command, &params).unwrap_or_else(|e| {
        panic!(
            "Failed to render command template '{}' with params '{:#?}'. Error: {:?}",
            command, &params, e
        )
    })
}

/// Watches the queue file across ticks, submitting specs appended since the
/// last poll. Bad specs are reported and skipped, not retried.
pub struct JobQueue {
    queue_file: String,
    consumed: usize,
}

impl JobQueue {
    pub fn new(queue_file: &str) -> Self {
        Self {
            queue_file: queue_file.to_owned(),
            consumed: 0,
        }
    }

    /// Reads the queue file and submits any specs beyond the ones already
    /// consumed. Returns the number of entries created.
    pub fn poll(
        &mut self,
        store: &SharedDatastore,
        config: &SchedulerConfig,
    ) -> Result<usize, CorralError> {
        let file = File::open(&self.queue_file)?;
        let specs: Vec<JobSpec> = serde_yaml::from_reader(file).map_err(|e| {
            CorralError::JobSpecError(format!("Failed to parse {}: {}", self.queue_file, e))
        })?;
        if specs.len() <= self.consumed {
            return Ok(0);
        }

        let mut store = store.lock().expect("Datastore lock poisoned.");
        let mut created = 0;
        for spec in &specs[self.consumed..] {
            match submit_job(&mut store, spec, config) {
                Ok(_) => created += 1,
                Err(error) => {
                    eprintln!("[Corral] Rejecting job spec: {}", error);
                }
            }
            self.consumed += 1;
        }
        Ok(created)
    }
}
