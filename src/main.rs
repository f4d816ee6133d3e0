use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use corral::config::{Config, Mode, SchedulerConfig};
use corral::dispatcher::Dispatcher;
use corral::error::CorralError;
use corral::host::get_hosts;
use corral::job::{validate_queue_file, JobQueue};
use corral::probe::CommandProber;
use corral::session::{Session, SshSession};
use corral::store::{shared, Datastore};

async fn run_scheduler(cli: &Config) -> Result<(), CorralError> {
    let config = SchedulerConfig::from_cli(cli);

    let mut store = Datastore::new();
    store.add_user(&config.system_user);
    store.ensure_label(&config.default_pool);
    for def in get_hosts(&cli.hosts_file) {
        store.enroll_host(&def);
    }
    let store = shared(store);

    let session: Arc<dyn Session + Send + Sync> = Arc::new(SshSession);
    let prober = Arc::new(CommandProber::new(
        Arc::clone(&session),
        config.probe_timeout,
    ));
    let mut dispatcher = Dispatcher::new(store.clone(), config.clone(), session, prober);
    dispatcher.initialize();

    let mut queue = JobQueue::new(&cli.queue_file);
    let mut interval = tokio::time::interval(Duration::from_secs(cli.tick_interval));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("[Corral] Ctrl-c detected. Waiting for in-flight work.");
                break;
            }
            _ = interval.tick() => {
                match queue.poll(&store, &config) {
                    Ok(submitted) if submitted > 0 => {
                        eprintln!("[Corral] Submitted {} new queue entries.", submitted);
                    }
                    Ok(_) => {}
                    Err(error) => {
                        // Producers fix the file in place; keep ticking.
                        eprintln!("[Corral] {}", error);
                    }
                }
                dispatcher.tick().await;
                if !cli.daemon && dispatcher.is_idle() {
                    eprintln!("[Corral] Queue drained, breaking out of scheduler loop.");
                    break;
                }
            }
        }
    }

    dispatcher.drain().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), CorralError> {
    let cli = Config::parse();

    match cli.mode {
        Mode::Run => {
            eprintln!("[Corral] Starting scheduler.");
            run_scheduler(&cli).await?;
        }
        Mode::Check => match validate_queue_file(&cli.queue_file) {
            Ok(count) => eprintln!("[Corral] {} parses: {} jobs.", cli.queue_file, count),
            Err(error) => {
                eprintln!("[Corral] {} is invalid: {}", cli.queue_file, error);
                std::process::exit(1);
            }
        },
    };

    Ok(())
}
