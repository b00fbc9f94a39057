use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use packmule_core::{
    Config, InProcessQueue, JsonBackend, Orchestrator, RequestBackend, WorkItem, WorkQueue,
    WorkerPool,
};
use packmule_domain::{RequestRecord, RequestState};
use packmule_resolver::ResolverRegistry;
use serde_json::json;

#[derive(Parser)]
#[command(name = "packmule", version, about = "Dependency resolution and bundling service")]
struct PackmuleCli {
    /// Directory holding request records.
    #[arg(long, env = "PACKMULE_DATA_DIR", default_value = "/var/lib/packmule/requests", global = true)]
    data_dir: PathBuf,

    /// Emit machine-readable JSON instead of human output.
    #[arg(long, global = true)]
    json: bool,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a request and process it to a terminal state.
    Process {
        /// Git repository URL (or local path).
        #[arg(long)]
        repo: String,
        /// Branch, tag, or full commit SHA to bundle.
        #[arg(long = "ref")]
        reference: String,
        /// Package manager to resolve with; repeatable.
        #[arg(long = "pkg-manager", default_values_t = vec!["gomod".to_string()])]
        pkg_managers: Vec<String>,
    },
    /// Drain every pending request with the configured worker pool.
    Worker,
    /// Show one request.
    Status { id: u64 },
    /// List all requests and their states.
    List,
    /// Ask a running or pending request to stop.
    Cancel { id: u64 },
    /// Re-enqueue a request under a new attempt.
    Retry { id: u64 },
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = PackmuleCli::parse();
    init_tracing(cli.verbose);

    let code = run(&cli)?;
    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = format!("packmule={level},packmule_core={level},packmule_resolver={level},packmule_store={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn run(cli: &PackmuleCli) -> Result<i32> {
    let backend = Arc::new(
        JsonBackend::open(&cli.data_dir).map_err(|err| eyre!("{err:#}"))?,
    );
    match &cli.command {
        Command::Process {
            repo,
            reference,
            pkg_managers,
        } => process(cli, &backend, repo, reference, pkg_managers.clone()),
        Command::Worker => worker(cli, &backend),
        Command::Status { id } => status(cli, &backend, *id),
        Command::List => list(cli, &backend),
        Command::Cancel { id } => {
            backend.request_cancel(*id).map_err(|err| eyre!("{err:#}"))?;
            emit(cli, &json!({"id": id, "cancel_requested": true}), || {
                format!("request {id}: cancellation requested")
            });
            Ok(0)
        }
        Command::Retry { id } => {
            let attempt = backend.reset_for_retry(*id).map_err(|err| eyre!("{err:#}"))?;
            emit(cli, &json!({"id": id, "attempt": attempt, "state": "pending"}), || {
                format!("request {id}: re-enqueued as attempt {attempt}")
            });
            Ok(0)
        }
    }
}

fn open_orchestrator(backend: &Arc<JsonBackend>) -> Result<(Config, Arc<Orchestrator>)> {
    let config = Config::from_env().map_err(|err| eyre!("{err:#}"))?;
    config.ensure_dirs().map_err(|err| eyre!("{err:#}"))?;
    let registry = ResolverRegistry::with_defaults();
    let orchestrator = Orchestrator::new(
        config.clone(),
        registry,
        Arc::clone(backend) as Arc<dyn RequestBackend>,
    )
    .map_err(|err| eyre!("{err:#}"))?;
    Ok((config, Arc::new(orchestrator)))
}

fn process(
    cli: &PackmuleCli,
    backend: &Arc<JsonBackend>,
    repo: &str,
    reference: &str,
    pkg_managers: Vec<String>,
) -> Result<i32> {
    let (_, orchestrator) = open_orchestrator(backend)?;
    let record = RequestRecord::new(
        backend.next_id().map_err(|err| eyre!("{err:#}"))?,
        repo,
        reference,
        pkg_managers,
    )
    .map_err(|err| eyre!("{err}"))?;
    backend.create(&record).map_err(|err| eyre!("{err:#}"))?;

    let queue: Arc<InProcessQueue> = Arc::new(InProcessQueue::new());
    queue
        .push(WorkItem {
            request_id: record.id,
            attempt: record.attempt,
        })
        .map_err(|err| eyre!("{err:#}"))?;
    queue.close();
    WorkerPool::start(orchestrator, queue, 1)
        .map_err(|err| eyre!("{err:#}"))?
        .shutdown();

    let settled = backend.load(record.id).map_err(|err| eyre!("{err:#}"))?;
    emit(cli, &settled.to_json(), || summarize(&settled));
    Ok(exit_code(settled.state))
}

fn worker(cli: &PackmuleCli, backend: &Arc<JsonBackend>) -> Result<i32> {
    let (config, orchestrator) = open_orchestrator(backend)?;

    let queue: Arc<InProcessQueue> = Arc::new(InProcessQueue::new());
    let mut queued = 0usize;
    for id in backend.list_ids().map_err(|err| eyre!("{err:#}"))? {
        let record = backend.load(id).map_err(|err| eyre!("{err:#}"))?;
        if record.state == RequestState::Pending {
            queue
                .push(WorkItem {
                    request_id: record.id,
                    attempt: record.attempt,
                })
                .map_err(|err| eyre!("{err:#}"))?;
            queued += 1;
        }
    }
    queue.close();
    WorkerPool::start(orchestrator, queue, config.workers)
        .map_err(|err| eyre!("{err:#}"))?
        .shutdown();

    emit(cli, &json!({"processed": queued}), || {
        format!("processed {queued} pending request(s)")
    });
    Ok(0)
}

fn status(cli: &PackmuleCli, backend: &Arc<JsonBackend>, id: u64) -> Result<i32> {
    let record = backend.load(id).map_err(|err| eyre!("{err:#}"))?;
    emit(cli, &record.to_json(), || summarize(&record));
    Ok(0)
}

fn list(cli: &PackmuleCli, backend: &Arc<JsonBackend>) -> Result<i32> {
    let mut rows = Vec::new();
    for id in backend.list_ids().map_err(|err| eyre!("{err:#}"))? {
        let record = backend.load(id).map_err(|err| eyre!("{err:#}"))?;
        rows.push(record);
    }
    if cli.json {
        let view: Vec<_> = rows.iter().map(RequestRecord::to_json).collect();
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else if rows.is_empty() {
        println!("no requests");
    } else {
        for record in &rows {
            println!(
                "{:>6}  {:<12} {} @ {}",
                record.id,
                record.state.as_str(),
                record.repo,
                record.reference
            );
        }
    }
    Ok(0)
}

fn emit(cli: &PackmuleCli, view: &serde_json::Value, human: impl FnOnce() -> String) {
    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(view).unwrap_or_else(|_| view.to_string())
        );
    } else {
        println!("{}", human());
    }
}

fn summarize(record: &RequestRecord) -> String {
    let mut lines = vec![
        format!("request {}: {}", record.id, record.state.as_str()),
        format!("  repo: {} @ {}", record.repo, record.reference),
    ];
    if let Some(pinned) = &record.pinned_revision {
        lines.push(format!("  pinned: {pinned}"));
    }
    if !record.dependencies.is_empty() {
        lines.push(format!("  dependencies: {}", record.dependencies.len()));
    }
    if let Some(bundle) = &record.bundle {
        lines.push(format!(
            "  bundle: {} ({} bytes, sha256:{})",
            bundle.path.display(),
            bundle.size,
            bundle.checksum
        ));
    }
    if let Some(error) = &record.error {
        lines.push(format!("  error ({}): {}", error.kind().as_str(), error.message()));
    }
    lines.join("\n")
}

fn exit_code(state: RequestState) -> i32 {
    match state {
        RequestState::Complete => 0,
        RequestState::Failed => 1,
        _ => 2,
    }
}
