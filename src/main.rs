use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use seqkeep::contracts::MigrationError;
use seqkeep::reconcile::rekey::split_list;
use seqkeep::reconcile::{
    MigrationService, ReconcileConfig, RekeyConfig, RekeyRequest, SequencedCollection,
};
use seqkeep::storage::{RetryConfig, RocksDbStore};

#[derive(Parser, Debug)]
#[command(name = "seqkeep")]
#[command(about = "Sequence counters and data reconciliation for document collections")]
struct Cli {
    /// RocksDB data directory
    #[arg(short, long, default_value = "./data", env = "SEQKEEP_DATA_DIR")]
    data_dir: PathBuf,

    /// Write Prometheus text metrics here after the command finishes
    #[arg(long, env = "SEQKEEP_METRICS_PATH")]
    metrics_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the pre-flight reconciliation status of a collection
    Status {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Convert non-numeric sequence values and repair the counter
    Reconcile {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long, env = "SEQKEEP_PAGE_SIZE")]
        page_size: Option<usize>,
        #[arg(long, env = "SEQKEEP_SAMPLE_SIZE")]
        sample_size: Option<usize>,
    },
    /// Replace a tenant scope value across collections (dry run unless --confirm)
    Rekey {
        #[arg(long)]
        old: String,
        #[arg(long)]
        new: String,
        #[arg(long)]
        confirm: bool,
        /// Comma-separated collections; defaults to every collection
        #[arg(long)]
        collections: Option<String>,
        #[arg(long, env = "SEQKEEP_SCOPE_FIELD")]
        scope_field: Option<String>,
    },
    /// Allocate the next value of a counter
    Allocate {
        #[arg(long)]
        counter: String,
    },
    /// Print a counter's watermark without changing it
    Peek {
        #[arg(long)]
        counter: String,
    },
}

#[derive(clap::Args, Debug)]
struct TargetArgs {
    #[arg(short, long, default_value = "orders")]
    collection: String,
    /// Sequence field, dotted for nested fields
    #[arg(short, long, default_value = "order_number")]
    field: String,
    /// Counter key; defaults to the collection name
    #[arg(long)]
    counter: Option<String>,
}

impl TargetArgs {
    fn sequenced(&self) -> SequencedCollection {
        SequencedCollection::new(
            &self.collection,
            &self.field,
            self.counter.as_deref().unwrap_or(&self.collection),
        )
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("seqkeep=info".parse()?))
        .init();

    let cli = Cli::parse();

    let store = Arc::new(RocksDbStore::open_with_retry(
        &cli.data_dir,
        RetryConfig::from_env(),
    )?);

    let mut reconcile = ReconcileConfig::from_env();
    let mut rekey = RekeyConfig::from_env();
    match &cli.command {
        Command::Reconcile {
            page_size,
            sample_size,
            ..
        } => {
            if let Some(n) = page_size.filter(|&n| n > 0) {
                reconcile.page_size = n;
            }
            if let Some(n) = *sample_size {
                reconcile.sample_size = n;
            }
        }
        Command::Rekey {
            scope_field: Some(field),
            ..
        } => rekey.scope_field = field.clone(),
        _ => {}
    }

    let mut service = MigrationService::with_config(Arc::clone(&store), reconcile, rekey);
    match &cli.command {
        Command::Status { target } | Command::Reconcile { target, .. } => {
            service.register(target.collection.clone(), target.sequenced());
        }
        _ => {}
    }

    let cancel = service.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping at the next boundary");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let service = Arc::new(service);
    let runner = Arc::clone(&service);
    let command = cli.command;
    let output = tokio::task::spawn_blocking(move || execute(&runner, command)).await?;

    if let Some(path) = &cli.metrics_path {
        std::fs::write(path, service.metrics().format_prometheus())?;
        tracing::debug!(path = %path.display(), "Wrote metrics");
    }

    match output {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(MigrationError::Connection { reason, partial }) => {
            println!("{}", serde_json::to_string_pretty(&partial)?);
            Err(format!("run incomplete: {}", reason).into())
        }
        Err(e) => Err(e.into()),
    }
}

fn execute(
    service: &MigrationService<RocksDbStore>,
    command: Command,
) -> Result<serde_json::Value, MigrationError> {
    let value = match command {
        Command::Status { target } => {
            serde_json::to_value(service.reconciliation_status(&target.collection)?)
        }
        Command::Reconcile { target, .. } => {
            serde_json::to_value(service.run_type_reconciliation(&target.collection)?)
        }
        Command::Rekey {
            old,
            new,
            confirm,
            collections,
            ..
        } => {
            let mut request = RekeyRequest::new(old, new, confirm);
            if let Some(list) = collections {
                request = request.with_collections(split_list(&list));
            }
            serde_json::to_value(service.run_rekey_request(&request)?)
        }
        Command::Allocate { counter } => {
            let value = service.allocate(&counter)?;
            Ok(serde_json::json!({ "counter": counter, "value": value }))
        }
        Command::Peek { counter } => {
            let watermark = service.peek(&counter)?;
            Ok(serde_json::json!({ "counter": counter, "watermark": watermark }))
        }
    };
    value.map_err(|e| MigrationError::InvalidRequest(format!("cannot render output: {}", e)))
}
