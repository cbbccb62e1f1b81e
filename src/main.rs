use std::io::IsTerminal;

use clap::{Parser, Subcommand};
use s3gc::config::{Config, TableConfig};
use s3gc::runtime::RuntimeState;
use s3gc::verify::{LiveDbProbe, PostgresLiveDbProbe};
use tracing::info;

#[derive(Debug, Parser)]
#[command(version, about = "Reference-counted orphan garbage collector for S3-compatible buckets")]
struct Opt {
    /// Path to a JSON file mapping table name to the list of columns that
    /// hold S3 keys, e.g. {"uploads": ["s3_key"]}.
    #[arg(long, global = true)]
    tables: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a single garbage collection cycle.
    Run,
    /// Restore every unrestored deletion from a past operation.
    RestoreOperation {
        operation_id: String,
        #[arg(long)]
        apply: bool,
        #[arg(long, default_value_t = true)]
        skip_existing: bool,
    },
    /// Restore a single key's most recent deletion.
    RestoreKey {
        s3_key: String,
        #[arg(long)]
        apply: bool,
    },
    /// Print accumulated runtime metrics as JSON.
    Metrics,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    setup_tracing();
    let opt = Opt::parse();

    let tables = load_tables(opt.tables.as_deref())?;
    let config = Config::from_env(tables)?;
    let state = RuntimeState::initialize(&config).await?;

    let live_db: Option<Box<dyn LiveDbProbe>> = match &config.cdc_connection_url {
        Some(url) if config.verify_before_delete => {
            Some(Box::new(PostgresLiveDbProbe::connect(url, config.tables.clone()).await?))
        }
        _ => None,
    };
    let live_db_ref = live_db.as_deref();

    match opt.command {
        Command::Run => {
            let result = s3gc::orchestrator::run_cycle(&config, &state, live_db_ref).await?;
            info!(
                operation_id = %result.operation_id,
                deleted = result.deleted_count,
                backed_up = result.backed_up_count,
                "gc_cycle_result"
            );
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::RestoreOperation { operation_id, apply, skip_existing } => {
            let op_id = operation_id
                .parse::<ulid::Ulid>()
                .map_err(|e| format!("invalid operation id {operation_id}: {e}"))?;
            let result = s3gc::restore::restore_operation(&config, &state.vault, state.store.as_ref(), op_id, !apply, skip_existing).await?;
            if apply {
                state.record_restored(result.restored_count as u64);
            }
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::RestoreKey { s3_key, apply } => {
            let result = s3gc::restore::restore_key(&state.vault, state.store.as_ref(), &s3_key, !apply).await?;
            if apply {
                state.record_restored(result.restored_count as u64);
            }
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Metrics => {
            let metrics = state.metrics().await?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
    }

    Ok(())
}

fn load_tables(path: Option<&str>) -> Result<TableConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&content)?)
        }
        None => Err("--tables <path-to-json> is required: pass the table/column mapping explicitly".into()),
    }
}

fn setup_tracing() {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::from_default_env();
    let enable_color = std::io::stdout().is_terminal();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(env_filter)
        .with_ansi(enable_color)
        .init();
}
