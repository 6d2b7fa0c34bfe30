use anyhow::{Context as _, Result, anyhow};
use chrono::Utc;
use clap::{Parser, Subcommand};
use skisync::config::{LoadedConfig, Secrets, load_config};
use skisync::harness::{HarnessOptions, run_harness};
use skisync::model::PassReport;
use skisync::pipeline::{
    JobKind, build_services, build_store, check_remote_schemas, dump_database,
    prepare_memory_store, run_pass,
};
use skisync::scheduler::{CancelToken, install_interrupt_handler, run_forever};
use skisync::store::{MemoryStore, RowStore};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "skisync", about = "Ski resort conditions scraper and table sync")]
struct Cli {
    #[arg(long, default_value = "configs/whistler.toml")]
    config: PathBuf,

    /// Write to a local JSON snapshot instead of the remote store.
    #[arg(long)]
    memory_store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every job once and exit.
    Once {
        #[arg(long, value_enum)]
        job: Option<JobKind>,
    },
    /// Run passes forever, sleeping until the next announced update.
    Run {
        #[arg(long, value_enum)]
        job: Option<JobKind>,
    },
    Validate {
        /// Also check destination schemas.
        #[arg(long, default_value_t = false)]
        remote: bool,
    },
    Schema {
        database: String,
    },
    Dump {
        database: String,
    },
    Harness {
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Once { job } => {
            let loaded = load_config(&cli.config)?;
            let report = sync_once(&loaded, cli.memory_store.as_deref(), job)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Run { job } => {
            let loaded = load_config(&cli.config)?;
            let cancel = CancelToken::default();
            install_interrupt_handler(&cancel)?;
            let default = loaded.config.default_delay();
            let memory_store = cli.memory_store.as_deref();
            run_forever(|| sync_once(&loaded, memory_store, job), default, &cancel);
        }
        Commands::Validate { remote } => {
            let loaded = load_config(&cli.config)?;
            println!("ok: {}", loaded.path.display());
            if remote {
                let store = open_store(&loaded, cli.memory_store.as_deref())?;
                for line in check_remote_schemas(store.as_ref(), &loaded.config)? {
                    println!("{line}");
                }
            }
        }
        Commands::Schema { database } => {
            let loaded = load_config(&cli.config)?;
            let store = open_store(&loaded, cli.memory_store.as_deref())?;
            let id = database_id(&loaded, &database)?;
            let schema = store
                .schema(&id)
                .with_context(|| format!("failed to read schema of {database}"))?;
            println!("{}", schema.title.as_deref().unwrap_or(&database));
            for (name, kind) in &schema.columns {
                println!("  {name}: {kind}");
            }
        }
        Commands::Dump { database } => {
            let loaded = load_config(&cli.config)?;
            let store = open_store(&loaded, cli.memory_store.as_deref())?;
            let id = database_id(&loaded, &database)?;
            for row in dump_database(store.as_ref(), &id)? {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
        Commands::Harness { snapshot } => {
            let report = run_harness(&HarnessOptions {
                config_path: cli.config,
                snapshot_path: snapshot,
                now: None,
            })?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

/// Accepts a configured database name or a raw id.
fn database_id(loaded: &LoadedConfig, database: &str) -> Result<String> {
    if let Some(id) = loaded.config.databases.by_name(database) {
        return Ok(id.to_string());
    }
    if database.chars().any(|c| c.is_ascii_digit()) {
        return Ok(database.to_string());
    }
    Err(anyhow!("unknown database `{database}`"))
}

fn open_memory_store(loaded: &LoadedConfig, path: &Path) -> Result<Rc<MemoryStore>> {
    let store = MemoryStore::load_snapshot(path)?;
    prepare_memory_store(&store, &loaded.config);
    Ok(Rc::new(store))
}

fn open_store(loaded: &LoadedConfig, memory_store: Option<&Path>) -> Result<Box<dyn RowStore>> {
    match memory_store {
        Some(path) => Ok(Box::new(open_memory_store(loaded, path)?)),
        None => build_store(&loaded.config, &Secrets::from_env(&loaded.config)),
    }
}

fn sync_once(
    loaded: &LoadedConfig,
    memory_store: Option<&Path>,
    job: Option<JobKind>,
) -> Result<PassReport> {
    let secrets = Secrets::from_env(&loaded.config);
    let memory = memory_store
        .map(|path| open_memory_store(loaded, path))
        .transpose()?;
    let store_override = memory
        .clone()
        .map(|store| Box::new(store) as Box<dyn RowStore>);
    let services = build_services(loaded, &secrets, store_override)?;

    let report = run_pass(&services.context(loaded, Utc::now()), job);

    if let (Some(store), Some(path)) = (memory, memory_store) {
        store.save_snapshot(path)?;
    }
    info!(
        jobs = report.jobs.len(),
        inserted = report.total_inserted(),
        "sync finished"
    );
    Ok(report)
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}
