use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use masterdata_core::cleanup::{self, CleanupReport};
use masterdata_core::session::SessionVault;
use masterdata_core::{
    Catalog, CategoryStore, FileKvStore, HealthIssue, HealthMonitor, HealthRun, MigrationEngine,
    ModeResolver, PortalConfig, StorageMode,
};
use masterdata_store_sqlite::SqliteCanonicalStore;
use serde::Serialize;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "mdctl.v1";

#[derive(Debug, Parser)]
#[command(name = "mdctl")]
#[command(about = "Master-data consistency diagnostics")]
struct Cli {
    /// Key-value storage file
    #[arg(long, default_value = "./portal-storage.json")]
    store: PathBuf,

    /// SQLite canonical store; required by `migrate`
    #[arg(long)]
    canonical: Option<PathBuf>,

    /// YAML or JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Mode {
        #[command(subcommand)]
        command: ModeCommand,
    },
    Category {
        #[command(subcommand)]
        command: CategoryCommand,
    },
    Health(HealthArgs),
    Migrate(MigrateArgs),
    Cleanup(CleanupArgs),
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ModeCommand {
    Show,
    CustomOnly,
    Reset,
}

#[derive(Debug, Subcommand)]
enum CategoryCommand {
    List,
    Load { name: String },
}

#[derive(Debug, Args)]
struct HealthArgs {
    #[arg(long, default_value_t = false)]
    quick: bool,
}

#[derive(Debug, Args)]
struct MigrateArgs {
    /// Clear the completion flag and migrate again
    #[arg(long, default_value_t = false)]
    force: bool,
}

#[derive(Debug, Args)]
struct CleanupArgs {
    #[arg(value_enum)]
    target: CleanupTarget,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CleanupTarget {
    Stale,
    Custom,
    All,
    Reset,
}

impl CleanupTarget {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stale => "stale",
            Self::Custom => "custom",
            Self::All => "all",
            Self::Reset => "reset",
        }
    }
}

#[derive(Debug, Subcommand)]
enum SessionCommand {
    Status,
}

#[derive(Debug, Serialize)]
struct CategoryOutput {
    category: String,
    mode: StorageMode,
    source: &'static str,
    items: Vec<Value>,
    issues: Vec<HealthIssue>,
}

struct Workspace {
    kv: Arc<FileKvStore>,
    config: PortalConfig,
    catalog: Arc<Catalog>,
    canonical: Option<Arc<SqliteCanonicalStore>>,
}

impl Workspace {
    fn open(cli: &Cli) -> Result<Self> {
        let config = match &cli.config {
            Some(path) => PortalConfig::load(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => PortalConfig::default(),
        };
        let kv = FileKvStore::open(&cli.store)
            .with_context(|| format!("failed to open storage file {}", cli.store.display()))?;
        let catalog = Arc::new(Catalog::builtin());
        tracing::debug!(store = %cli.store.display(), "opened key-value store");

        let canonical = match &cli.canonical {
            Some(path) => {
                let store = SqliteCanonicalStore::open(path).with_context(|| {
                    format!("failed to open canonical store at {}", path.display())
                })?;
                store
                    .ensure_tables(&catalog.names())
                    .context("failed to register canonical tables")?;
                Some(Arc::new(store))
            }
            None => None,
        };

        Ok(Self {
            kv: Arc::new(kv),
            config,
            catalog,
            canonical,
        })
    }

    fn mode(&self) -> ModeResolver {
        ModeResolver::new(self.kv.clone(), &self.config.keys)
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let workspace = Workspace::open(&cli)?;
    match cli.command {
        Command::Mode { command } => run_mode(&command, &workspace),
        Command::Category { command } => run_category(command, &workspace).await,
        Command::Health(args) => run_health(&args, &workspace).await,
        Command::Migrate(args) => run_migrate(&args, &workspace).await,
        Command::Cleanup(args) => run_cleanup(args.target, &workspace),
        Command::Session { command } => run_session(&command, &workspace),
    }
}

fn run_mode(command: &ModeCommand, ws: &Workspace) -> Result<()> {
    let mode = ws.mode();
    match command {
        ModeCommand::Show => emit_json(json!({
            "mode": mode.mode(),
            "flag_is_sane": mode.flag_is_sane()
        })),
        ModeCommand::CustomOnly => {
            let changed = mode.set_custom_only()?;
            emit_json(json!({ "mode": mode.mode(), "changed": changed }))
        }
        ModeCommand::Reset => {
            mode.reset_to_defaults()?;
            emit_json(json!({ "mode": mode.mode() }))
        }
    }
}

async fn run_category(command: CategoryCommand, ws: &Workspace) -> Result<()> {
    match command {
        CategoryCommand::List => {
            let categories: Vec<Value> = ws
                .catalog
                .iter()
                .map(|def| {
                    json!({
                        "name": def.name,
                        "table": def.table,
                        "shape": def.shape,
                        "fallback": def.fallback,
                        "default_count": def.defaults.len(),
                        "aliases": def.aliases
                    })
                })
                .collect();
            emit_json(json!({ "categories": categories }))
        }
        CategoryCommand::Load { name } => {
            let store = CategoryStore::new(
                ws.kv.clone(),
                ws.catalog.clone(),
                ws.config.keys.clone(),
            );
            let (healed, source) = match &ws.canonical {
                Some(canonical) => (
                    store.load_canonical(&name, canonical.as_ref()).await?,
                    "canonical",
                ),
                None => (store.load(&name)?, "local"),
            };
            let output = CategoryOutput {
                category: name,
                mode: store.mode().mode(),
                source,
                items: healed.value,
                issues: healed.issues,
            };
            emit_json(serde_json::to_value(&output)?)
        }
    }
}

async fn run_health(args: &HealthArgs, ws: &Workspace) -> Result<()> {
    let mut monitor = HealthMonitor::new(
        ws.kv.clone(),
        ws.catalog.clone(),
        ws.config.keys.clone(),
    );
    if let Some(canonical) = &ws.canonical {
        monitor = monitor.with_remote(canonical.clone());
    }

    if args.quick {
        return emit_json(json!({ "healthy": monitor.quick_health_check() }));
    }
    match monitor.run_health_check().await {
        HealthRun::Completed(result) => emit_json(serde_json::to_value(result.as_ref())?),
        HealthRun::AlreadyRunning => emit_json(json!({ "already_running": true })),
    }
}

async fn run_migrate(args: &MigrateArgs, ws: &Workspace) -> Result<()> {
    let canonical = ws
        .canonical
        .clone()
        .ok_or_else(|| anyhow!("migrate requires --canonical <path>"))?;
    let engine = MigrationEngine::new(
        ws.kv.clone(),
        canonical,
        ws.catalog.clone(),
        ws.config.keys.clone(),
    );
    let report = if args.force {
        engine.run_manual().await?
    } else {
        engine.migrate_all_master_data().await
    };
    emit_json(serde_json::to_value(&report)?)
}

fn run_cleanup(target: CleanupTarget, ws: &Workspace) -> Result<()> {
    let kv = ws.kv.as_ref();
    let keys = &ws.config.keys;
    let report: CleanupReport = match target {
        CleanupTarget::Stale => cleanup::remove_stale_keys(kv, keys, &ws.catalog)?,
        CleanupTarget::Custom => cleanup::clear_custom_data(kv, keys)?,
        CleanupTarget::All => cleanup::clear_master_data(kv, keys)?,
        CleanupTarget::Reset => cleanup::reset_to_defaults(kv, &ws.mode(), &ws.catalog, keys)?,
    };
    emit_json(json!({ "target": target.as_str(), "report": report }))
}

fn run_session(command: &SessionCommand, ws: &Workspace) -> Result<()> {
    match command {
        SessionCommand::Status => {
            let vault = SessionVault::new(ws.kv.clone(), &ws.config.keys, ws.config.session.clone());
            emit_json(serde_json::to_value(vault.health_status())?)
        }
    }
}
