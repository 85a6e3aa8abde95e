#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

mod cache;
mod config;
mod error;
mod indexer;
mod models;
mod snapshot;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{load_config, SkeinConfig, CONFIG_DIR, CONFIG_FILE, DEFAULT_CONFIG};
use indexer::parser::PythonParser;
use indexer::source::DiskReader;
use indexer::{scan_directory, start_watcher, IndexEvent, IndexState, IndexerService};
use models::ProcessState;
use snapshot::{roots_fingerprint, IndexSnapshot};

#[derive(Parser)]
#[command(name = "skein")]
#[command(about = "Incremental, memory-bounded Python code indexer", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level filter (e.g. debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Project directory (defaults to current working directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Index the project and print statistics
    Index,

    /// Print the symbol outline of a file
    Symbols {
        file: PathBuf,
    },

    /// Find where a name used in a file is defined
    Definition {
        file: PathBuf,
        name: String,
    },

    /// Find every use of the symbol a name in a file designates
    References {
        file: PathBuf,
        name: String,
        /// Leave out the definition itself
        #[arg(long)]
        exclude_declaration: bool,
    },

    /// Fuzzy search over all symbols
    Search {
        /// Search query
        query: String,
        /// Maximum number of results
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Print diagnostics for one file, or every file that has any
    Diagnostics {
        file: Option<PathBuf>,
    },

    /// Index, then keep the index current as files change
    Watch,

    /// Manage project configuration (.skein/config.toml)
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Create default config.toml in .skein/ directory
    Init,
    /// Show path to the config file
    Path,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let root = match cli.root {
        Some(root) => root.canonicalize()?,
        None => std::env::current_dir()?.canonicalize()?,
    };

    match cli.command {
        Commands::Config { action } => handle_config(&root, action),
        command => cli_runtime()?.block_on(run_command(root, command)),
    }
}

/// Logs go to stderr so command output stays parseable. JSON via SKEIN_LOG_JSON=1.
fn init_tracing(log_level: &str) {
    let json_logging = std::env::var("SKEIN_LOG_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("skein={}", log_level).into());

    if json_logging {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn cli_runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Runtime::new()?)
}

/// Cancel `token` on SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!("Failed to register signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received, stopping");
            }
            _ = sigint.recv() => {
                tracing::info!("SIGINT received, stopping");
            }
        }
        token.cancel();
    });
}

/// An opened project: config, restored state, and the service around it.
struct Project {
    root: PathBuf,
    config: SkeinConfig,
    service: IndexerService,
    cancel: CancellationToken,
    fingerprint: String,
}

impl Project {
    fn open(root: PathBuf) -> Self {
        let config = load_config(&root);
        let mut state = IndexState::new(&config, Arc::new(DiskReader), Box::new(PythonParser::new()));
        let fingerprint = roots_fingerprint(&config.workspace.roots, &config.workspace.external_roots);

        if let Some(path) = config.snapshot_path(&root) {
            match IndexSnapshot::load(&path, &fingerprint) {
                Ok(Some(snapshot)) => {
                    let restored = state.restore_snapshot(&snapshot);
                    tracing::info!("Restored {} library files from {:?}", restored, path);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Ignoring snapshot {:?}: {}", path, e),
            }
        }

        let cancel = CancellationToken::new();
        spawn_signal_handler(cancel.clone());
        Self {
            root,
            config,
            service: IndexerService::new(state, cancel.clone()),
            cancel,
            fingerprint,
        }
    }

    fn roots(&self) -> Vec<PathBuf> {
        self.config
            .workspace
            .roots
            .iter()
            .chain(&self.config.workspace.external_roots)
            .cloned()
            .collect()
    }

    fn files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for root in self.roots() {
            files.extend(scan_directory(&root, &self.config.workspace.ignore));
        }
        files
    }

    /// Build everything under the configured roots.
    async fn index(&self) -> anyhow::Result<ProcessState> {
        let files = self.files();
        tracing::info!("Indexing {} files", files.len());

        let (tx, rx) = mpsc::channel(1);
        tx.send(IndexEvent::Rescan(files)).await?;
        drop(tx);

        let state = self.service.run(rx).await;
        if state == ProcessState::Complete {
            self.save_snapshot().await;
        }
        Ok(state)
    }

    async fn save_snapshot(&self) {
        let Some(path) = self.config.snapshot_path(&self.root) else {
            return;
        };
        let snapshot = self
            .service
            .state()
            .lock()
            .await
            .capture_snapshot(self.fingerprint.clone());
        if let Err(e) = snapshot.save(&path) {
            tracing::warn!("Failed to save snapshot {:?}: {}", path, e);
        }
    }

    fn resolve(&self, file: &Path) -> PathBuf {
        let path = if file.is_relative() {
            self.root.join(file)
        } else {
            file.to_path_buf()
        };
        path.canonicalize().unwrap_or(path)
    }
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_command(root: PathBuf, command: Commands) -> anyhow::Result<()> {
    let project = Project::open(root);
    if project.index().await? == ProcessState::Interrupted {
        eprintln!("Indexing interrupted");
        return Ok(());
    }

    match command {
        Commands::Index => print_json(&project.service.stats().await),
        Commands::Symbols { file } => {
            let symbols = project.service.document_symbols(&project.resolve(&file)).await?;
            print_json(&symbols)
        }
        Commands::Definition { file, name } => {
            match project.service.definition(&project.resolve(&file), &name).await? {
                Some(target) => print_json(&target),
                None => {
                    eprintln!("No definition found for `{}`", name);
                    Ok(())
                }
            }
        }
        Commands::References {
            file,
            name,
            exclude_declaration,
        } => {
            let references = project
                .service
                .references(&project.resolve(&file), &name, !exclude_declaration)
                .await?;
            print_json(&references)
        }
        Commands::Search { query, limit } => {
            print_json(&project.service.workspace_symbols(&query, limit).await?)
        }
        Commands::Diagnostics { file: Some(file) } => {
            print_json(&project.service.diagnostics(&project.resolve(&file)).await)
        }
        Commands::Diagnostics { file: None } => {
            let files: Vec<_> = project
                .service
                .all_diagnostics()
                .await
                .into_iter()
                .map(|(path, diagnostics)| json!({ "path": path, "diagnostics": diagnostics }))
                .collect();
            print_json(&files)
        }
        Commands::Watch => handle_watch(&project).await,
        Commands::Config { action } => handle_config(&project.root, action),
    }
}

async fn handle_watch(project: &Project) -> anyhow::Result<()> {
    let stats = project.service.stats().await;
    println!("Indexed {} files ({} diagnostics), watching for changes", stats.files, stats.diagnostics);

    let (tx, rx) = mpsc::channel(256);
    let watcher = start_watcher(
        project.roots(),
        tx,
        project.config.workspace.ignore.clone(),
        project.cancel.clone(),
    );

    project.service.run(rx).await;
    project.cancel.cancel();
    if let Err(e) = watcher.await {
        tracing::warn!("File watcher task failed: {}", e);
    }
    project.save_snapshot().await;

    let stats = project.service.stats().await;
    println!("Stopped after {} build tasks", stats.processed);
    Ok(())
}

fn handle_config(root: &Path, action: Option<ConfigAction>) -> anyhow::Result<()> {
    let skein_dir = root.join(CONFIG_DIR);
    let config_path = skein_dir.join(CONFIG_FILE);

    match action {
        Some(ConfigAction::Path) => {
            println!("{}", config_path.display());
        }
        Some(ConfigAction::Init) => {
            std::fs::create_dir_all(&skein_dir)?;
            if config_path.exists() {
                eprintln!("Config already exists: {}", config_path.display());
                return Ok(());
            }
            std::fs::write(&config_path, DEFAULT_CONFIG)?;
            println!("Created: {}", config_path.display());
        }
        None => {
            // Show effective config
            let config = load_config(root);
            println!("# Effective config ({})\n", config_path.display());
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
