/// Main entry point of the `mcp` command
///
/// `mcp serve` runs the broker as an MCP server on stdin/stdout. The other
/// subcommands manage the local integration catalog and query the registry.
/// Logs always go to stderr; stdout belongs to the protocol stream.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mcp_broker::config::default_database_path;
use mcp_broker::registry::split_package_ref;
use mcp_broker::{
    BrokerConfig, BundledRegistry, ContainerServerRunner, IntegrationsRepository, LocalBroker, RegistryClient,
    RunnerConfig, ServerRunner, SqliteIntegrationsRepository,
};

/// Command line arguments of the `mcp` command
#[derive(Parser, Debug)]
#[command(author, version, about = "Manage and serve MCP servers through a single broker", long_about = None)]
struct Cli {
    /// Path to the SQLite catalog database
    /// If not provided, uses a default location in the user's home directory
    #[arg(long, global = true, env = "MCP_DATABASE")]
    database: Option<PathBuf>,

    /// Log level ("trace", "debug", "info", "warn" or "error")
    #[arg(long, global = true, env = "MCP_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve an MCP session on stdin/stdout
    Serve(ServeArgs),

    /// Manage installed packages
    #[command(subcommand)]
    Package(PackageCommand),

    /// Query the package registry
    #[command(subcommand)]
    Registry(RegistryCommand),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Seconds an integration may take to start
    #[arg(long, default_value_t = 30)]
    start_timeout: u64,

    /// Memory ceiling of each server container, in MB
    #[arg(long, default_value_t = 64)]
    memory_limit: u64,

    /// DNS resolver for server containers (repeatable)
    #[arg(long)]
    dns: Vec<String>,

    /// Path of the docker CLI
    #[arg(long, default_value = "docker")]
    docker: PathBuf,
}

#[derive(Subcommand, Debug)]
enum PackageCommand {
    /// Install a package from the registry
    #[command(alias = "i")]
    Install {
        /// Package reference, `name` or `name@version`
        package: String,

        /// Environment value for the server (repeatable)
        #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
    },

    /// List installed packages
    #[command(alias = "ls")]
    List,

    /// Uninstall a package by integration id
    #[command(alias = "rm")]
    Uninstall { id: String },
}

#[derive(Subcommand, Debug)]
enum RegistryCommand {
    /// Search the registry
    Search { terms: Vec<String> },
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", raw)),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("mcp_broker={0},mcp={0}", level)))
        .unwrap_or_else(|_| EnvFilter::new("mcp_broker=info,mcp=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Resolve the catalog path, creating its parent directory when needed
fn database_path(database: Option<PathBuf>) -> Result<PathBuf, Box<dyn std::error::Error>> {
    match database {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            Ok(path)
        }
        None => Ok(default_database_path()?),
    }
}

/// Cancel `root` on interrupt or termination
fn spawn_signal_handler(root: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("interrupted");
        root.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn serve(db_path: PathBuf, args: ServeArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let root = CancellationToken::new();
    spawn_signal_handler(root.clone());

    let repository = Arc::new(SqliteIntegrationsRepository::open(&db_path)?);

    let mut runner_config = RunnerConfig {
        docker_binary: args.docker,
        default_memory_limit_mb: args.memory_limit,
        ..Default::default()
    };
    if !args.dns.is_empty() {
        runner_config.dns = args.dns;
    }
    let runner = Arc::new(ContainerServerRunner::connect(runner_config).await?);
    let registry = Arc::new(BundledRegistry::new()?);

    let config = BrokerConfig {
        start_timeout: Duration::from_secs(args.start_timeout),
        ..Default::default()
    };
    let broker = LocalBroker::new(&root, config, repository, runner.clone(), registry);

    info!("serving MCP on stdio");
    let result = broker.serve(tokio::io::stdin(), tokio::io::stdout()).await;

    if let Err(e) = runner.close().await {
        warn!(error = %e, "failed to close container runner");
    }

    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) if e.is_connection_closed() => Ok(ExitCode::SUCCESS),
        Err(e) => Err(e.into()),
    }
}

async fn package(db_path: PathBuf, command: PackageCommand) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let repository = SqliteIntegrationsRepository::open(&db_path)?;

    match command {
        PackageCommand::Install { package, env } => {
            let registry = BundledRegistry::new()?;
            let (name, version) = split_package_ref(&package);
            let manifest = registry.manifest(name, version).await?;

            let env: BTreeMap<String, String> = env.into_iter().collect();
            let installed = repository.install(manifest, env).await?;
            for name in installed.missing_env() {
                eprintln!("warning: {} has no value; pass it with -e {}=...", name, name);
            }
            println!(
                "installed {}@{} as {}",
                installed.manifest.name, installed.manifest.version, installed.id
            );
        }
        PackageCommand::List => {
            for integration in repository.list().await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    integration.id,
                    integration.manifest.name,
                    integration.manifest.version,
                    integration.installed_at.to_rfc3339()
                );
            }
        }
        PackageCommand::Uninstall { id } => {
            let removed = repository.uninstall(&id).await?;
            println!("uninstalled {}@{}", removed.manifest.name, removed.manifest.version);
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn registry(command: RegistryCommand) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let registry = BundledRegistry::new()?;

    match command {
        RegistryCommand::Search { terms } => {
            for hit in registry.search(&terms).await? {
                println!("{}\t{}\t{}", hit.name, hit.version, hit.description);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Time blocking tasks get to finish once a command is done
///
/// The stdin reader sits in a read that cannot be interrupted, so waiting for
/// it would keep the process alive until the client closes stdin.
const RUNTIME_SHUTDOWN: Duration = Duration::from_millis(500);

async fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match cli.command {
        Command::Serve(args) => {
            let db_path = database_path(cli.database)?;
            info!("Using database at: {}", db_path.display());
            serve(db_path, args).await
        }
        Command::Package(command) => package(database_path(cli.database)?, command).await,
        Command::Registry(command) => registry(command).await,
    }
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let result = runtime.block_on(run(cli));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN);
    result
}
