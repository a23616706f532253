use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vellum::backend::registry::{BackendSettings, Registry};
use vellum::config::VellumConfig;
use vellum::gateway;
use vellum::sync::notification::SyncHub;

const DEFAULT_LOG_FILTER: &str = "vellum=info";

#[derive(Parser)]
#[command(
    name = "vellum",
    version,
    author = "Sami Barbut-Dica",
    about = "Host bare repositories over smart HTTP",
    long_about = "Creates bare repositories and serves them to git clients over smart HTTP. \
    Pushes are mirrored back to the registered record observers.",
    help_template = r"
{name} {version} - {about}

USAGE:
    {usage}

OPTIONS:
    {all-args}
",
)]
struct Cli {
    #[arg(short, long, global = true, help = "Path to a TOML configuration file")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(
        name = "init",
        about = "Create a bare repository",
        long_about = "This command creates a bare repository at the specified path, \
        with HEAD pointing at the configured default branch."
    )]
    Init {
        #[arg(index = 1, help = "The path to the repository")]
        path: PathBuf,
        #[arg(long, help = "The storage flavor of the repository")]
        flavor: Option<String>,
    },
    #[command(
        name = "serve",
        about = "Serve the repositories below the configured root",
        long_about = "This command runs the smart-HTTP gateway until the process is stopped."
    )]
    Serve {
        #[arg(short, long, help = "Address to listen on, overriding the configuration")]
        bind: Option<String>,
        #[arg(short, long, help = "Directory holding the repositories, overriding the configuration")]
        root: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<VellumConfig> {
    match path {
        Some(path) => VellumConfig::load(path),
        None => Ok(VellumConfig::default()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Init { path, flavor } => {
            let flavor = flavor.unwrap_or_else(|| config.repository.flavor.clone());
            let registry = Registry::with_defaults(BackendSettings::from(&config));
            let backend = registry.open(&flavor, &path)?;
            if backend.repo_exists() {
                anyhow::bail!("{} already holds a repository", path.display());
            }

            backend.init_repo()?;
            println!("Initialized empty repository in {}", path.display());
        }
        Commands::Serve { bind, root } => {
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
            }
            if let Some(root) = root {
                config.repository.root = root;
            }

            let runtime = tokio::runtime::Runtime::new().context("failed to start the runtime")?;
            runtime.block_on(gateway::serve(&config, Arc::new(SyncHub::new())))?;
        }
    }

    Ok(())
}
