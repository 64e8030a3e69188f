//! `dashstore-serve`: mount datafiles and serve them to replication clients.
//!
//! Log verbosity comes from `DASHSTORE_LOG` (default `info`).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueEnum};

use dashstore_core::{Config, DataRepository};
use dashstore_remote::{RepositoryServer, ServerConfig, DEFAULT_PORT};

/// Serve a dashstore repository over TCP.
#[derive(Parser)]
#[command(name = "dashstore-serve", about = "Serve a dashstore repository over TCP")]
struct Cli {
    /// Address to listen on.
    #[arg(short, long, default_value_t = format!("127.0.0.1:{}", DEFAULT_PORT))]
    bind: String,

    /// Datafile to mount, as PREFIX=PATH. Repeatable.
    #[arg(short, long = "datafile", value_parser = parse_datafile)]
    datafiles: Vec<(String, PathBuf)>,

    /// Directory searched for #include templates. Repeatable.
    #[arg(short, long = "template-dir")]
    template_dirs: Vec<PathBuf>,

    /// Read-only global definitions file.
    #[arg(short, long)]
    global: Option<PathBuf>,

    /// Setting sent to clients, as KEY=VALUE. Repeatable.
    #[arg(short, long = "setting", value_parser = parse_setting)]
    settings: Vec<(String, String)>,

    /// Configuration preset.
    #[arg(long, value_enum, default_value = "dashboard")]
    preset: Preset,
}

#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    Dashboard,
    Headless,
}

fn parse_setting(text: &str) -> Result<(String, String), String> {
    match text.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", text)),
    }
}

fn parse_datafile(text: &str) -> Result<(String, PathBuf), String> {
    let (prefix, path) = parse_setting(text)?;
    Ok((prefix, PathBuf::from(path)))
}

fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("DASHSTORE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer().with_target(false)).init();
}

fn main() {
    init_logging();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match cli.preset {
        Preset::Dashboard => Config::dashboard(),
        Preset::Headless => Config::headless(),
    };
    for dir in cli.template_dirs {
        config = config.with_template_dir(dir);
    }

    let repo = DataRepository::new(config)?;
    if let Some(global) = &cli.global {
        repo.add_global_definitions(global)?;
    }
    for (prefix, path) in &cli.datafiles {
        repo.open_datafile(prefix, path)?;
        if let Some(id) = repo.get_id(prefix) {
            tracing::info!("{} is available as ID {}", prefix, id);
        }
    }
    repo.start_workers()?;

    let settings: BTreeMap<String, String> = cli.settings.into_iter().collect();
    let server = RepositoryServer::start(repo.clone(), ServerConfig { bind_addr: cli.bind, settings })?;
    server.wait();
    repo.shutdown();
    Ok(())
}
