mod config;
mod device;
mod monitor;
mod notify;
mod sink;
#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use config::Config;
use device::{DeviceRegistry, EvdevBackend};
use monitor::Monitor;
use sink::WriterSink;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "inputmon")]
#[command(about = "Streams raw events from every Linux input device, following hot-plug")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Config file (default: ~/.config/inputmon/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor all devices until killed (default)
    Run,
    /// List candidate devices and their names, then exit
    List,
    /// Write a default config file
    InitConfig,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
    };

    // stdout carries the event stream, so diagnostics go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let config = Config::load(cli.config.as_deref())?;
            run(&config)
        }
        Commands::List => {
            let config = Config::load(cli.config.as_deref())?;
            list(&config)
        }
        Commands::InitConfig => init_config(cli.config.as_deref()),
    }
}

fn run(config: &Config) -> anyhow::Result<()> {
    tracing::info!("Starting inputmon");
    let sink = WriterSink::stdout(config.output.format);
    let mut monitor = Monitor::start(&config.monitor, EvdevBackend, sink);
    monitor.run()
}

fn list(config: &Config) -> anyhow::Result<()> {
    let mut registry = DeviceRegistry::from_config(&config.monitor, EvdevBackend);
    for entry in registry.candidates()? {
        let path = registry.dir().join(&entry);
        match registry.probe(&entry) {
            Ok(name) => println!("{}\t{}", path.display(), name),
            Err(e) => println!("{}\t<{}>", path.display(), e),
        }
    }
    Ok(())
}

fn init_config(path: Option<&Path>) -> anyhow::Result<()> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => Config::config_path()?,
    };
    Config::create_default_config(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
