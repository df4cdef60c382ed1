mod app;
mod event;
mod log;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

use tasksync::config::Config;

#[derive(Parser, Debug)]
#[command(name = "tasksync")]
#[command(about = "Cached, retrying task list client with a fault-injecting mock server")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tasksync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Seed for the mock server's fault injection
  #[arg(long)]
  seed: Option<u64>,

  /// Probability of an injected 500/404 per request
  #[arg(long)]
  failure_rate: Option<f64>,

  #[command(subcommand)]
  command: app::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Command line overrides
  if let Some(seed) = args.seed {
    config.faults.seed = Some(seed);
  }
  if let Some(rate) = args.failure_rate {
    config.faults.failure_rate = rate;
  }
  config.validate()?;

  let _log_guard = log::setup(&config.log)?;

  let app = app::App::new(&config)?;
  app.run(args.command).await?;

  Ok(())
}
