use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

use tasksync::config::LogConfig;

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
///
/// Keep the returned guard alive for the life of the program; dropping it
/// flushes and stops the file writer.
pub fn setup(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&config.level))
    .map_err(|e| eyre!("Invalid log level {:?}: {}", config.level, e))?;

  let builder = fmt().with_env_filter(filter).with_level(true);

  match &config.file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("Log file path has no file name: {}", path.display()))?;
      let appender = tracing_appender::rolling::never(dir, name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      builder
        .with_ansi(false)
        .with_writer(writer)
        .try_init()
        .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;
      Ok(Some(guard))
    }
    None => {
      builder
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;
      Ok(None)
    }
  }
}
