use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::retry::RetryPolicy;
use crate::transport::FaultConfig;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  pub cache: CacheSection,
  pub retry: RetrySection,
  pub faults: FaultSection,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
  /// Live server root (e.g. "http://localhost:3000"). Unset means the
  /// in-process mock server
  pub base_url: Option<String>,
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: None,
      timeout_secs: 10,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheSection {
  pub stale_secs: u64,
  /// Idle time before an unsubscribed entry is evicted
  pub gc_secs: u64,
}

impl Default for CacheSection {
  fn default() -> Self {
    Self {
      stale_secs: 30,
      gc_secs: 5 * 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySection {
  pub queries: RetryConfig,
  pub mutations: RetryConfig,
}

impl Default for RetrySection {
  fn default() -> Self {
    Self {
      queries: RetryConfig::with_attempts(3),
      mutations: RetryConfig::with_attempts(2),
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl RetryConfig {
  fn with_attempts(max_attempts: u32) -> Self {
    Self {
      max_attempts,
      base_delay_ms: 1000,
      max_delay_ms: 30_000,
    }
  }

  pub fn policy(&self) -> RetryPolicy {
    RetryPolicy::exponential(
      self.max_attempts,
      Duration::from_millis(self.base_delay_ms),
      Duration::from_millis(self.max_delay_ms),
    )
  }
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self::with_attempts(3)
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct FaultSection {
  pub failure_rate: f64,
  pub network_failure_rate: f64,
  pub latency_ms: u64,
  /// Fixed RNG seed for reproducible runs
  pub seed: Option<u64>,
}

impl Default for FaultSection {
  fn default() -> Self {
    Self {
      failure_rate: 0.10,
      network_failure_rate: 0.0,
      latency_ms: 500,
      seed: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
  /// Used when RUST_LOG is not set
  pub level: String,
  /// Write logs here instead of stderr
  pub file: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file, or defaults when there is none.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tasksync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tasksync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("tasksync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tasksync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    self
      .fault_config()
      .validate()
      .map_err(|e| eyre!("Invalid faults section: {}", e))?;

    for (name, retry) in [
      ("queries", &self.retry.queries),
      ("mutations", &self.retry.mutations),
    ] {
      if retry.max_attempts < 1 {
        return Err(eyre!("retry.{}.max_attempts must be at least 1", name));
      }
      if retry.base_delay_ms > retry.max_delay_ms {
        return Err(eyre!(
          "retry.{}.base_delay_ms ({}) is larger than max_delay_ms ({})",
          name,
          retry.base_delay_ms,
          retry.max_delay_ms
        ));
      }
    }

    if let Some(url) = &self.api.base_url {
      url::Url::parse(url).map_err(|e| eyre!("Invalid api.base_url {}: {}", url, e))?;
    }
    Ok(())
  }

  pub fn cache_config(&self) -> CacheConfig {
    CacheConfig {
      stale_time: Duration::from_secs(self.cache.stale_secs),
      gc_time: Duration::from_secs(self.cache.gc_secs),
    }
  }

  pub fn fault_config(&self) -> FaultConfig {
    FaultConfig {
      failure_rate: self.faults.failure_rate,
      network_failure_rate: self.faults.network_failure_rate,
      latency: Duration::from_millis(self.faults.latency_ms),
    }
  }
}
