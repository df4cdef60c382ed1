//! Mock transport with artificial latency and injected faults.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::{Method, RawOutcome, Transport};
use crate::mock::MockServer;

/// Source of uniform draws in `[0, 1)` that decide whether a call fails.
pub trait FaultRoll: Send {
  fn next_roll(&mut self) -> f64;
}

impl FaultRoll for StdRng {
  fn next_roll(&mut self) -> f64 {
    self.gen::<f64>()
  }
}

/// Replays fixed draws; once exhausted every call succeeds.
#[derive(Debug, Default, Clone)]
pub struct ScriptedRolls {
  rolls: VecDeque<f64>,
}

impl ScriptedRolls {
  pub fn new(rolls: impl IntoIterator<Item = f64>) -> Self {
    Self {
      rolls: rolls.into_iter().collect(),
    }
  }
}

impl FaultRoll for ScriptedRolls {
  fn next_roll(&mut self) -> f64 {
    self.rolls.pop_front().unwrap_or(1.0)
  }
}

#[derive(Debug, Error, PartialEq)]
pub enum FaultConfigError {
  #[error("invalid failure rate: must be 0.0-1.0, got {0}")]
  InvalidFailureRate(f64),
  #[error("invalid network failure rate: must be 0.0-1.0, got {0}")]
  InvalidNetworkFailureRate(f64),
  #[error("failure rates add up to more than 1.0 ({0})")]
  RatesExceedOne(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaultConfig {
  /// Probability of an injected HTTP fault, half 500 and half 404.
  pub failure_rate: f64,
  /// Probability of a call getting no response at all.
  pub network_failure_rate: f64,
  /// Fixed delay before every call resolves.
  pub latency: Duration,
}

impl Default for FaultConfig {
  fn default() -> Self {
    Self {
      failure_rate: 0.10,
      network_failure_rate: 0.0,
      latency: Duration::from_millis(500),
    }
  }
}

impl FaultConfig {
  /// No faults and no latency.
  pub fn reliable() -> Self {
    Self {
      failure_rate: 0.0,
      network_failure_rate: 0.0,
      latency: Duration::ZERO,
    }
  }

  pub fn validate(&self) -> Result<(), FaultConfigError> {
    if !(0.0..=1.0).contains(&self.failure_rate) {
      return Err(FaultConfigError::InvalidFailureRate(self.failure_rate));
    }
    if !(0.0..=1.0).contains(&self.network_failure_rate) {
      return Err(FaultConfigError::InvalidNetworkFailureRate(
        self.network_failure_rate,
      ));
    }
    let total = self.failure_rate + self.network_failure_rate;
    if total > 1.0 {
      return Err(FaultConfigError::RatesExceedOne(total));
    }
    Ok(())
  }
}

enum Injected {
  Status(u16),
  Network,
}

/// Forwards requests to a [`MockServer`] after a delay, sometimes failing instead.
///
/// Each call draws once from the roll source: below `p/2` it answers 500,
/// below `p` it answers 404, below `p + q` it drops the request, otherwise
/// the server handles it.
pub struct FaultInjectingTransport {
  server: MockServer,
  config: FaultConfig,
  roll: Mutex<Box<dyn FaultRoll>>,
  calls: AtomicUsize,
}

impl FaultInjectingTransport {
  pub fn new(server: MockServer, config: FaultConfig, roll: Box<dyn FaultRoll>) -> Self {
    Self {
      server,
      config,
      roll: Mutex::new(roll),
      calls: AtomicUsize::new(0),
    }
  }

  /// Seeded RNG, so a run can be replayed exactly.
  pub fn seeded(server: MockServer, config: FaultConfig, seed: u64) -> Self {
    Self::new(server, config, Box::new(StdRng::seed_from_u64(seed)))
  }

  /// RNG seeded from OS entropy.
  pub fn random(server: MockServer, config: FaultConfig) -> Self {
    Self::new(server, config, Box::new(StdRng::from_entropy()))
  }

  pub fn server(&self) -> &MockServer {
    &self.server
  }

  /// Number of requests sent so far.
  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  fn draw(&self) -> Option<Injected> {
    let r = self.roll.lock().next_roll();
    let p = self.config.failure_rate;
    if r < p / 2.0 {
      Some(Injected::Status(500))
    } else if r < p {
      Some(Injected::Status(404))
    } else if r < p + self.config.network_failure_rate {
      Some(Injected::Network)
    } else {
      None
    }
  }
}

impl Transport for FaultInjectingTransport {
  fn send<'a>(
    &'a self,
    method: Method,
    path: &'a str,
    body: Option<Value>,
  ) -> BoxFuture<'a, RawOutcome> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    async move {
      if !self.config.latency.is_zero() {
        tokio::time::sleep(self.config.latency).await;
      }

      let route = match self.server.route(method, path) {
        Ok(route) => route,
        Err(outcome) => return outcome,
      };

      match self.draw() {
        Some(Injected::Status(status)) => {
          debug!(%method, path, status, "Injecting HTTP fault");
          crate::mock::message_response(status, route.fault_message(status))
        }
        Some(Injected::Network) => {
          debug!(%method, path, "Injecting network failure");
          RawOutcome::network_failure("simulated connection reset")
        }
        None => self.server.dispatch(route, body),
      }
    }
    .boxed()
  }
}
