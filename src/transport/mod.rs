//! HTTP-shaped request transport for the task collection.
//!
//! A transport only moves requests and responses. It does not retry, cache or
//! interpret status codes; that is left to the classifier and orchestrators.

mod faulty;
mod http;

pub use faulty::{FaultConfig, FaultConfigError, FaultInjectingTransport, FaultRoll, ScriptedRolls};
pub use http::HttpTransport;

use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// What came back from a single request.
#[derive(Debug, Clone, PartialEq)]
pub enum RawOutcome {
  /// The server answered; `body` is `None` when it was empty or not JSON.
  Response { status: u16, body: Option<Value> },
  /// No response at all (connection refused, reset, timed out).
  NetworkFailure { reason: String },
}

impl RawOutcome {
  pub fn response(status: u16, body: Value) -> Self {
    RawOutcome::Response {
      status,
      body: Some(body),
    }
  }

  pub fn network_failure(reason: impl Into<String>) -> Self {
    RawOutcome::NetworkFailure {
      reason: reason.into(),
    }
  }

  pub fn is_ok(&self) -> bool {
    matches!(self, RawOutcome::Response { status, .. } if (200..300).contains(status))
  }

  pub fn status(&self) -> Option<u16> {
    match self {
      RawOutcome::Response { status, .. } => Some(*status),
      RawOutcome::NetworkFailure { .. } => None,
    }
  }

  pub fn body(&self) -> Option<&Value> {
    match self {
      RawOutcome::Response { body, .. } => body.as_ref(),
      RawOutcome::NetworkFailure { .. } => None,
    }
  }
}

/// Sends one request and resolves once the response (or its absence) is known.
pub trait Transport: Send + Sync + 'static {
  fn send<'a>(
    &'a self,
    method: Method,
    path: &'a str,
    body: Option<Value>,
  ) -> BoxFuture<'a, RawOutcome>;
}
