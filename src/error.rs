//! Failure taxonomy and the classifier that maps raw outcomes onto it.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::transport::RawOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
  Network,
  NotFound,
  BadRequest,
  ServerError,
  Unknown,
}

impl ErrorKind {
  /// Transient kinds are worth another attempt.
  pub fn is_retryable(&self) -> bool {
    matches!(self, ErrorKind::Network | ErrorKind::ServerError)
  }

  /// Message shown when the response did not carry one.
  pub fn fallback_message(&self) -> &'static str {
    match self {
      ErrorKind::Network => "خطا در برقراری ارتباط با سرور",
      ErrorKind::NotFound => "تسک یافت نشد",
      ErrorKind::BadRequest => "درخواست نامعتبر است",
      ErrorKind::ServerError => "خطای سرور. لطفا دوباره تلاش کنید",
      ErrorKind::Unknown => "خطای ناشناخته رخ داد",
    }
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ErrorKind::Network => "network",
      ErrorKind::NotFound => "not found",
      ErrorKind::BadRequest => "bad request",
      ErrorKind::ServerError => "server error",
      ErrorKind::Unknown => "unknown",
    };
    f.write_str(name)
  }
}

/// A failed attempt normalized into the taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{message}")]
pub struct ClassifiedError {
  pub kind: ErrorKind,
  pub message: String,
  pub http_status: Option<u16>,
  pub retryable: bool,
}

impl ClassifiedError {
  pub fn new(kind: ErrorKind, message: impl Into<String>, http_status: Option<u16>) -> Self {
    Self {
      kind,
      message: message.into(),
      http_status,
      retryable: kind.is_retryable(),
    }
  }

  /// A 2xx response whose body was not what the endpoint promises.
  pub fn malformed(status: u16) -> Self {
    Self::new(
      ErrorKind::Unknown,
      ErrorKind::Unknown.fallback_message(),
      Some(status),
    )
  }
}

/// Classify a failed outcome.
///
/// Rules apply in order: no response, 404, 400, 5xx, then anything else.
/// A 2xx outcome passed here is reported as `Unknown`.
pub fn classify(outcome: &RawOutcome) -> ClassifiedError {
  let status = match outcome {
    RawOutcome::NetworkFailure { .. } => {
      return ClassifiedError::new(
        ErrorKind::Network,
        ErrorKind::Network.fallback_message(),
        None,
      );
    }
    RawOutcome::Response { status, .. } => *status,
  };

  let kind = match status {
    404 => ErrorKind::NotFound,
    400 => ErrorKind::BadRequest,
    s if s >= 500 => ErrorKind::ServerError,
    _ => ErrorKind::Unknown,
  };

  let message = outcome
    .body()
    .and_then(|body| body.get("message"))
    .and_then(|m| m.as_str())
    .filter(|m| !m.trim().is_empty())
    .map(String::from)
    .unwrap_or_else(|| kind.fallback_message().to_string());

  ClassifiedError::new(kind, message, Some(status))
}
