use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{Method, RawOutcome, Transport};

/// Transport backed by a real HTTP server exposing `/api/tasks`.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
}

impl HttpTransport {
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
    let mut base_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid API base URL '{}': {}", base_url, e))?;
    // Request paths are joined onto the base, which keeps any prefix only
    // when it ends in a slash.
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, base_url })
  }

  fn method(method: Method) -> reqwest::Method {
    match method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Delete => reqwest::Method::DELETE,
    }
  }

  fn url_for(&self, path: &str) -> Result<Url, url::ParseError> {
    self.base_url.join(path.trim_start_matches('/'))
  }

  async fn request(&self, method: Method, path: &str, body: Option<Value>) -> RawOutcome {
    let url = match self.url_for(path) {
      Ok(url) => url,
      Err(e) => return RawOutcome::network_failure(format!("invalid request path {}: {}", path, e)),
    };

    let mut request = self.client.request(Self::method(method), url);
    if let Some(body) = &body {
      request = request.json(body);
    }

    let response = match request.send().await {
      Ok(response) => response,
      Err(e) => {
        debug!(%method, path, error = %e, "Request failed without a response");
        return RawOutcome::network_failure(e.to_string());
      }
    };

    let status = response.status().as_u16();
    // Bodies that are empty or not JSON still carry a usable status.
    let body = response.json::<Value>().await.ok();
    RawOutcome::Response { status, body }
  }
}

impl Transport for HttpTransport {
  fn send<'a>(
    &'a self,
    method: Method,
    path: &'a str,
    body: Option<Value>,
  ) -> BoxFuture<'a, RawOutcome> {
    self.request(method, path, body).boxed()
  }
}
