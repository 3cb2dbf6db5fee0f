//! Network contract shared by the interception layer and the sync engine.
//!
//! A network failure (connectivity, DNS, timeout) surfaces as `Err`, while a
//! reachable server that rejects the request surfaces as `Ok` with a non-2xx
//! status. The two are handled very differently upstream, so the distinction
//! is part of the contract.

use std::collections::BTreeMap;
use std::future::Future;

use color_eyre::{eyre::eyre, Result};
use url::Url;

/// What the requester intends to do with the response.
///
/// Navigations get the offline fallback document when the network is down;
/// everything else propagates the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
  /// Top-level navigation to a document
  Document,
  /// Any subresource (script, style, image, API call, ...)
  Resource,
}

/// An outbound request as seen by the agent.
#[derive(Debug, Clone)]
pub struct NetworkRequest {
  pub url: String,
  pub method: String,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
  pub destination: Destination,
}

impl NetworkRequest {
  /// A plain GET subresource request.
  pub fn get(url: &str) -> Self {
    Self {
      url: url.to_string(),
      method: "GET".to_string(),
      headers: BTreeMap::new(),
      body: None,
      destination: Destination::Resource,
    }
  }

  /// A top-level navigation request.
  #[allow(dead_code)]
  pub fn navigation(url: &str) -> Self {
    Self {
      destination: Destination::Document,
      ..Self::get(url)
    }
  }
}

/// Response classification relative to the agent's own origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
  /// Same-origin ("basic") response, eligible for caching
  Basic,
  /// Cross-origin response, never cached
  Cors,
}

/// A fully buffered response.
///
/// Bodies are buffered rather than streamed so that the interception layer
/// can copy an entry into the cache and still hand the original back to the
/// caller.
#[derive(Debug, Clone)]
pub struct NetworkResponse {
  pub status: u16,
  pub kind: ResponseKind,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl NetworkResponse {
  /// Whether the status is in the 2xx range.
  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Seam between the agent and the actual transport.
pub trait Network: Send + Sync {
  /// Issue the request and buffer the response.
  fn fetch(
    &self,
    request: &NetworkRequest,
  ) -> impl Future<Output = Result<NetworkResponse>> + Send;
}

/// reqwest-backed transport.
pub struct HttpNetwork {
  client: reqwest::Client,
  origin: Url,
}

impl HttpNetwork {
  /// Create a transport that classifies responses against `origin`.
  pub fn new(origin: &str) -> Result<Self> {
    let origin =
      Url::parse(origin).map_err(|e| eyre!("Invalid origin URL {}: {}", origin, e))?;

    Ok(Self {
      client: reqwest::Client::new(),
      origin,
    })
  }

  fn classify(&self, url: &Url) -> ResponseKind {
    if url.origin() == self.origin.origin() {
      ResponseKind::Basic
    } else {
      ResponseKind::Cors
    }
  }
}

impl Network for HttpNetwork {
  async fn fetch(&self, request: &NetworkRequest) -> Result<NetworkResponse> {
    let url =
      Url::parse(&request.url).map_err(|e| eyre!("Invalid request URL {}: {}", request.url, e))?;
    let kind = self.classify(&url);

    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

    let mut builder = self.client.request(method, url);
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers: BTreeMap<String, String> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response body from {}: {}", request.url, e))?
      .to_vec();

    Ok(NetworkResponse {
      status,
      kind,
      headers,
      body,
    })
  }
}
