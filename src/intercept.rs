//! Cache-first request interception with network fallback.

use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheStore, Fingerprint};
use crate::net::{Destination, Network, NetworkRequest, NetworkResponse, ResponseKind};

/// Sits between the application and the network, serving GETs from the
/// active cache generation and writing back fresh cacheable responses.
pub struct Interceptor<S, N> {
  store: Arc<S>,
  network: Arc<N>,
  /// Absolute URL of the offline fallback document, precached at install.
  fallback_url: String,
}

impl<S: CacheStore, N: Network> Interceptor<S, N> {
  pub fn new(store: Arc<S>, network: Arc<N>, fallback_url: &str) -> Self {
    Self {
      store,
      network,
      fallback_url: fallback_url.to_string(),
    }
  }

  /// Handle one outbound request.
  ///
  /// An `Err` means the request resolved to no response at all: the network
  /// failed and no cached answer applied.
  pub async fn handle_fetch(&self, request: &NetworkRequest) -> Result<NetworkResponse> {
    // Only GETs over http(s) take part in caching.
    if request.method != "GET" || !cacheable_scheme(&request.url) {
      return self.network.fetch(request).await;
    }

    let active = self.store.active_generation()?;
    let fingerprint = Fingerprint::new(&request.method, &request.url);

    if let Some(generation) = &active {
      if let Some(entry) = self.store.match_entry(generation, &fingerprint)? {
        debug!(url = %request.url, generation, "cache hit");
        return Ok(entry.into_response());
      }
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.status == 200 && response.kind == ResponseKind::Basic {
          if let Some(generation) = &active {
            // The entry is an independent copy; the original response
            // still goes back to the caller even if the write fails.
            let copy = CacheEntry::from_response(&response);
            if let Err(e) = self.store.put_entry(generation, &fingerprint, copy) {
              warn!(url = %request.url, error = %e, "cache write failed");
            }
          }
        }
        Ok(response)
      }
      Err(e) => {
        if request.destination == Destination::Document {
          if let Some(generation) = &active {
            if let Some(entry) = self
              .store
              .match_entry(generation, &Fingerprint::get(&self.fallback_url))?
            {
              debug!(url = %request.url, "network down, serving offline fallback");
              return Ok(entry.into_response());
            }
          }
        }
        Err(e)
      }
    }
  }
}

fn cacheable_scheme(url: &str) -> bool {
  matches!(
    Url::parse(url).map(|u| u.scheme().to_string()).as_deref(),
    Ok("http") | Ok("https")
  )
}
