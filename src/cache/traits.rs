//! Core types and the storage trait for the versioned resource cache.

use color_eyre::Result;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::net::{NetworkResponse, ResponseKind};

/// Normalized cache key for a request: sha256 over `METHOD URL`.
///
/// Only GET requests are ever fingerprinted; the method is part of the input
/// so the key space stays unambiguous if that ever changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
  pub fn new(method: &str, url: &str) -> Self {
    let input = format!("{} {}", method.trim().to_uppercase(), url.trim());

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    Fingerprint(hex::encode(hasher.finalize()))
  }

  /// Fingerprint for a GET of `url`.
  pub fn get(url: &str) -> Self {
    Self::new("GET", url)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

/// Lifecycle state of a cache generation.
///
/// `Superseded` exists only transiently: a superseded generation is deleted
/// during activation, so at rest a generation is installing, waiting, or
/// active, and at most one is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
  Installing,
  Waiting,
  Active,
  Superseded,
}

impl GenerationState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Installing => "installing",
      Self::Waiting => "waiting",
      Self::Active => "active",
      Self::Superseded => "superseded",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "installing" => Some(Self::Installing),
      "waiting" => Some(Self::Waiting),
      "active" => Some(Self::Active),
      "superseded" => Some(Self::Superseded),
      _ => None,
    }
  }
}

/// A cached response snapshot: status, headers and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl CacheEntry {
  /// Copy a response into an independent cache entry.
  ///
  /// The copy is explicit: the original response still goes back to the
  /// caller, so the entry must not share its buffer.
  pub fn from_response(response: &NetworkResponse) -> Self {
    Self {
      status: response.status,
      headers: response.headers.clone(),
      body: response.body.clone(),
    }
  }

  /// Rebuild a response from this entry. Cached entries are always
  /// same-origin, so the kind is `Basic`.
  pub fn into_response(self) -> NetworkResponse {
    NetworkResponse {
      status: self.status,
      kind: ResponseKind::Basic,
      headers: self.headers,
      body: self.body,
    }
  }
}

/// Trait for versioned cache storage backends.
///
/// Entries live inside a named generation; generations move through
/// [`GenerationState`] and are destroyed wholesale when superseded.
pub trait CacheStore: Send + Sync {
  /// Create `name` in the `Installing` state if it does not exist yet.
  fn ensure_generation(&self, name: &str) -> Result<()>;

  /// Transition `name` to `state`. Fails if the generation does not exist.
  fn set_generation_state(&self, name: &str, state: GenerationState) -> Result<()>;

  /// The currently active generation, if any.
  fn active_generation(&self) -> Result<Option<String>>;

  /// All generations with their states.
  fn list_generations(&self) -> Result<Vec<(String, GenerationState)>>;

  /// Delete a generation and purge all of its entries.
  fn delete_generation(&self, name: &str) -> Result<()>;

  /// Look up an entry in `generation`.
  fn match_entry(&self, generation: &str, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>>;

  /// Write an entry into `generation` (last write wins). Refused for
  /// missing or superseded generations.
  fn put_entry(&self, generation: &str, fingerprint: &Fingerprint, entry: CacheEntry)
    -> Result<()>;

  /// Remove a single entry.
  fn delete_entry(&self, generation: &str, fingerprint: &Fingerprint) -> Result<()>;
}
