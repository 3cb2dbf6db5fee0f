//! Versioned resource cache.
//!
//! Entries are keyed by a request fingerprint and grouped into named
//! generations, one per deployed application shell version. The lifecycle
//! controller installs a new generation, activates it, and purges the rest;
//! the interception layer reads and writes entries in whichever generation
//! is active.

mod storage;
mod traits;

pub use storage::SqliteCacheStore;
pub use traits::{CacheEntry, CacheStore, Fingerprint, GenerationState};
