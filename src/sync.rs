//! Drains the mutation outbox against the network.
//!
//! One item's failure never aborts the batch; a failed item simply stays
//! queued for the next trigger. There is no internal backoff: retry cadence
//! is whatever cadence the triggers have.

use color_eyre::{eyre::WrapErr, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::net::Network;
use crate::outbox::MutationStore;

/// What caused a sync run. All triggers drain the same path; the trigger is
/// recorded only for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
  /// Connectivity came back.
  ConnectivityRegained,
  /// Periodic background tick.
  Periodic,
  /// Explicit request from the foreground.
  Requested,
}

/// Outcome of one sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Mutations acknowledged with a 2xx and removed from the store.
  pub replayed: usize,
  /// Mutations that stay queued for the next trigger.
  pub failed: usize,
}

/// Replays queued mutations in timestamp order.
pub struct SyncEngine<M, N> {
  outbox: Arc<M>,
  network: Arc<N>,
}

impl<M: MutationStore, N: Network> SyncEngine<M, N> {
  pub fn new(outbox: Arc<M>, network: Arc<N>) -> Self {
    Self { outbox, network }
  }

  /// Drain the outbox once.
  ///
  /// Fails only if the store itself cannot be read; per-item replay
  /// failures are logged and counted, never escalated.
  pub async fn run_sync(&self, trigger: SyncTrigger) -> Result<SyncReport> {
    let pending = self
      .outbox
      .read_all()
      .wrap_err("sync aborted: mutation store unavailable")?;

    info!(?trigger, pending = pending.len(), "sync run starting");
    let mut report = SyncReport::default();

    for mutation in pending {
      match self.network.fetch(&mutation.to_request()).await {
        Ok(response) if response.ok() => {
          // Remove only after the server acknowledged the replay. A failed
          // delete leaves the item queued; replaying it again is safe.
          match self.outbox.delete(&mutation.id) {
            Ok(()) => report.replayed += 1,
            Err(e) => {
              warn!(id = %mutation.id, error = %e, "replayed but not dequeued");
              report.failed += 1;
            }
          }
        }
        Ok(response) => {
          warn!(
            id = %mutation.id,
            url = %mutation.url,
            status = response.status,
            "replay rejected, leaving queued"
          );
          report.failed += 1;
        }
        Err(e) => {
          warn!(id = %mutation.id, url = %mutation.url, error = %e, "replay failed, leaving queued");
          report.failed += 1;
        }
      }
    }

    info!(
      replayed = report.replayed,
      failed = report.failed,
      "sync run finished"
    );
    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::testing::{basic, ScriptedNetwork};
  use crate::outbox::{PendingMutation, SqliteMutationStore};
  use chrono::{Duration, Utc};
  use std::collections::BTreeMap;

  fn mutation(url: &str, age_secs: i64) -> PendingMutation {
    let mut m = PendingMutation::new(url, "POST", BTreeMap::new(), Some(b"{}".to_vec()));
    m.timestamp = Utc::now() - Duration::seconds(age_secs);
    m
  }

  fn engine() -> (
    SyncEngine<SqliteMutationStore, ScriptedNetwork>,
    Arc<SqliteMutationStore>,
    Arc<ScriptedNetwork>,
  ) {
    let outbox = Arc::new(SqliteMutationStore::in_memory().unwrap());
    let network = Arc::new(ScriptedNetwork::new());
    let engine = SyncEngine::new(Arc::clone(&outbox), Arc::clone(&network));
    (engine, outbox, network)
  }

  #[tokio::test]
  async fn test_successful_replay_dequeues() {
    let (engine, outbox, network) = engine();
    let m = mutation("https://digame.app/api/posts", 30);
    outbox.enqueue(&m).unwrap();
    network.respond("https://digame.app/api/posts", basic(201, b"created"));

    let report = engine.run_sync(SyncTrigger::ConnectivityRegained).await.unwrap();

    assert_eq!(report, SyncReport { replayed: 1, failed: 0 });
    assert_eq!(outbox.len().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_one_failure_does_not_abort_the_batch() {
    let (engine, outbox, network) = engine();
    let first = mutation("https://digame.app/api/a", 30);
    let second = mutation("https://digame.app/api/b", 20);
    let third = mutation("https://digame.app/api/c", 10);
    outbox.enqueue(&first).unwrap();
    outbox.enqueue(&second).unwrap();
    outbox.enqueue(&third).unwrap();

    network.respond("https://digame.app/api/a", basic(200, b"ok"));
    network.respond("https://digame.app/api/b", basic(500, b"boom"));
    network.respond("https://digame.app/api/c", basic(200, b"ok"));

    let report = engine.run_sync(SyncTrigger::Requested).await.unwrap();
    assert_eq!(report, SyncReport { replayed: 2, failed: 1 });

    // Only the rejected mutation is still queued.
    let remaining = outbox.read_all().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, second.id);
  }

  #[tokio::test]
  async fn test_network_error_leaves_item_queued() {
    let (engine, outbox, network) = engine();
    let m = mutation("https://digame.app/api/posts", 10);
    outbox.enqueue(&m).unwrap();
    network.fail("https://digame.app/api/posts");

    let report = engine.run_sync(SyncTrigger::Periodic).await.unwrap();
    assert_eq!(report, SyncReport { replayed: 0, failed: 1 });
    assert_eq!(outbox.len().unwrap(), 1);

    // The next trigger retries the same item.
    network.respond("https://digame.app/api/posts", basic(200, b"ok"));
    let report = engine.run_sync(SyncTrigger::Periodic).await.unwrap();
    assert_eq!(report, SyncReport { replayed: 1, failed: 0 });
    assert_eq!(outbox.len().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_replay_happens_in_timestamp_order() {
    let (engine, outbox, network) = engine();
    let newer = mutation("https://digame.app/api/newer", 10);
    let older = mutation("https://digame.app/api/older", 60);
    outbox.enqueue(&newer).unwrap();
    outbox.enqueue(&older).unwrap();

    network.respond("https://digame.app/api/newer", basic(200, b"ok"));
    network.respond("https://digame.app/api/older", basic(200, b"ok"));

    engine.run_sync(SyncTrigger::Requested).await.unwrap();

    assert_eq!(
      network.calls(),
      vec![
        "https://digame.app/api/older".to_string(),
        "https://digame.app/api/newer".to_string()
      ]
    );
  }

  #[tokio::test]
  async fn test_mutation_survives_restart_and_is_replayed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outbox.db");

    let m = mutation("https://digame.app/api/posts", 5);
    {
      let outbox = SqliteMutationStore::open(&path).unwrap();
      outbox.enqueue(&m).unwrap();
    }

    // Fresh store, as after a process restart.
    let outbox = Arc::new(SqliteMutationStore::open(&path).unwrap());
    let network = Arc::new(ScriptedNetwork::new());
    network.respond("https://digame.app/api/posts", basic(200, b"ok"));

    let engine = SyncEngine::new(Arc::clone(&outbox), network);
    let report = engine.run_sync(SyncTrigger::ConnectivityRegained).await.unwrap();

    assert_eq!(report, SyncReport { replayed: 1, failed: 0 });
    assert_eq!(outbox.len().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_empty_outbox_is_a_clean_run() {
    let (engine, _outbox, network) = engine();

    let report = engine.run_sync(SyncTrigger::Periodic).await.unwrap();
    assert_eq!(report, SyncReport::default());
    assert!(network.calls().is_empty());
  }
}
