//! Cache generation lifecycle: install, activate, force-activate.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{CacheEntry, CacheStore, Fingerprint, GenerationState};
use crate::clients::ClientRegistry;
use crate::net::{Network, NetworkRequest};

/// Drives a cache generation from provisioning through activation.
pub struct LifecycleController<S, N> {
  store: Arc<S>,
  network: Arc<N>,
  registry: Arc<ClientRegistry>,
}

impl<S: CacheStore, N: Network> LifecycleController<S, N> {
  pub fn new(store: Arc<S>, network: Arc<N>, registry: Arc<ClientRegistry>) -> Self {
    Self {
      store,
      network,
      registry,
    }
  }

  /// Provision `generation` with every resource in `manifest`.
  ///
  /// All-or-nothing: if any manifest resource fails to fetch, the partial
  /// generation is removed and the previously active generation stays in
  /// control. Reinstalling a generation that is already waiting or active
  /// (the normal restart-with-same-version case) is a no-op, so a failed
  /// abort can never take down a generation that is serving.
  pub async fn install(&self, generation: &str, manifest: &[String]) -> Result<()> {
    let existing = self
      .store
      .list_generations()?
      .into_iter()
      .find_map(|(name, state)| (name == generation).then_some(state));
    if matches!(
      existing,
      Some(GenerationState::Waiting | GenerationState::Active)
    ) {
      info!(generation, "cache generation already provisioned");
      return Ok(());
    }

    info!(generation, resources = manifest.len(), "installing cache generation");
    self.store.ensure_generation(generation)?;

    for url in manifest {
      let response = match self.network.fetch(&NetworkRequest::get(url)).await {
        Ok(response) if response.ok() => response,
        Ok(response) => {
          self.abort_install(generation);
          return Err(eyre!(
            "Install of {} aborted: {} returned status {}",
            generation,
            url,
            response.status
          ));
        }
        Err(e) => {
          self.abort_install(generation);
          return Err(eyre!("Install of {} aborted: {}: {}", generation, url, e));
        }
      };

      if let Err(e) = self.store.put_entry(
        generation,
        &Fingerprint::get(url),
        CacheEntry::from_response(&response),
      ) {
        self.abort_install(generation);
        return Err(e);
      }
    }

    self
      .store
      .set_generation_state(generation, GenerationState::Waiting)?;
    info!(generation, "cache generation installed, waiting for activation");

    Ok(())
  }

  fn abort_install(&self, generation: &str) {
    if let Err(e) = self.store.delete_generation(generation) {
      warn!(generation, error = %e, "failed to remove partial generation");
    }
  }

  /// Make `generation` the single active generation: every other generation
  /// is deleted along with its entries, then all open clients are claimed.
  pub fn activate(&self, generation: &str) -> Result<()> {
    for (name, _) in self.store.list_generations()? {
      if name != generation {
        info!(stale = %name, "deleting stale cache generation");
        self.store.delete_generation(&name)?;
      }
    }

    self
      .store
      .set_generation_state(generation, GenerationState::Active)?;
    self.registry.claim(generation);
    info!(generation, "cache generation activated");

    Ok(())
  }

  /// Name of the generation currently serving, if any.
  pub fn active_generation(&self) -> Result<Option<String>> {
    self.store.active_generation()
  }

  /// Activate the generation currently waiting, skipping the normal handoff
  /// delay. Sent by a foreground instance via `FORCE_ACTIVATE`.
  pub fn force_activate(&self) -> Result<()> {
    let waiting = self
      .store
      .list_generations()?
      .into_iter()
      .find(|(_, state)| *state == GenerationState::Waiting);

    match waiting {
      Some((name, _)) => self.activate(&name),
      None => {
        // Nothing to do: either already active or never installed.
        info!("FORCE_ACTIVATE with no waiting generation");
        Ok(())
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteCacheStore;
  use crate::net::testing::{basic, ScriptedNetwork};

  const SHELL: &str = "https://digame.app/index.html";
  const OFFLINE: &str = "https://digame.app/offline.html";

  fn manifest() -> Vec<String> {
    vec![SHELL.to_string(), OFFLINE.to_string()]
  }

  fn controller() -> (
    LifecycleController<SqliteCacheStore, ScriptedNetwork>,
    Arc<SqliteCacheStore>,
    Arc<ScriptedNetwork>,
    Arc<ClientRegistry>,
  ) {
    let store = Arc::new(SqliteCacheStore::in_memory().unwrap());
    let network = Arc::new(ScriptedNetwork::new());
    let registry = Arc::new(ClientRegistry::new());
    let controller = LifecycleController::new(
      Arc::clone(&store),
      Arc::clone(&network),
      Arc::clone(&registry),
    );
    (controller, store, network, registry)
  }

  #[tokio::test]
  async fn test_install_precaches_manifest() {
    let (controller, store, network, _registry) = controller();
    network.respond(SHELL, basic(200, b"<html>shell</html>"));
    network.respond(OFFLINE, basic(200, b"<html>offline</html>"));

    controller.install("v1", &manifest()).await.unwrap();

    let generations = store.list_generations().unwrap();
    assert_eq!(
      generations,
      vec![("v1".to_string(), GenerationState::Waiting)]
    );

    let entry = store
      .match_entry("v1", &Fingerprint::get(OFFLINE))
      .unwrap()
      .unwrap();
    assert_eq!(entry.body, b"<html>offline</html>");
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing_on_network_failure() {
    let (controller, store, network, _registry) = controller();
    network.respond(SHELL, basic(200, b"<html>shell</html>"));
    network.fail(OFFLINE);

    assert!(controller.install("v1", &manifest()).await.is_err());

    // No partial generation is left behind.
    assert!(store.list_generations().unwrap().is_empty());
    assert!(store
      .match_entry("v1", &Fingerprint::get(SHELL))
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing_on_bad_status() {
    let (controller, store, network, _registry) = controller();
    network.respond(SHELL, basic(404, b"not found"));
    network.respond(OFFLINE, basic(200, b"<html>offline</html>"));

    assert!(controller.install("v1", &manifest()).await.is_err());
    assert!(store.list_generations().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_install_failure_leaves_previous_generation_active() {
    let (controller, store, network, _registry) = controller();
    network.respond(SHELL, basic(200, b"old shell"));
    network.respond(OFFLINE, basic(200, b"old offline"));

    controller.install("v1", &manifest()).await.unwrap();
    controller.activate("v1").unwrap();

    network.fail(SHELL);
    assert!(controller.install("v2", &manifest()).await.is_err());

    assert_eq!(store.active_generation().unwrap().as_deref(), Some("v1"));
  }

  #[tokio::test]
  async fn test_offline_reinstall_preserves_active_generation() {
    let (controller, store, network, _registry) = controller();
    network.respond(SHELL, basic(200, b"shell"));
    network.respond(OFFLINE, basic(200, b"offline"));

    controller.install("v1", &manifest()).await.unwrap();
    controller.activate("v1").unwrap();

    // Restart with the same version while the network is down: the
    // reinstall must not touch the generation that is serving.
    network.fail(SHELL);
    network.fail(OFFLINE);
    controller.install("v1", &manifest()).await.unwrap();

    assert_eq!(store.active_generation().unwrap().as_deref(), Some("v1"));
    assert!(store
      .match_entry("v1", &Fingerprint::get(SHELL))
      .unwrap()
      .is_some());
  }

  #[tokio::test]
  async fn test_reinstall_of_waiting_generation_skips_fetches() {
    let (controller, _store, network, _registry) = controller();
    network.respond(SHELL, basic(200, b"shell"));
    network.respond(OFFLINE, basic(200, b"offline"));

    controller.install("v1", &manifest()).await.unwrap();
    assert_eq!(network.calls().len(), 2);

    controller.install("v1", &manifest()).await.unwrap();
    assert_eq!(network.calls().len(), 2);
  }

  #[tokio::test]
  async fn test_activate_purges_stale_generations_and_claims_clients() {
    let (controller, store, network, registry) = controller();
    network.respond(SHELL, basic(200, b"shell"));
    network.respond(OFFLINE, basic(200, b"offline"));

    let (client, _rx) = registry.connect("/");

    controller.install("v1", &manifest()).await.unwrap();
    controller.activate("v1").unwrap();
    controller.install("v2", &manifest()).await.unwrap();
    controller.activate("v2").unwrap();

    let generations = store.list_generations().unwrap();
    assert_eq!(
      generations,
      vec![("v2".to_string(), GenerationState::Active)]
    );
    assert_eq!(client.controller().as_deref(), Some("v2"));
  }

  #[tokio::test]
  async fn test_force_activate_promotes_waiting_generation() {
    let (controller, store, network, _registry) = controller();
    network.respond(SHELL, basic(200, b"shell"));
    network.respond(OFFLINE, basic(200, b"offline"));

    controller.install("v1", &manifest()).await.unwrap();
    assert_eq!(store.active_generation().unwrap(), None);

    controller.force_activate().unwrap();
    assert_eq!(store.active_generation().unwrap().as_deref(), Some("v1"));

    // No waiting generation left; a second force-activate is a no-op.
    controller.force_activate().unwrap();
    assert_eq!(store.active_generation().unwrap().as_deref(), Some("v1"));
  }
}
