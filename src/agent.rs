//! The agent context and its event dispatch loop.
//!
//! One `Agent` holds the injected cache store, mutation store, message bus
//! and network; each inbound event maps to a handler whose future the driver
//! awaits before it considers the event complete. That keeps background work
//! (cache writes, sync drains) scoped to the event that spawned it.

use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::CacheStore;
use crate::clients::{ClientMessage, ClientRegistry};
use crate::config::Config;
use crate::intercept::Interceptor;
use crate::lifecycle::LifecycleController;
use crate::net::{Network, NetworkRequest, NetworkResponse};
use crate::notify::{NotificationDispatcher, NotificationDisplay, NotificationRequest};
use crate::outbox::{MutationStore, PendingMutation};
use crate::sync::{SyncEngine, SyncReport, SyncTrigger};

/// Everything the agent reacts to.
pub enum AgentEvent {
  /// Provision the configured cache generation.
  Install,
  /// Promote the configured generation and retire the rest.
  Activate,
  /// An intercepted outbound request; the response (or its absence) goes
  /// back through `reply`.
  Fetch {
    request: NetworkRequest,
    reply: oneshot::Sender<Result<NetworkResponse>>,
  },
  /// An inbound push payload.
  Push { payload: Option<Vec<u8>> },
  /// The user clicked a displayed notification.
  NotificationClick {
    action: String,
    notification: NotificationRequest,
  },
  /// A sync trigger fired.
  Sync { trigger: SyncTrigger },
  /// A control message from a foreground instance.
  Message { message: ClientMessage },
}

/// The agent: one per process, or one per test.
pub struct Agent<S, M, N, D> {
  lifecycle: LifecycleController<S, N>,
  interceptor: Interceptor<S, N>,
  sync: SyncEngine<M, N>,
  dispatcher: NotificationDispatcher<D>,
  registry: Arc<ClientRegistry>,
  outbox: Arc<M>,
  generation: String,
  manifest: Vec<String>,
}

impl<S, M, N, D> Agent<S, M, N, D>
where
  S: CacheStore,
  M: MutationStore,
  N: Network,
  D: NotificationDisplay,
{
  pub fn new(
    store: Arc<S>,
    outbox: Arc<M>,
    network: Arc<N>,
    display: Arc<D>,
    registry: Arc<ClientRegistry>,
    config: &Config,
  ) -> Result<Self> {
    let fallback_url = config.resolve_url(&config.offline_fallback)?;
    let manifest = config.manifest_urls()?;

    Ok(Self {
      lifecycle: LifecycleController::new(
        Arc::clone(&store),
        Arc::clone(&network),
        Arc::clone(&registry),
      ),
      interceptor: Interceptor::new(Arc::clone(&store), Arc::clone(&network), &fallback_url),
      sync: SyncEngine::new(Arc::clone(&outbox), Arc::clone(&network)),
      dispatcher: NotificationDispatcher::new(display, Arc::clone(&registry), &config.default_route),
      registry,
      outbox,
      generation: config.generation_name(),
      manifest,
    })
  }

  #[allow(dead_code)]
  pub fn registry(&self) -> &Arc<ClientRegistry> {
    &self.registry
  }

  /// Queue a write that failed while offline. Called by the foreground.
  #[allow(dead_code)]
  pub fn enqueue_mutation(&self, mutation: &PendingMutation) -> Result<()> {
    debug!(id = %mutation.id, url = %mutation.url, "mutation queued for replay");
    self.outbox.enqueue(mutation)
  }

  /// Install and activate the configured generation at startup.
  ///
  /// A provisioning failure is fatal only on first boot: when an earlier
  /// generation is still active the agent keeps serving from it and waits
  /// for a later trigger to retry.
  pub async fn provision(&self) -> Result<()> {
    let provisioned = match self.lifecycle.install(&self.generation, &self.manifest).await {
      Ok(()) => self.lifecycle.activate(&self.generation),
      Err(e) => Err(e),
    };

    match provisioned {
      Ok(()) => Ok(()),
      Err(e) if self.lifecycle.active_generation()?.is_some() => {
        warn!(error = %e, "provisioning failed, keeping the active generation");
        Ok(())
      }
      Err(e) => Err(e),
    }
  }

  /// Drain the outbox once.
  pub async fn run_sync(&self, trigger: SyncTrigger) -> Result<SyncReport> {
    self.sync.run_sync(trigger).await
  }

  /// Handle one event to completion.
  pub async fn dispatch(&self, event: AgentEvent) -> Result<()> {
    match event {
      AgentEvent::Install => self.lifecycle.install(&self.generation, &self.manifest).await,
      AgentEvent::Activate => self.lifecycle.activate(&self.generation),
      AgentEvent::Fetch { request, reply } => {
        let response = self.interceptor.handle_fetch(&request).await;
        // The requester may have gone away; that is its problem.
        let _ = reply.send(response);
        Ok(())
      }
      AgentEvent::Push { payload } => {
        self.dispatcher.on_push(payload.as_deref());
        Ok(())
      }
      AgentEvent::NotificationClick {
        action,
        notification,
      } => {
        self.dispatcher.on_notification_click(&action, &notification);
        Ok(())
      }
      AgentEvent::Sync { trigger } => self.run_sync(trigger).await.map(|_| ()),
      AgentEvent::Message { message } => match message {
        ClientMessage::ForceActivate => self.lifecycle.force_activate(),
        // Outbound-only message; a client echoing it back is ignored.
        ClientMessage::NotificationClick { .. } => Ok(()),
      },
    }
  }
}

/// Sequenced event loop: handlers run to completion one at a time, so every
/// event's asynchronous work has finished by the time the driver moves on,
/// and by the time `run` returns.
pub struct EventDriver {
  rx: mpsc::UnboundedReceiver<AgentEvent>,
}

/// Create the event channel and its driver.
pub fn event_channel() -> (mpsc::UnboundedSender<AgentEvent>, EventDriver) {
  let (tx, rx) = mpsc::unbounded_channel();
  (tx, EventDriver { rx })
}

impl EventDriver {
  /// Run until every sender is dropped. Handler errors are logged, never
  /// fatal to the loop.
  pub async fn run<S, M, N, D>(mut self, agent: &Agent<S, M, N, D>)
  where
    S: CacheStore,
    M: MutationStore,
    N: Network,
    D: NotificationDisplay,
  {
    while let Some(event) = self.rx.recv().await {
      if let Err(e) = agent.dispatch(event).await {
        warn!(error = %e, "event handler failed");
      }
    }
  }
}

/// Emit a periodic sync trigger until the channel closes.
pub fn spawn_periodic_sync(
  tx: mpsc::UnboundedSender<AgentEvent>,
  interval: Duration,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately; skip it so the interval is a
    // delay, not a leading edge.
    ticker.tick().await;
    loop {
      ticker.tick().await;
      if tx
        .send(AgentEvent::Sync {
          trigger: SyncTrigger::Periodic,
        })
        .is_err()
      {
        break;
      }
    }
  })
}
