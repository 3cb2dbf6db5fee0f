//! Control channel between the agent and open application instances.
//!
//! Each foreground instance registers a handle carrying its current URL and
//! an unbounded channel for outbound messages. Broadcast is fire-and-forget:
//! no acknowledgment, no ordering guarantee between instances, and send
//! errors from instances that went away are ignored.

// Allow dead code: parts of the registry surface are driven by the
// foreground bridge, not by the daemon itself.
#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::notify::NotificationRequest;

/// Messages exchanged with application instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
  /// Inbound: a foreground instance asks the waiting generation to
  /// activate immediately.
  #[serde(rename = "FORCE_ACTIVATE")]
  ForceActivate,
  /// Outbound: a displayed notification was clicked.
  #[serde(rename = "NOTIFICATION_CLICK")]
  NotificationClick {
    action: String,
    notification: NotificationRequest,
  },
}

/// One open application instance, as seen by the agent.
pub struct ClientHandle {
  id: u64,
  url: Mutex<String>,
  /// Cache generation currently controlling this instance.
  controller: Mutex<Option<String>>,
  tx: mpsc::UnboundedSender<ClientMessage>,
  /// Receiving end of the message channel, parked here for instances the
  /// agent opened itself until the foreground bridge claims it.
  rx: Mutex<Option<mpsc::UnboundedReceiver<ClientMessage>>>,
}

impl ClientHandle {
  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn url(&self) -> String {
    self.url.lock().map(|u| u.clone()).unwrap_or_default()
  }

  pub fn controller(&self) -> Option<String> {
    self.controller.lock().ok().and_then(|c| c.clone())
  }

  /// Update the URL the instance currently shows.
  pub fn navigate(&self, url: &str) {
    if let Ok(mut current) = self.url.lock() {
      *current = url.to_string();
    }
  }

  /// Claim the parked receiver of an agent-opened instance. `None` once
  /// claimed, or for instances that connected with their own receiver.
  pub fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<ClientMessage>> {
    self.rx.lock().ok().and_then(|mut rx| rx.take())
  }
}

/// Registry of all open application instances.
#[derive(Default)]
pub struct ClientRegistry {
  clients: Mutex<Vec<Arc<ClientHandle>>>,
  focused: Mutex<Option<u64>>,
  next_id: AtomicU64,
}

impl ClientRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a new instance showing `url`; returns its handle and the
  /// receiving end of its message channel.
  pub fn connect(
    &self,
    url: &str,
  ) -> (Arc<ClientHandle>, mpsc::UnboundedReceiver<ClientMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = Arc::new(ClientHandle {
      id: self.next_id.fetch_add(1, Ordering::Relaxed),
      url: Mutex::new(url.to_string()),
      controller: Mutex::new(None),
      tx,
      rx: Mutex::new(None),
    });

    if let Ok(mut clients) = self.clients.lock() {
      clients.push(Arc::clone(&handle));
    }

    (handle, rx)
  }

  /// Remove an instance that closed.
  pub fn disconnect(&self, id: u64) {
    if let Ok(mut clients) = self.clients.lock() {
      clients.retain(|c| c.id != id);
    }
    if let Ok(mut focused) = self.focused.lock() {
      if *focused == Some(id) {
        *focused = None;
      }
    }
  }

  /// Snapshot of all open instances.
  pub fn list(&self) -> Vec<Arc<ClientHandle>> {
    self
      .clients
      .lock()
      .map(|clients| clients.clone())
      .unwrap_or_default()
  }

  /// First instance currently showing `url`.
  pub fn find_by_url(&self, url: &str) -> Option<Arc<ClientHandle>> {
    self.list().into_iter().find(|c| c.url() == url)
  }

  /// Bring an instance to the foreground.
  pub fn focus(&self, id: u64) {
    if let Ok(mut focused) = self.focused.lock() {
      *focused = Some(id);
    }
  }

  /// The instance currently in the foreground, if any.
  pub fn focused(&self) -> Option<u64> {
    self.focused.lock().ok().and_then(|f| *f)
  }

  /// Open a new instance at `url` and focus it. The receiver stays parked
  /// in the handle (`take_receiver`) so messages sent before the foreground
  /// bridge attaches, the click broadcast included, are not lost.
  pub fn open_window(&self, url: &str) -> Arc<ClientHandle> {
    let (handle, rx) = self.connect(url);
    if let Ok(mut slot) = handle.rx.lock() {
      *slot = Some(rx);
    }
    self.focus(handle.id);
    handle
  }

  /// Record `generation` as the controller of every open instance.
  pub fn claim(&self, generation: &str) {
    for client in self.list() {
      if let Ok(mut controller) = client.controller.lock() {
        *controller = Some(generation.to_string());
      }
    }
  }

  /// Send `message` to every open instance, best-effort.
  pub fn broadcast(&self, message: &ClientMessage) {
    for client in self.list() {
      // Fire-and-forget: an instance that closed its channel is skipped.
      let _ = client.tx.send(message.clone());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_broadcast_reaches_every_instance() {
    let registry = ClientRegistry::new();
    let (_a, mut rx_a) = registry.connect("/");
    let (_b, mut rx_b) = registry.connect("/feed");

    registry.broadcast(&ClientMessage::ForceActivate);

    assert!(matches!(rx_a.try_recv(), Ok(ClientMessage::ForceActivate)));
    assert!(matches!(rx_b.try_recv(), Ok(ClientMessage::ForceActivate)));
  }

  #[test]
  fn test_broadcast_ignores_closed_receivers() {
    let registry = ClientRegistry::new();
    let (_a, rx_a) = registry.connect("/");
    let (_b, mut rx_b) = registry.connect("/feed");

    drop(rx_a);
    registry.broadcast(&ClientMessage::ForceActivate);

    assert!(matches!(rx_b.try_recv(), Ok(ClientMessage::ForceActivate)));
  }

  #[test]
  fn test_find_by_url_and_focus() {
    let registry = ClientRegistry::new();
    let (_a, _rx_a) = registry.connect("/");
    let (b, _rx_b) = registry.connect("/feed");

    let found = registry.find_by_url("/feed").unwrap();
    assert_eq!(found.id(), b.id());

    registry.focus(found.id());
    assert_eq!(registry.focused(), Some(b.id()));

    registry.disconnect(b.id());
    assert!(registry.find_by_url("/feed").is_none());
    assert_eq!(registry.focused(), None);
  }

  #[test]
  fn test_opened_window_keeps_messages_until_claimed() {
    let registry = ClientRegistry::new();
    let opened = registry.open_window("/posts/42");

    registry.broadcast(&ClientMessage::ForceActivate);

    let mut rx = opened.take_receiver().unwrap();
    assert!(matches!(rx.try_recv(), Ok(ClientMessage::ForceActivate)));

    // The receiver can be claimed only once.
    assert!(opened.take_receiver().is_none());
  }

  #[test]
  fn test_claim_marks_every_instance() {
    let registry = ClientRegistry::new();
    let (a, _rx_a) = registry.connect("/");
    let (b, _rx_b) = registry.connect("/feed");

    registry.claim("digame-cache-v2");

    assert_eq!(a.controller().as_deref(), Some("digame-cache-v2"));
    assert_eq!(b.controller().as_deref(), Some("digame-cache-v2"));
  }

  #[test]
  fn test_message_wire_format() {
    let json = serde_json::to_value(&ClientMessage::ForceActivate).unwrap();
    assert_eq!(json["type"], "FORCE_ACTIVATE");

    let parsed: ClientMessage =
      serde_json::from_str(r#"{"type":"FORCE_ACTIVATE"}"#).unwrap();
    assert!(matches!(parsed, ClientMessage::ForceActivate));
  }
}
