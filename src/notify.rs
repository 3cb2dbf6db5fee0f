//! Push payload parsing and notification click routing.
//!
//! An inbound push payload is shallow-merged over a default notification
//! template; anything that fails to parse as structured data is shown as a
//! plain-text body. Clicks route back into the application: focus an open
//! instance showing the target URL, or open a new one, then tell every
//! instance about the click.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clients::{ClientMessage, ClientRegistry};

pub const ACTION_VIEW: &str = "view";
pub const ACTION_DISMISS: &str = "dismiss";

const DEFAULT_TITLE: &str = "Digame Notification";
const DEFAULT_BODY: &str = "You have a new notification";
const DEFAULT_ICON: &str = "/icons/icon-192x192.png";
const DEFAULT_BADGE: &str = "/icons/badge-72x72.png";
const DEFAULT_TAG: &str = "default";
const DEFAULT_ROUTE: &str = "/";

/// One button on a displayed notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub icon: Option<String>,
}

/// Payload data carried through to the click handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationData {
  #[serde(default = "default_route")]
  pub url: String,
  #[serde(default)]
  pub timestamp: Option<i64>,
}

fn default_route() -> String {
  DEFAULT_ROUTE.to_string()
}

/// A display request for one notification. Ephemeral: lives only for the
/// duration of dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub tag: String,
  #[serde(default)]
  pub require_interaction: bool,
  #[serde(default)]
  pub actions: Vec<NotificationAction>,
  #[serde(default)]
  pub data: NotificationData,
}

impl Default for NotificationData {
  fn default() -> Self {
    Self {
      url: default_route(),
      timestamp: Some(chrono::Utc::now().timestamp_millis()),
    }
  }
}

impl Default for NotificationRequest {
  fn default() -> Self {
    Self {
      title: DEFAULT_TITLE.to_string(),
      body: DEFAULT_BODY.to_string(),
      icon: DEFAULT_ICON.to_string(),
      badge: DEFAULT_BADGE.to_string(),
      tag: DEFAULT_TAG.to_string(),
      require_interaction: false,
      actions: vec![
        NotificationAction {
          action: ACTION_VIEW.to_string(),
          title: "View".to_string(),
          icon: None,
        },
        NotificationAction {
          action: ACTION_DISMISS.to_string(),
          title: "Dismiss".to_string(),
          icon: None,
        },
      ],
      data: NotificationData::default(),
    }
  }
}

impl NotificationRequest {
  /// Build a display request from an inbound push payload.
  ///
  /// A JSON object payload is shallow-merged over the default template: the
  /// keys it provides win, everything else keeps its default. Any payload
  /// that is not a JSON object, or that merges into something unreadable,
  /// becomes the plain-text body of an otherwise default notification.
  pub fn from_payload(payload: Option<&[u8]>) -> Self {
    let Some(bytes) = payload else {
      return Self::default();
    };

    if let Ok(Value::Object(overrides)) = serde_json::from_slice::<Value>(bytes) {
      if let Ok(Value::Object(mut base)) = serde_json::to_value(Self::default()) {
        for (key, value) in overrides {
          base.insert(key, value);
        }
        if let Ok(request) = serde_json::from_value(Value::Object(base)) {
          return request;
        }
      }
    }

    Self::plain_text(bytes)
  }

  fn plain_text(bytes: &[u8]) -> Self {
    Self {
      body: String::from_utf8_lossy(bytes).into_owned(),
      ..Self::default()
    }
  }
}

/// Seam to whatever actually renders notifications.
pub trait NotificationDisplay: Send + Sync {
  fn show(&self, request: &NotificationRequest);
  fn close(&self, tag: &str);
}

/// Display that only logs; the daemon has no rendering surface of its own.
pub struct LogDisplay;

impl NotificationDisplay for LogDisplay {
  fn show(&self, request: &NotificationRequest) {
    info!(title = %request.title, tag = %request.tag, "notification displayed");
  }

  fn close(&self, tag: &str) {
    info!(tag = %tag, "notification closed");
  }
}

/// Routes push payloads to the display and notification clicks back to the
/// open application instances.
pub struct NotificationDispatcher<D> {
  display: Arc<D>,
  registry: Arc<ClientRegistry>,
  default_route: String,
}

impl<D: NotificationDisplay> NotificationDispatcher<D> {
  pub fn new(display: Arc<D>, registry: Arc<ClientRegistry>, default_route: &str) -> Self {
    Self {
      display,
      registry,
      default_route: default_route.to_string(),
    }
  }

  /// Handle an inbound push: merge the payload and display the result.
  /// Never fails; malformed payloads degrade to a plain-text body.
  pub fn on_push(&self, payload: Option<&[u8]>) {
    let request = NotificationRequest::from_payload(payload);
    debug!(title = %request.title, tag = %request.tag, "push received");
    self.display.show(&request);
  }

  /// Handle a click on a displayed notification.
  ///
  /// `dismiss` closes and does nothing else. Any other action (including
  /// the default body click, passed as an empty string) navigates to the
  /// notification's URL and tells every open instance about the click.
  pub fn on_notification_click(&self, action: &str, notification: &NotificationRequest) {
    self.display.close(&notification.tag);

    if action == ACTION_DISMISS {
      return;
    }

    let target = if notification.data.url.is_empty() {
      self.default_route.as_str()
    } else {
      notification.data.url.as_str()
    };

    match self.registry.find_by_url(target) {
      Some(client) => self.registry.focus(client.id()),
      None => {
        self.registry.open_window(target);
      }
    }

    self.registry.broadcast(&ClientMessage::NotificationClick {
      action: action.to_string(),
      notification: notification.clone(),
    });
  }
}
