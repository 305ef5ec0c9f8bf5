//! Persistent notifications
//!
//! In-memory UI alerts keyed by notification id. The config entry hub raises
//! one when discovery finds new devices and one when an integration needs
//! reauthentication.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// A persistent notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub notification_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Markdown message
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// What happened to a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    Added,
    Updated,
    Removed,
}

/// Notification store with change broadcasting
#[derive(Debug)]
pub struct PersistentNotifications {
    notifications: DashMap<String, Notification>,
    changes: broadcast::Sender<(UpdateType, Notification)>,
}

impl Default for PersistentNotifications {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistentNotifications {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            notifications: DashMap::new(),
            changes,
        }
    }

    /// Create or replace a notification.
    ///
    /// Creating an id that already exists replaces it and reports `Updated`.
    pub fn create(
        &self,
        notification_id: impl Into<String>,
        title: Option<&str>,
        message: impl Into<String>,
    ) -> UpdateType {
        let notification = Notification {
            notification_id: notification_id.into(),
            title: title.map(str::to_string),
            message: message.into(),
            created_at: Utc::now(),
        };
        let id = notification.notification_id.clone();

        let update_type = match self.notifications.insert(id.clone(), notification.clone()) {
            Some(_) => {
                debug!(notification_id = %id, "Updated notification");
                UpdateType::Updated
            }
            None => {
                info!(notification_id = %id, "Created notification");
                UpdateType::Added
            }
        };
        let _ = self.changes.send((update_type, notification));
        update_type
    }

    /// Dismiss a notification; dismissing an unknown id is a no-op
    pub fn dismiss(&self, notification_id: &str) -> Option<Notification> {
        let (_, notification) = self.notifications.remove(notification_id)?;
        info!(notification_id, "Dismissed notification");
        let _ = self
            .changes
            .send((UpdateType::Removed, notification.clone()));
        Some(notification)
    }

    pub fn get(&self, notification_id: &str) -> Option<Notification> {
        self.notifications
            .get(notification_id)
            .map(|r| r.value().clone())
    }

    pub fn contains(&self, notification_id: &str) -> bool {
        self.notifications.contains_key(notification_id)
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.iter().map(|r| r.value().clone()).collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(UpdateType, Notification)> {
        self.changes.subscribe()
    }

    pub fn len(&self) -> usize {
        self.notifications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty()
    }
}
