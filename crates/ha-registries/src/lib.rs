//! Home Assistant Registries
//!
//! Shared persistence and operator-facing registries:
//! - [`Storage`] - versioned JSON files in the `.storage/` directory
//! - [`Store`] - a single storage key with debounced, coalesced saves
//! - [`IssueRegistry`] - persistent, dismissible repair issues
//! - [`PersistentNotifications`] - in-memory UI notifications

pub mod issue_registry;
pub mod notifications;
pub mod storage;
pub mod store;

pub use issue_registry::{Issue, IssueRegistry, IssueSeverity};
pub use notifications::{Notification, PersistentNotifications, UpdateType};
pub use storage::{Storable, Storage, StorageError, StorageFile, StorageResult};
pub use store::Store;
