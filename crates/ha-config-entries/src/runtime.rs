//! Per-entry runtime bookkeeping
//!
//! Everything an entry owns while it is set up but never persists: its
//! locks, the pending setup retry, tasks the integration spawned, unload
//! callbacks and update listeners. Shared by every snapshot of the entry
//! through an `Arc`.

use futures::future::{BoxFuture, Shared};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::entry::ConfigEntry;
use crate::error::ConfigEntriesResult;
use crate::manager::ConfigEntries;

/// Callback run when the entry unloads (or fails setup)
pub enum UnloadCallback {
    Sync(Box<dyn FnOnce() + Send>),
    Async(Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>),
}

/// Listener invoked after the entry is updated
pub type UpdateListener =
    Arc<dyn Fn(Arc<ConfigEntries>, ConfigEntry) -> BoxFuture<'static, ()> + Send + Sync>;

/// A task spawned on behalf of the entry
pub(crate) struct EntryTask {
    pub(crate) name: String,
    pub(crate) handle: JoinHandle<()>,
}

/// The scheduled not-ready retry
pub(crate) struct RetrySlot {
    pub(crate) id: u64,
    pub(crate) cancel: CancellationToken,
    pub(crate) wait: Duration,
}

pub(crate) type SharedReload = Shared<BoxFuture<'static, ConfigEntriesResult<bool>>>;

#[derive(Default)]
pub(crate) struct RuntimeState {
    pub(crate) retry: Option<RetrySlot>,
    pub(crate) next_retry_id: u64,
    pub(crate) tasks: Vec<EntryTask>,
    pub(crate) background_tasks: Vec<EntryTask>,
    pub(crate) on_unload: Vec<UnloadCallback>,
    pub(crate) update_listeners: Vec<(u64, UpdateListener)>,
    pub(crate) next_listener_id: u64,
    pub(crate) reload: Option<(u64, SharedReload)>,
    pub(crate) reload_generation: u64,
}

/// Runtime state shared by all snapshots of one config entry
#[derive(Default)]
pub struct EntryRuntime {
    /// Serializes setup, unload, reload and removal of this entry
    pub(crate) setup_lock: tokio::sync::Mutex<()>,
    /// Held while deciding whether to start a reauth flow
    pub(crate) reauth_lock: tokio::sync::Mutex<()>,
    pub(crate) reconfigure_lock: tokio::sync::Mutex<()>,
    state: Mutex<RuntimeState>,
}

impl fmt::Debug for EntryRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("EntryRuntime")
            .field("retry_scheduled", &state.retry.is_some())
            .field("tasks", &state.tasks.len())
            .field("background_tasks", &state.background_tasks.len())
            .field("on_unload", &state.on_unload.len())
            .field("update_listeners", &state.update_listeners.len())
            .finish()
    }
}

impl EntryRuntime {
    pub(crate) fn lock(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a retry, replacing (and cancelling) any previous one
    pub(crate) fn set_retry(&self, cancel: CancellationToken, wait: Duration) -> u64 {
        let mut state = self.lock();
        state.next_retry_id += 1;
        let id = state.next_retry_id;
        if let Some(previous) = state.retry.replace(RetrySlot { id, cancel, wait }) {
            previous.cancel.cancel();
        }
        id
    }

    /// Clear the retry slot if it still holds retry `id`
    pub(crate) fn clear_retry(&self, id: u64) {
        let mut state = self.lock();
        if state.retry.as_ref().is_some_and(|slot| slot.id == id) {
            state.retry = None;
        }
    }

    /// Cancel the pending retry, if any
    pub(crate) fn cancel_retry(&self) -> bool {
        match self.lock().retry.take() {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn retry_wait(&self) -> Option<Duration> {
        self.lock().retry.as_ref().map(|slot| slot.wait)
    }

    pub(crate) fn push_task(&self, name: String, handle: JoinHandle<()>, background: bool) {
        let mut state = self.lock();
        let list = if background {
            &mut state.background_tasks
        } else {
            &mut state.tasks
        };
        list.retain(|task| !task.handle.is_finished());
        list.push(EntryTask { name, handle });
    }

    pub(crate) fn push_on_unload(&self, callback: UnloadCallback) {
        self.lock().on_unload.push(callback);
    }

    pub(crate) fn add_update_listener(&self, listener: UpdateListener) -> u64 {
        let mut state = self.lock();
        state.next_listener_id += 1;
        let id = state.next_listener_id;
        state.update_listeners.push((id, listener));
        id
    }

    pub(crate) fn remove_update_listener(&self, id: u64) {
        self.lock()
            .update_listeners
            .retain(|(listener_id, _)| *listener_id != id);
    }

    pub(crate) fn update_listeners(&self) -> Vec<UpdateListener> {
        self.lock()
            .update_listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    /// Take all unload callbacks, most recently registered first
    pub(crate) fn take_on_unload(&self) -> Vec<UnloadCallback> {
        let mut callbacks = std::mem::take(&mut self.lock().on_unload);
        callbacks.reverse();
        callbacks
    }

    pub(crate) fn take_tasks(&self) -> (Vec<EntryTask>, Vec<EntryTask>) {
        let mut state = self.lock();
        (
            std::mem::take(&mut state.tasks),
            std::mem::take(&mut state.background_tasks),
        )
    }

    pub(crate) fn pending_task_count(&self) -> usize {
        self.lock()
            .tasks
            .iter()
            .filter(|task| !task.handle.is_finished())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_retry_cancels_previous() {
        let runtime = EntryRuntime::default();
        let first = CancellationToken::new();
        let first_id = runtime.set_retry(first.clone(), Duration::from_secs(5));
        let second = CancellationToken::new();
        let second_id = runtime.set_retry(second.clone(), Duration::from_secs(10));

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(runtime.retry_wait(), Some(Duration::from_secs(10)));

        // A stale retry cannot clear the newer slot
        runtime.clear_retry(first_id);
        assert!(runtime.retry_wait().is_some());
        runtime.clear_retry(second_id);
        assert!(runtime.retry_wait().is_none());
    }

    #[test]
    fn test_cancel_retry() {
        let runtime = EntryRuntime::default();
        assert!(!runtime.cancel_retry());

        let token = CancellationToken::new();
        runtime.set_retry(token.clone(), Duration::from_secs(5));
        assert!(runtime.cancel_retry());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_on_unload_runs_in_reverse() {
        let runtime = EntryRuntime::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            runtime.push_on_unload(UnloadCallback::Sync(Box::new(move || {
                order.lock().unwrap().push(i);
            })));
        }

        for callback in runtime.take_on_unload() {
            if let UnloadCallback::Sync(callback) = callback {
                callback();
            }
        }
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
        assert!(runtime.take_on_unload().is_empty());
    }
}
