//! Call coalescing with a cooldown
//!
//! Used to merge bursts of discovery flows into a single
//! `config_entry_discovered` event.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

type DebouncedFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct DebounceState {
    timer: Option<JoinHandle<()>>,
    execute_at_end: bool,
    shut_down: bool,
}

struct DebouncerInner {
    cooldown: Duration,
    immediate: bool,
    function: DebouncedFn,
    state: Mutex<DebounceState>,
}

/// Runs `function` at most once per cooldown window.
///
/// With `immediate`, the first call runs right away and opens the window;
/// calls inside the window collapse into one run when it closes.
#[derive(Clone)]
pub struct Debouncer {
    inner: Arc<DebouncerInner>,
}

impl fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Debouncer")
            .field("cooldown", &self.inner.cooldown)
            .field("immediate", &self.inner.immediate)
            .finish()
    }
}

impl Debouncer {
    pub fn new<F>(cooldown: Duration, immediate: bool, function: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(DebouncerInner {
                cooldown,
                immediate,
                function: Arc::new(function),
                state: Mutex::new(DebounceState::default()),
            }),
        }
    }

    /// Request a run
    pub fn call(&self) {
        let run_now = {
            let mut state = self.inner.lock();
            if state.shut_down {
                return;
            }
            if state.timer.is_some() {
                state.execute_at_end = true;
                return;
            }
            if !self.inner.immediate {
                state.execute_at_end = true;
            }
            DebouncerInner::start_timer(&self.inner, &mut state);
            self.inner.immediate
        };
        if run_now {
            (self.inner.function)();
        }
    }

    /// Cancel any pending run and ignore further calls
    pub fn shutdown(&self) {
        let mut state = self.inner.lock();
        state.shut_down = true;
        state.execute_at_end = false;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }
}

impl DebouncerInner {
    fn lock(&self) -> MutexGuard<'_, DebounceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start_timer(inner: &Arc<Self>, state: &mut DebounceState) {
        let timer_inner = Arc::clone(inner);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timer_inner.cooldown).await;
            DebouncerInner::on_timer(&timer_inner);
        }));
    }

    fn on_timer(inner: &Arc<Self>) {
        let run = {
            let mut state = inner.lock();
            state.timer = None;
            if state.shut_down || !state.execute_at_end {
                false
            } else {
                state.execute_at_end = false;
                // Keep the window open after a trailing run
                DebouncerInner::start_timer(inner, &mut state);
                true
            }
        };
        if run {
            (inner.function)();
        }
    }
}
