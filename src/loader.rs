//! Single-worker load scheduler.
//!
//! A [`Loader`] runs one [`Loadable`] at a time on a dedicated, named
//! worker thread. Cancellation is level-triggered: `cancel_loading` flags
//! the loadable, whose load loop observes the flag between reads.
//! `release` additionally marks the cancellation as a release and fires a
//! one-shot callback once the worker has stopped.
//!
//! ```text
//! constructed -> opening -> blocked-on-condition -> reading
//!                                   -> (canceled | completed | errored)
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Result, StreamError};

/// A unit of loading work hosted by a [`Loader`].
pub trait Loadable: Send + Sync {
    /// Run the load to completion: open, transfer, close. Invoked on the
    /// worker thread; may be invoked again when the callback elects to
    /// retry.
    fn load(&self) -> Result<()>;

    /// Request cancellation. Must be non-blocking; the load loop observes
    /// it between reads.
    fn cancel_load(&self);
}

/// Verdict from [`LoaderCallback::on_load_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadErrorAction {
    Retry,
    DontRetry,
}

/// Receives the terminal outcome of a load. Invoked on the worker thread.
pub trait LoaderCallback: Send + Sync {
    fn on_load_completed(&self, loadable: Arc<dyn Loadable>, load_duration: Duration);

    /// `released` distinguishes a release-triggered cancel from an
    /// ordinary one; the latter is the transport-failover signal.
    fn on_load_canceled(&self, loadable: Arc<dyn Loadable>, load_duration: Duration, released: bool);

    fn on_load_error(
        &self,
        loadable: Arc<dyn Loadable>,
        load_duration: Duration,
        error: &StreamError,
        error_count: u32,
    ) -> LoadErrorAction;
}

struct CurrentLoad {
    loadable: Arc<dyn Loadable>,
    canceled: AtomicBool,
    released: AtomicBool,
}

struct LoaderState {
    current: Option<Arc<CurrentLoad>>,
    fatal_error: Option<StreamError>,
    on_released: Option<Box<dyn FnOnce() + Send>>,
    released: bool,
}

struct LoaderInner {
    name: String,
    min_retry_delay: Duration,
    state: Mutex<LoaderState>,
}

/// Schedules one loadable at a time on a named worker thread.
pub struct Loader {
    inner: Arc<LoaderInner>,
}

impl Loader {
    pub fn new(name: impl Into<String>, min_retry_delay: Duration) -> Self {
        Loader {
            inner: Arc::new(LoaderInner {
                name: name.into(),
                min_retry_delay,
                state: Mutex::new(LoaderState {
                    current: None,
                    fatal_error: None,
                    on_released: None,
                    released: false,
                }),
            }),
        }
    }

    /// Start loading. Panics if a load is already in flight; callers must
    /// cancel and wait for the terminal callback first.
    pub fn start_loading(
        &self,
        loadable: Arc<dyn Loadable>,
        callback: Arc<dyn LoaderCallback>,
    ) -> Result<()> {
        let current = Arc::new(CurrentLoad {
            loadable,
            canceled: AtomicBool::new(false),
            released: AtomicBool::new(false),
        });
        {
            let mut state = self.inner.state.lock();
            if state.released {
                tracing::debug!(loader = %self.inner.name, "start_loading after release ignored");
                return Ok(());
            }
            assert!(state.current.is_none(), "loader is already loading");
            state.current = Some(current.clone());
        }

        let inner = self.inner.clone();
        thread::Builder::new()
            .name(self.inner.name.clone())
            .spawn(move || run_load(inner, current, callback))?;
        Ok(())
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.lock().current.is_some()
    }

    /// Cancel the in-flight load, if any. The terminal callback arrives
    /// as `on_load_canceled(released = false)`.
    pub fn cancel_loading(&self) {
        let current = self.inner.state.lock().current.clone();
        if let Some(current) = current {
            current.canceled.store(true, Ordering::SeqCst);
            current.loadable.cancel_load();
        }
    }

    /// Release the loader. Any in-flight load is canceled with
    /// `released = true`; `on_released` fires once the worker has stopped
    /// (immediately when idle). Subsequent `start_loading` calls are
    /// ignored.
    pub fn release(&self, on_released: Option<Box<dyn FnOnce() + Send>>) {
        let immediate = {
            let mut state = self.inner.state.lock();
            state.released = true;
            match &state.current {
                Some(current) => {
                    current.released.store(true, Ordering::SeqCst);
                    current.canceled.store(true, Ordering::SeqCst);
                    current.loadable.cancel_load();
                    state.on_released = on_released;
                    None
                }
                None => on_released,
            }
        };
        if let Some(on_released) = immediate {
            on_released();
        }
    }

    /// Rethrow the error that terminated the last load, if any.
    pub fn maybe_throw_error(&self) -> Result<()> {
        match &self.inner.state.lock().fatal_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

fn run_load(inner: Arc<LoaderInner>, current: Arc<CurrentLoad>, callback: Arc<dyn LoaderCallback>) {
    let mut error_count = 0u32;
    let started = Instant::now();

    let terminal = loop {
        let result = current.loadable.load();
        let duration = started.elapsed();

        if current.canceled.load(Ordering::SeqCst) {
            break Terminal::Canceled {
                duration,
                released: current.released.load(Ordering::SeqCst),
            };
        }

        match result {
            Ok(()) => break Terminal::Completed { duration },
            Err(error) => {
                error_count += 1;
                let action =
                    callback.on_load_error(current.loadable.clone(), duration, &error, error_count);
                match action {
                    LoadErrorAction::Retry => {
                        tracing::debug!(
                            loader = %inner.name,
                            error = %error,
                            retry = error_count,
                            "load failed, retrying"
                        );
                        thread::sleep(inner.min_retry_delay);
                    }
                    LoadErrorAction::DontRetry => break Terminal::Errored { error },
                }
            }
        }
    };

    // Clear the current load before the terminal callback so the callback
    // may start a replacement loadable (transport failover).
    {
        let mut state = inner.state.lock();
        state.current = None;
        if let Terminal::Errored { error } = &terminal {
            state.fatal_error = Some(error.clone());
        }
    }

    match terminal {
        Terminal::Completed { duration } => {
            tracing::debug!(loader = %inner.name, ?duration, "load completed");
            callback.on_load_completed(current.loadable.clone(), duration);
        }
        Terminal::Canceled { duration, released } => {
            tracing::debug!(loader = %inner.name, ?duration, released, "load canceled");
            callback.on_load_canceled(current.loadable.clone(), duration, released);
        }
        Terminal::Errored { .. } => {}
    }

    let on_released = inner.state.lock().on_released.take();
    if let Some(on_released) = on_released {
        on_released();
    }
}

enum Terminal {
    Completed { duration: Duration },
    Canceled { duration: Duration, released: bool },
    Errored { error: StreamError },
}
