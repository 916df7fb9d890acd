//! Wrapper runtime plumbing: the dedicated event-loop thread that
//! serializes listener callbacks and posted state transitions, and the
//! open/close condition gating the load loop.

use std::sync::mpsc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

enum Message {
    Run(Box<dyn FnOnce() + Send>),
    Quit,
}

/// Single-threaded FIFO executor. Everything posted runs on one named
/// thread, in posting order.
pub(crate) struct EventLoop {
    sender: mpsc::Sender<Message>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    pub fn new(name: &str) -> std::io::Result<EventLoop> {
        let (sender, receiver) = mpsc::channel::<Message>();
        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(message) = receiver.recv() {
                    match message {
                        Message::Run(task) => task(),
                        Message::Quit => break,
                    }
                }
            })?;
        Ok(EventLoop {
            sender,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Post a task. Tasks posted after [`quit`](Self::quit) are dropped.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        if self.sender.send(Message::Run(Box::new(task))).is_err() {
            tracing::trace!("event posted after loop quit, dropped");
        }
    }

    /// Stop the loop after draining already-posted tasks and join the
    /// worker. Joining is skipped when called from the loop itself.
    /// Idempotent.
    pub fn quit(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = self.sender.send(Message::Quit);
            if worker.thread().id() != std::thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

/// Open/closed gate the loadable blocks on between opening and playback.
///
/// Mirrors a manually-reset condition: `block` parks until the gate is
/// open; `open` releases every waiter and stays open until `close`.
pub(crate) struct LoadCondition {
    open: Mutex<bool>,
    condvar: Condvar,
}

impl LoadCondition {
    pub fn new(open: bool) -> LoadCondition {
        LoadCondition {
            open: Mutex::new(open),
            condvar: Condvar::new(),
        }
    }

    pub fn open(&self) {
        let mut open = self.open.lock();
        *open = true;
        self.condvar.notify_all();
    }

    pub fn close(&self) {
        *self.open.lock() = false;
    }

    /// Park the calling thread until the gate is open.
    pub fn block(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.condvar.wait(&mut open);
        }
    }
}
