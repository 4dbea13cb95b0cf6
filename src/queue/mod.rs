#![forbid(unsafe_code)]

//! Durable single-consumer event queue.
//!
//! A [`DurableEventQueue`] owns a FIFO of [`PendingEvent`]s mirrored into the
//! `pendingEvents` list of a [`StateFile`]. One worker thread peeks the head
//! event, hands it to an [`EventHandler`], and only then pops it and persists
//! the shorter list. A crash between apply and pop leaves the event queued, so
//! delivery is at-least-once and handlers must tolerate replays.

mod event;
mod state;

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use tracing::{debug, error, warn};

pub use event::PendingEvent;
pub use state::{StateFile, PENDING_EVENTS, SOURCE_CURSOR, STATE_VERSION};

use crate::types::{FolioError, Result};

/// Processes one event at a time on behalf of a [`DurableEventQueue`].
pub trait EventHandler: Send + 'static {
    /// Applies `event`. Must be safe to run again on an already applied event.
    fn apply(&mut self, event: &PendingEvent) -> Result<()>;
}

impl<F> EventHandler for F
where
    F: FnMut(&PendingEvent) -> Result<()> + Send + 'static,
{
    fn apply(&mut self, event: &PendingEvent) -> Result<()> {
        self(event)
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PendingEvent>,
    accepting: bool,
    stop_requested: bool,
    in_flight: bool,
    stopped: bool,
}

struct Shared {
    name: String,
    state: Arc<StateFile>,
    queue: Mutex<QueueState>,
    wakeup: Condvar,
    progress: Condvar,
}

impl Shared {
    /// Mirrors the in-memory queue into the state file.
    ///
    /// The snapshot is taken under the state file's write lock so concurrent
    /// persists land in queue order.
    fn persist(&self) -> Result<()> {
        self.state.update(|doc| {
            let pending: Vec<Value> = {
                let queue = self.queue.lock();
                queue
                    .pending
                    .iter()
                    .map(serde_json::to_value)
                    .collect::<std::result::Result<_, _>>()?
            };
            doc.insert(PENDING_EVENTS.to_owned(), Value::Array(pending));
            Ok(())
        })
    }

    fn request_stop(&self) {
        let mut queue = self.queue.lock();
        queue.stop_requested = true;
        self.wakeup.notify_all();
    }

    fn mark_stopped(&self) {
        let mut queue = self.queue.lock();
        queue.stopped = true;
        queue.in_flight = false;
        self.progress.notify_all();
        debug!(target: "folio::queue", queue = %self.name, "worker stopped");
    }
}

/// Cloneable handle that asks a queue's worker to exit after its current event.
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<Shared>,
}

impl StopHandle {
    /// Requests the worker to stop at the next safe point.
    pub fn stop(&self) {
        self.shared.request_stop();
    }
}

/// Persisted FIFO of [`PendingEvent`]s drained by a dedicated worker thread.
pub struct DurableEventQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DurableEventQueue {
    /// Restores pending events from `state` and starts the worker.
    ///
    /// Entries that no longer deserialize are dropped with a warning.
    pub fn start<H: EventHandler>(
        name: impl Into<String>,
        state: Arc<StateFile>,
        handler: H,
    ) -> Result<Self> {
        let name = name.into();
        let pending = recover_pending(&name, &state);
        if !pending.is_empty() {
            debug!(
                target: "folio::queue",
                queue = %name,
                pending = pending.len(),
                "recovered pending events"
            );
        }
        let shared = Arc::new(Shared {
            name: name.clone(),
            state,
            queue: Mutex::new(QueueState {
                pending,
                accepting: true,
                ..QueueState::default()
            }),
            wakeup: Condvar::new(),
            progress: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(worker_shared, handler))?;
        debug!(target: "folio::queue", queue = %name, "worker started");
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Name used in logs and as the worker thread name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The state file backing this queue.
    pub fn state(&self) -> &Arc<StateFile> {
        &self.shared.state
    }

    /// Appends `event` and persists the pending list before returning.
    pub fn enqueue(&self, event: PendingEvent) -> Result<()> {
        {
            let mut queue = self.shared.queue.lock();
            if !queue.accepting || queue.stop_requested {
                return Err(FolioError::Closed(self.shared.name.clone()));
            }
            debug!(
                target: "folio::queue",
                queue = %self.shared.name,
                event = %event,
                pending = queue.pending.len() + 1,
                "enqueued event"
            );
            queue.pending.push_back(event);
            self.shared.wakeup.notify_one();
        }
        self.shared.persist()
    }

    /// Stops accepting events. The worker exits once the queue is drained.
    pub fn close_queue(&self) {
        let mut queue = self.shared.queue.lock();
        queue.accepting = false;
        self.shared.wakeup.notify_all();
    }

    /// Asks the worker to exit after the event it is currently applying.
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    /// Handle that can stop this queue from another thread, including from
    /// inside the handler.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Waits for the worker thread to exit.
    pub fn join(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(target: "folio::queue", queue = %self.shared.name, "worker panicked");
                self.shared.mark_stopped();
            }
        }
    }

    /// Blocks until the queue is empty and no event is being applied, or the
    /// worker has stopped.
    pub fn wait_idle(&self) {
        let mut queue = self.shared.queue.lock();
        while !queue.stopped && (queue.in_flight || !queue.pending.is_empty()) {
            self.shared.progress.wait(&mut queue);
        }
    }

    /// Number of events not yet applied.
    pub fn pending_len(&self) -> usize {
        self.shared.queue.lock().pending.len()
    }

    /// Copy of the events not yet applied, head first.
    pub fn pending(&self) -> Vec<PendingEvent> {
        self.shared.queue.lock().pending.iter().cloned().collect()
    }

    /// Whether new events are still accepted.
    pub fn is_accepting(&self) -> bool {
        let queue = self.shared.queue.lock();
        queue.accepting && !queue.stop_requested
    }

    /// Whether the worker has exited.
    pub fn is_stopped(&self) -> bool {
        self.shared.queue.lock().stopped
    }
}

impl Drop for DurableEventQueue {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

fn recover_pending(name: &str, state: &StateFile) -> VecDeque<PendingEvent> {
    let raw = match state.get_raw(PENDING_EVENTS) {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => Vec::new(),
        Some(other) => {
            warn!(
                target: "folio::queue",
                queue = %name,
                found = %other,
                "pending events are not a list; starting empty"
            );
            Vec::new()
        }
    };
    raw.into_iter()
        .enumerate()
        .filter_map(|(idx, value)| match serde_json::from_value(value) {
            Ok(event) => Some(event),
            Err(err) => {
                warn!(
                    target: "folio::queue",
                    queue = %name,
                    index = idx,
                    error = %err,
                    path = %state.path().display(),
                    "ignored corrupt pending event"
                );
                None
            }
        })
        .collect()
}

fn worker_loop<H: EventHandler>(shared: Arc<Shared>, mut handler: H) {
    loop {
        let event = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.stop_requested {
                    drop(queue);
                    shared.mark_stopped();
                    return;
                }
                if let Some(head) = queue.pending.front() {
                    let head = head.clone();
                    queue.in_flight = true;
                    break head;
                }
                if !queue.accepting {
                    drop(queue);
                    shared.mark_stopped();
                    return;
                }
                shared.wakeup.wait(&mut queue);
            }
        };

        debug!(target: "folio::queue", queue = %shared.name, event = %event, "processing event");
        if let Err(err) = handler.apply(&event) {
            error!(
                target: "folio::queue",
                queue = %shared.name,
                event = %event,
                error = %err,
                "processing event failed; dropping it"
            );
        }

        let remaining = {
            let mut queue = shared.queue.lock();
            queue.pending.pop_front();
            queue.pending.len()
        };
        if let Err(err) = shared.persist() {
            error!(
                target: "folio::queue",
                queue = %shared.name,
                error = %err,
                "could not persist pending events"
            );
        }
        if remaining == 0 {
            debug!(target: "folio::queue", queue = %shared.name, pending = 0, "queue drained");
        }

        let mut queue = shared.queue.lock();
        queue.in_flight = false;
        shared.progress.notify_all();
    }
}
