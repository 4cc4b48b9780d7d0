//! Discrete toy events and their dispatcher.
//!
//! Callbacks run fire-and-forget on a small fixed worker pool: dispatch never
//! blocks the sensor ingestion path, callbacks are not ordered against each
//! other, and a panicking callback is isolated from the pool and from other
//! callbacks.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::warn;

/// Discrete events a toy session can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Collision,
    Freefall,
    Landing,
    GyroMax,
    Charging,
    NotCharging,
}

/// Identifies one registered callback for unregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHandle(u64);

pub type EventCallback = Arc<dyn Fn() + Send + Sync + 'static>;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Registry plus bounded worker pool for event callbacks.
pub struct EventDispatcher {
    listeners: Mutex<HashMap<EventKind, Vec<(EventHandle, EventCallback)>>>,
    next_id: AtomicU64,
    queue: Mutex<Option<SyncSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EventDispatcher {
    pub fn new(workers: usize, queue_depth: usize) -> Arc<Self> {
        let (tx, rx) = sync_channel::<Job>(queue_depth);
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..workers.max(1))
            .filter_map(|i| {
                let rx = Arc::clone(&rx);
                let spawned = std::thread::Builder::new()
                    .name(format!("rollbot-event-{i}"))
                    .spawn(move || worker_loop(rx));
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        warn!("event worker failed to spawn: {e}");
                        None
                    }
                }
            })
            .collect();

        Arc::new(Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        })
    }

    /// Registers a callback for an event kind.
    pub fn register(&self, kind: EventKind, callback: EventCallback) -> EventHandle {
        let handle = EventHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock_listeners()
            .entry(kind)
            .or_default()
            .push((handle, callback));
        handle
    }

    /// Removes one registration. Unregistering a kind with no registrations
    /// (or an already removed handle) is a no-op.
    pub fn unregister(&self, kind: EventKind, handle: EventHandle) {
        let mut listeners = self.lock_listeners();
        if let Some(entries) = listeners.get_mut(&kind) {
            entries.retain(|(h, _)| *h != handle);
            if entries.is_empty() {
                listeners.remove(&kind);
            }
        }
    }

    /// Queues every callback registered for `kind`. A full queue drops the
    /// dispatch rather than blocking the caller.
    pub fn emit(&self, kind: EventKind) {
        let callbacks: Vec<EventCallback> = self
            .lock_listeners()
            .get(&kind)
            .map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();
        if callbacks.is_empty() {
            return;
        }

        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let Some(queue) = queue.as_ref() else {
            return;
        };
        for callback in callbacks {
            let job: Job = Box::new(move || {
                if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                    warn!(?kind, "event callback panicked");
                }
            });
            match queue.try_send(job) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(?kind, "event queue full, dropping dispatch");
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    fn lock_listeners(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<EventKind, Vec<(EventHandle, EventCallback)>>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        // Closing the queue lets the workers drain and exit.
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).take();
        let handles: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let rx = rx.lock().unwrap_or_else(|e| e.into_inner());
            rx.recv()
        };
        match job {
            Ok(job) => job(),
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn wait_for(predicate: impl Fn() -> bool) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached");
    }

    #[test]
    fn every_listener_fires() {
        let dispatcher = EventDispatcher::new(2, 16);
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            dispatcher.register(
                EventKind::Collision,
                Arc::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        dispatcher.emit(EventKind::Collision);
        wait_for(|| hits.load(Ordering::SeqCst) == 3);
    }

    #[test]
    fn unregister_is_a_no_op_for_unknown_kinds() {
        let dispatcher = EventDispatcher::new(1, 4);
        // Never registered: must not fail.
        dispatcher.unregister(EventKind::GyroMax, EventHandle(99));

        let hits = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&hits);
        let handle = dispatcher.register(
            EventKind::Freefall,
            Arc::new(move || {
                observed.fetch_add(1, Ordering::SeqCst);
            }),
        );
        dispatcher.unregister(EventKind::Freefall, handle);
        dispatcher.emit(EventKind::Freefall);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_callback_does_not_poison_the_pool() {
        let dispatcher = EventDispatcher::new(1, 8);
        dispatcher.register(EventKind::Landing, Arc::new(|| panic!("boom")));
        let hits = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&hits);
        dispatcher.register(
            EventKind::Landing,
            Arc::new(move || {
                observed.fetch_add(1, Ordering::SeqCst);
            }),
        );
        dispatcher.emit(EventKind::Landing);
        dispatcher.emit(EventKind::Landing);
        wait_for(|| hits.load(Ordering::SeqCst) == 2);
    }
}
