//! Command/notification correlation over one connection.
//!
//! Commands are fire-and-forget on the wire; the device answers with
//! asynchronous notifications in whatever order it pleases. The channel keys
//! every outbound command by its sequence number and routes each inbound
//! frame to exactly the right place: responses resolve the pending request
//! with the matching sequence, notifications resolve the oldest waiter for
//! their key and fan out to every registered listener.
//!
//! Waiters on the same key queue FIFO: each matching notification resolves
//! the oldest waiter only, later waiters keep waiting for their own.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::infrastructure::bluetooth::ConnectionAdapter;
use crate::protocol::packet::{NotificationKey, Packet, PacketCollector};
use crate::protocol::Command;

/// Invoked for every notification matching the registered key.
pub type NotificationCallback = Arc<dyn Fn(&Packet) + Send + Sync + 'static>;

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type Pending = HashMap<u8, SyncSender<Result<Packet>>>;
type Waiters = HashMap<NotificationKey, VecDeque<(u64, SyncSender<Packet>)>>;
type Listeners = HashMap<NotificationKey, Vec<(ListenerId, NotificationCallback)>>;

/// Request/response correlation and notification routing for one connection.
pub struct CommandChannel {
    adapter: Arc<ConnectionAdapter>,
    characteristic: Uuid,
    response_timeout: Duration,
    seq: AtomicU8,
    next_id: AtomicU64,
    pending: Mutex<Pending>,
    waiters: Mutex<Waiters>,
    listeners: Mutex<Listeners>,
    closed: AtomicBool,
}

impl CommandChannel {
    /// Creates the channel and subscribes it to the API characteristic.
    pub fn attach(
        adapter: Arc<ConnectionAdapter>,
        characteristic: Uuid,
        response_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let channel = Arc::new(Self {
            adapter,
            characteristic,
            response_timeout,
            seq: AtomicU8::new(0),
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&channel);
        let mut collector = PacketCollector::new();
        channel.adapter.subscribe(
            characteristic,
            Box::new(move |bytes| {
                let Some(channel) = weak.upgrade() else {
                    return;
                };
                collector.feed(&bytes, |packet| channel.dispatch(packet));
            }),
        )?;
        Ok(channel)
    }

    pub fn adapter(&self) -> &Arc<ConnectionAdapter> {
        &self.adapter
    }

    /// Sends a command and blocks until its response arrives, up to the
    /// channel's response timeout.
    pub fn execute(&self, command: Command) -> Result<Packet> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let frame = Packet::request(command.did, command.cid, seq, command.data).encode();

        let (tx, rx) = sync_channel(1);
        if self.lock_pending().insert(seq, tx).is_some() {
            // The sequence space wrapped onto an abandoned request.
            warn!(seq, "superseding stale pending request");
        }

        if let Err(e) = self.adapter.write(self.characteristic, &frame, true) {
            self.lock_pending().remove(&seq);
            return Err(e);
        }

        match rx.recv_timeout(self.response_timeout) {
            Ok(result) => {
                let response = result?;
                match response.err {
                    Some(code) if code != 0 => Err(Error::Command(code)),
                    _ => Ok(response),
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                self.lock_pending().remove(&seq);
                // The response may have been routed right at the deadline;
                // prefer delivering it over reporting a timeout.
                if let Ok(result) = rx.try_recv() {
                    return result.and_then(|response| match response.err {
                        Some(code) if code != 0 => Err(Error::Command(code)),
                        _ => Ok(response),
                    });
                }
                Err(Error::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::ConnectionClosed),
        }
    }

    /// Blocks until a notification with `key` arrives. Waiters queue FIFO per
    /// key; a timeout removes only this waiter.
    pub fn wait_for(&self, key: NotificationKey, timeout: Option<Duration>) -> Result<Packet> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        let timeout = timeout.unwrap_or(self.response_timeout);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = sync_channel(1);
        self.lock_waiters()
            .entry(key)
            .or_default()
            .push_back((id, tx));

        match rx.recv_timeout(timeout) {
            Ok(packet) => Ok(packet),
            Err(RecvTimeoutError::Timeout) => {
                let mut waiters = self.lock_waiters();
                // The notification may have been routed to this slot while we
                // were timing out; prefer delivering it over dropping it.
                if let Ok(packet) = rx.try_recv() {
                    return Ok(packet);
                }
                if let Some(queue) = waiters.get_mut(&key) {
                    queue.retain(|(wid, _)| *wid != id);
                    if queue.is_empty() {
                        waiters.remove(&key);
                    }
                }
                Err(Error::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::ConnectionClosed),
        }
    }

    /// Registers a callback fired for every notification matching `key`,
    /// whether or not a waiter also consumes it.
    pub fn add_listener(&self, key: NotificationKey, callback: NotificationCallback) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock_listeners()
            .entry(key)
            .or_default()
            .push((id, callback));
        id
    }

    /// Removes one listener; fails with [`Error::NotFound`] if it was never
    /// added or already removed.
    pub fn remove_listener(&self, key: NotificationKey, id: ListenerId) -> Result<()> {
        let mut listeners = self.lock_listeners();
        let entries = listeners.get_mut(&key).ok_or(Error::NotFound)?;
        let before = entries.len();
        entries.retain(|(lid, _)| *lid != id);
        if entries.len() == before {
            return Err(Error::NotFound);
        }
        if entries.is_empty() {
            listeners.remove(&key);
        }
        Ok(())
    }

    /// Fails every pending request and waiter; subsequent calls are rejected.
    /// Listener registrations stay intact.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for (_, tx) in self.lock_pending().drain() {
            let _ = tx.try_send(Err(Error::ConnectionClosed));
        }
        // Dropping the senders wakes the waiters with a disconnect.
        self.lock_waiters().clear();
    }

    /// Routes one inbound frame.
    fn dispatch(&self, packet: Packet) {
        if packet.is_response() {
            match self.lock_pending().remove(&packet.seq) {
                Some(tx) => {
                    let _ = tx.try_send(Ok(packet));
                }
                None => debug!(seq = packet.seq, "response without a pending request"),
            }
            return;
        }

        let key = packet.key();
        let waiter = {
            let mut waiters = self.lock_waiters();
            let slot = waiters.get_mut(&key).and_then(VecDeque::pop_front);
            if waiters.get(&key).is_some_and(VecDeque::is_empty) {
                waiters.remove(&key);
            }
            slot
        };
        // Snapshot the listeners so a callback may remove itself.
        let listeners: Vec<NotificationCallback> = self
            .lock_listeners()
            .get(&key)
            .map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();

        if let Some((_, tx)) = waiter {
            let _ = tx.try_send(packet.clone());
        }
        for callback in listeners {
            callback(&packet);
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_waiters(&self) -> MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}
