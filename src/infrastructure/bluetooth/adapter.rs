//! Blocking, single-flight front over the asynchronous transport.
//!
//! The underlying wireless stack is callback-driven and not safe for
//! concurrent access, so the adapter owns a runtime confined to one worker
//! thread and serializes every operation through a single mutex: at most one
//! transport operation is outstanding per connection, and callers get a plain
//! blocking call/return interface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::infrastructure::bluetooth::transport::{NotifyCallback, Transport};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// One physical connection: transport, its execution context, and the
/// single-flight lock.
pub struct ConnectionAdapter {
    runtime: Mutex<Option<Runtime>>,
    transport: Mutex<Box<dyn Transport>>,
    flight: Mutex<()>,
    closed: AtomicBool,
}

/// Guards held for the duration of one serialized transport operation.
struct Flight<'a> {
    _flight: MutexGuard<'a, ()>,
    runtime: MutexGuard<'a, Option<Runtime>>,
    transport: MutexGuard<'a, Box<dyn Transport>>,
}

impl ConnectionAdapter {
    /// Builds the execution context and connects. A connect failure tears the
    /// context down completely before the error propagates.
    pub fn open(mut transport: Box<dyn Transport>) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("rollbot-ble")
            .enable_all()
            .build()
            .map_err(|e| Error::Connection(format!("transport runtime failed to start: {e}")))?;

        if let Err(e) = runtime.block_on(transport.connect()) {
            runtime.shutdown_timeout(SHUTDOWN_GRACE);
            return Err(e);
        }

        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            transport: Mutex::new(transport),
            flight: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Sends `data` to a characteristic.
    pub fn write(&self, characteristic: Uuid, data: &[u8], with_response: bool) -> Result<()> {
        let mut flight = self.begin()?;
        let runtime = flight.runtime.as_ref().ok_or(Error::ConnectionClosed)?;
        runtime.block_on(flight.transport.write(characteristic, data, with_response))
    }

    /// Registers a notification callback for a characteristic.
    pub fn subscribe(&self, characteristic: Uuid, callback: NotifyCallback) -> Result<()> {
        let mut flight = self.begin()?;
        let runtime = flight.runtime.as_ref().ok_or(Error::ConnectionClosed)?;
        runtime.block_on(flight.transport.subscribe(characteristic, callback))
    }

    pub fn is_connected(&self) -> bool {
        let Ok(flight) = self.begin() else {
            return false;
        };
        match flight.runtime.as_ref() {
            Some(runtime) => runtime.block_on(flight.transport.is_connected()),
            None => false,
        }
    }

    /// Tears the connection down: best-effort disconnect, then stops the
    /// execution context and waits for it to quiesce. Calling `close` again
    /// is a no-op.
    pub fn close(&self, disconnect: bool) {
        let _flight = self.flight.lock().unwrap_or_else(|e| e.into_inner());
        self.closed.store(true, Ordering::SeqCst);
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(runtime) = runtime else {
            return;
        };

        if disconnect {
            let mut transport = self.transport.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = runtime.block_on(transport.disconnect()) {
                warn!("disconnect during close failed: {e}");
            }
        }
        runtime.shutdown_timeout(SHUTDOWN_GRACE);
        info!("transport adapter closed");
    }

    fn begin(&self) -> Result<Flight<'_>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        let flight = self.flight.lock().unwrap_or_else(|e| e.into_inner());
        let runtime = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
        if runtime.is_none() {
            return Err(Error::ConnectionClosed);
        }
        let transport = self.transport.lock().unwrap_or_else(|e| e.into_inner());
        Ok(Flight {
            _flight: flight,
            runtime,
            transport,
        })
    }
}

impl Drop for ConnectionAdapter {
    fn drop(&mut self) {
        self.close(true);
    }
}
