//! BLE transport: the async seam and its blocking single-flight adapter.

pub mod adapter;
pub mod transport;

pub use adapter::ConnectionAdapter;
pub use transport::{BleTransport, NotifyCallback, Transport};
