//! Device protocol: wire framing and command builders.

pub mod commands;
pub mod packet;

pub use commands::Command;
pub use packet::{NotificationKey, Packet, PacketCollector};
