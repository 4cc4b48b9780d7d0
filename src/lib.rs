//! High-level control of BLE robotic toys: spherical drones and legged
//! droids.
//!
//! The crate hides an asynchronous, notification-based device protocol
//! behind a synchronous API. A [`Robot`] session wires four layers together:
//!
//! - [`infrastructure::bluetooth::ConnectionAdapter`] turns the
//!   callback-driven transport into blocking, single-flight calls on a
//!   dedicated runtime;
//! - [`toy::CommandChannel`] correlates outbound commands with the
//!   out-of-order notifications the device answers with;
//! - a keep-alive loop re-asserts the commanded motion so the firmware's
//!   drive timeout never stops the toy mid-run;
//! - [`domain::sensors::SensorFusion`] derives vertical acceleration,
//!   freefall/landing and traveled distance from the raw streams and fires
//!   the user's event callbacks.
//!
//! ```no_run
//! use std::time::Duration;
//! use rollbot::{BleTransport, Color, EventKind, Robot, ToyModel};
//!
//! fn main() -> rollbot::Result<()> {
//!     let transport = BleTransport::new("F0:12:34:56:78:9A", Duration::from_secs(5));
//!     let robot = Robot::activate(Box::new(transport), ToyModel::R2d2)?;
//!     robot.set_main_led(Color::new(0, 120, 255))?;
//!     robot.register_event(EventKind::Collision, || println!("bonk"));
//!     robot.roll(90, 180, Duration::from_secs(2))?;
//!     robot.spin(360, Duration::from_secs(1))?;
//!     robot.close()
//! }
//! ```

pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod protocol;
pub mod robot;
pub mod toy;

pub use config::Settings;
pub use domain::events::{EventHandle, EventKind};
pub use domain::leds::{Color, LedChannel};
pub use domain::sensors::{
    Attitude, BatteryState, CollisionData, SensorKind, SensorSnapshot, Vec2, Vec3,
};
pub use error::{Error, Result};
pub use infrastructure::bluetooth::{BleTransport, ConnectionAdapter, Transport};
pub use robot::{Robot, Stance};
pub use toy::{ModelCaps, Toy, ToyModel};
