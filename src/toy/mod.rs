//! Typed command surface of one connected toy.
//!
//! The facade turns API calls into protocol commands through the
//! [`CommandChannel`] and decodes the asynchronous reports (sensor stream,
//! collisions, battery, gyro saturation) for the domain layer.

pub mod channel;
pub mod models;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::domain::leds::{Color, LedChannel};
use crate::domain::sensors::{
    Attitude, BatteryState, CollisionData, SensorKind, SensorUpdate, Vec2, Vec3,
};
use crate::error::{Error, Result};
use crate::infrastructure::bluetooth::transport::uuids;
use crate::infrastructure::bluetooth::ConnectionAdapter;
use crate::protocol::commands::{
    animatronic, api_shell, driving, power, sensor, system_info, user_io, DriveFlag, LegAction,
    RawMotorMode,
};
use crate::protocol::packet::NotificationKey;

pub use channel::{CommandChannel, ListenerId, NotificationCallback};
pub use models::{ModelCaps, ToyModel};

/// What to write to an LED channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedWrite {
    Rgb(Color),
    Level(u8),
}

/// Firmware version triple reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppVersion {
    pub major: u16,
    pub minor: u16,
    pub revision: u16,
}

/// One float of the active streaming layout.
#[derive(Debug, Clone, Copy)]
struct StreamComponent {
    kind: SensorKind,
    scale: f64,
}

/// A connected toy: capability table plus typed commands.
pub struct Toy {
    channel: Arc<CommandChannel>,
    caps: &'static ModelCaps,
    streaming: Arc<Mutex<Vec<StreamComponent>>>,
}

impl Toy {
    /// Attaches the command channel for `model` over an open connection.
    pub fn new(
        adapter: Arc<ConnectionAdapter>,
        model: ToyModel,
        response_timeout: Duration,
    ) -> Result<Self> {
        let channel = CommandChannel::attach(adapter, uuids::API_CHARACTERISTIC, response_timeout)?;
        Ok(Self {
            channel,
            caps: ModelCaps::of(model),
            streaming: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn caps(&self) -> &'static ModelCaps {
        self.caps
    }

    pub fn channel(&self) -> &Arc<CommandChannel> {
        &self.channel
    }

    // --- Core / power -----------------------------------------------------

    pub fn ping(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        Ok(self.channel.execute(api_shell::ping(data))?.data)
    }

    pub fn wake(&self) -> Result<()> {
        self.channel.execute(power::wake()).map(drop)
    }

    pub fn sleep(&self) -> Result<()> {
        self.channel.execute(power::sleep()).map(drop)
    }

    /// Battery voltage in volts.
    pub fn get_battery_voltage(&self) -> Result<f64> {
        let response = self.channel.execute(power::get_battery_voltage())?;
        if response.data.len() < 2 {
            return Err(Error::BadPacket("battery voltage payload too short"));
        }
        let centivolts = u16::from_be_bytes([response.data[0], response.data[1]]);
        Ok(centivolts as f64 / 100.0)
    }

    pub fn get_battery_state(&self) -> Result<BatteryState> {
        let response = self.channel.execute(power::get_battery_state())?;
        response
            .data
            .first()
            .and_then(|&code| BatteryState::from_code(code))
            .ok_or(Error::BadPacket("unknown battery state"))
    }

    pub fn enable_battery_state_notify(&self, enable: bool) -> Result<()> {
        self.channel
            .execute(power::enable_battery_state_notify(enable))
            .map(drop)
    }

    pub fn get_main_app_version(&self) -> Result<AppVersion> {
        let response = self.channel.execute(system_info::get_main_app_version())?;
        if response.data.len() < 6 {
            return Err(Error::BadPacket("version payload too short"));
        }
        let field = |i: usize| u16::from_be_bytes([response.data[i], response.data[i + 1]]);
        Ok(AppVersion {
            major: field(0),
            minor: field(2),
            revision: field(4),
        })
    }

    // --- Driving ----------------------------------------------------------

    /// Drives toward `heading`; negative speeds roll backward.
    pub fn drive_with_heading(&self, speed: i16, heading: u16) -> Result<()> {
        let flag = if speed < 0 {
            DriveFlag::Backward
        } else {
            DriveFlag::Forward
        };
        let magnitude = speed.unsigned_abs().min(255) as u8;
        self.channel
            .execute(driving::drive_with_heading(magnitude, heading % 360, flag))
            .map(drop)
    }

    pub fn set_raw_motors(&self, left: i16, right: i16) -> Result<()> {
        self.channel
            .execute(driving::raw_motors(
                raw_motor_mode(left),
                left.unsigned_abs().min(255) as u8,
                raw_motor_mode(right),
                right.unsigned_abs().min(255) as u8,
            ))
            .map(drop)
    }

    pub fn reset_yaw(&self) -> Result<()> {
        self.channel.execute(driving::reset_yaw()).map(drop)
    }

    pub fn set_stabilization(&self, enabled: bool) -> Result<()> {
        self.channel
            .execute(driving::set_stabilization(enabled))
            .map(drop)
    }

    // --- LEDs / audio -----------------------------------------------------

    /// Writes one LED channel. Fails with [`Error::Unsupported`] when the
    /// model has no slot for the channel.
    pub fn set_led(&self, channel: LedChannel, write: LedWrite) -> Result<()> {
        let slot = self.caps.led_slot(channel).ok_or(Error::Unsupported)?;
        let (mask, values): (u16, Vec<u8>) = match (slot, write) {
            (models::LedSlot::Rgb(at), LedWrite::Rgb(color)) => {
                (0b111 << at, vec![color.r, color.g, color.b])
            }
            // Brightness onto an RGB group lights the blue leg only, the way
            // the original tail light behaves.
            (models::LedSlot::Rgb(at), LedWrite::Level(level)) => {
                (0b111 << at, vec![0, 0, level])
            }
            (models::LedSlot::Single(at), LedWrite::Level(level)) => (1 << at, vec![level]),
            (models::LedSlot::Single(_), LedWrite::Rgb(_)) => {
                return Err(Error::InvalidArgument(format!(
                    "{channel:?} is a brightness-only channel"
                )))
            }
        };
        self.channel
            .execute(user_io::set_all_leds(mask, &values))
            .map(drop)
    }

    pub fn play_audio_file(&self, sound: u16) -> Result<()> {
        let max = self.caps.sounds.ok_or(Error::Unsupported)?;
        if sound > max {
            return Err(Error::InvalidArgument(format!(
                "sound {sound} is not valid for {}",
                self.caps.name
            )));
        }
        self.channel
            .execute(user_io::play_audio_file(sound, 0))
            .map(drop)
    }

    pub fn set_audio_volume(&self, volume: u8) -> Result<()> {
        self.channel
            .execute(user_io::set_audio_volume(volume))
            .map(drop)
    }

    // --- Animatronics -----------------------------------------------------

    /// Plays an animation, optionally blocking until the completion report.
    pub fn play_animation(&self, animation: u16, wait: bool) -> Result<()> {
        let max = self.caps.animations.ok_or(Error::Unsupported)?;
        if animation > max {
            return Err(Error::InvalidArgument(format!(
                "animation {animation} is not valid for {}",
                self.caps.name
            )));
        }
        self.channel.execute(animatronic::play_animation(animation))?;
        if wait {
            self.channel
                .wait_for(animatronic::PLAY_ANIMATION_COMPLETE_NOTIFY, None)?;
        }
        Ok(())
    }

    pub fn stop_animation(&self) -> Result<()> {
        self.channel.execute(animatronic::stop_animation()).map(drop)
    }

    pub fn set_head_position(&self, degrees: f64) -> Result<()> {
        if !self.caps.has_dome {
            return Err(Error::Unsupported);
        }
        self.channel
            .execute(animatronic::set_head_position(degrees as f32))
            .map(drop)
    }

    pub fn perform_leg_action(&self, action: LegAction) -> Result<()> {
        if !self.caps.legged {
            return Err(Error::Unsupported);
        }
        self.channel
            .execute(animatronic::perform_leg_action(action))
            .map(drop)
    }

    // --- Sensors ----------------------------------------------------------

    pub fn reset_locator(&self) -> Result<()> {
        self.channel.execute(sensor::reset_locator()).map(drop)
    }

    pub fn enable_gyro_max_notify(&self, enable: bool) -> Result<()> {
        self.channel
            .execute(sensor::enable_gyro_max_notify(enable))
            .map(drop)
    }

    /// Arms collision reporting with the stock impact thresholds.
    pub fn configure_collision_detection(&self) -> Result<()> {
        self.channel
            .execute(sensor::configure_collision_detection(1, 90, 90, 130, 130, 10))
            .map(drop)
    }

    /// Enables streaming for `kinds` and remembers the wire layout so the
    /// notifications can be decoded.
    pub fn start_sensor_streaming(&self, kinds: &[SensorKind], interval_ms: u16) -> Result<()> {
        let mut layout = Vec::new();
        let mut mask = 0u32;
        for spec in self.caps.sensors {
            if !kinds.contains(&spec.kind) {
                continue;
            }
            for component in spec.components {
                mask |= component.mask;
                layout.push(StreamComponent {
                    kind: spec.kind,
                    scale: component.scale,
                });
            }
        }
        let mut extended_mask = 0u32;
        for spec in self.caps.extended_sensors {
            if !kinds.contains(&spec.kind) {
                continue;
            }
            for component in spec.components {
                extended_mask |= component.mask;
                layout.push(StreamComponent {
                    kind: spec.kind,
                    scale: component.scale,
                });
            }
        }

        *self.streaming.lock().unwrap_or_else(|e| e.into_inner()) = layout;
        self.channel
            .execute(sensor::set_streaming_mask(interval_ms, 0, mask))?;
        if extended_mask != 0 {
            self.channel
                .execute(sensor::set_extended_streaming_mask(extended_mask))?;
        }
        debug!(mask, extended_mask, "sensor streaming enabled");
        Ok(())
    }

    // --- Notification listeners -------------------------------------------

    pub fn add_sensor_listener(
        &self,
        callback: impl Fn(SensorUpdate) + Send + Sync + 'static,
    ) -> ListenerId {
        let streaming = Arc::clone(&self.streaming);
        self.channel.add_listener(
            sensor::STREAMING_NOTIFY,
            Arc::new(move |packet| {
                let layout = streaming.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(update) = decode_stream(&layout, &packet.data) {
                    callback(update);
                }
            }),
        )
    }

    pub fn add_collision_listener(
        &self,
        callback: impl Fn(CollisionData) + Send + Sync + 'static,
    ) -> ListenerId {
        self.channel.add_listener(
            sensor::COLLISION_NOTIFY,
            Arc::new(move |packet| match decode_collision(&packet.data) {
                Some(collision) => callback(collision),
                None => warn!("undecodable collision report"),
            }),
        )
    }

    pub fn add_battery_listener(
        &self,
        callback: impl Fn(BatteryState) + Send + Sync + 'static,
    ) -> ListenerId {
        self.channel.add_listener(
            power::BATTERY_STATE_NOTIFY,
            Arc::new(move |packet| {
                if let Some(state) = packet.data.first().and_then(|&c| BatteryState::from_code(c))
                {
                    callback(state);
                }
            }),
        )
    }

    pub fn add_gyro_max_listener(
        &self,
        callback: impl Fn(u8) + Send + Sync + 'static,
    ) -> ListenerId {
        self.channel.add_listener(
            sensor::GYRO_MAX_NOTIFY,
            Arc::new(move |packet| {
                callback(packet.data.first().copied().unwrap_or(0));
            }),
        )
    }

    pub fn remove_listener(&self, key: NotificationKey, id: ListenerId) -> Result<()> {
        self.channel.remove_listener(key, id)
    }
}

fn raw_motor_mode(power: i16) -> RawMotorMode {
    match power {
        0 => RawMotorMode::Off,
        p if p < 0 => RawMotorMode::Reverse,
        _ => RawMotorMode::Forward,
    }
}

/// Decodes one streaming notification against the active layout: big-endian
/// floats, one per enabled component, in layout order.
fn decode_stream(layout: &[StreamComponent], data: &[u8]) -> Option<SensorUpdate> {
    if layout.is_empty() || data.len() != layout.len() * 4 {
        warn!(
            expected = layout.len() * 4,
            got = data.len(),
            "stream notification does not match the enabled layout"
        );
        return None;
    }

    let mut update = SensorUpdate::default();
    let mut at = 0;
    while at < layout.len() {
        let kind = layout[at].kind;
        let mut values = [0.0f64; 3];
        let mut count = 0;
        while at < layout.len() && layout[at].kind == kind && count < 3 {
            let bytes = [
                data[at * 4],
                data[at * 4 + 1],
                data[at * 4 + 2],
                data[at * 4 + 3],
            ];
            values[count] = f32::from_be_bytes(bytes) as f64 * layout[at].scale;
            count += 1;
            at += 1;
        }
        match kind {
            SensorKind::Attitude => {
                update.attitude = Some(Attitude {
                    pitch: values[0],
                    roll: values[1],
                    yaw: values[2],
                })
            }
            SensorKind::Accelerometer => {
                update.accelerometer = Some(Vec3 {
                    x: values[0],
                    y: values[1],
                    z: values[2],
                })
            }
            SensorKind::Gyroscope => {
                update.gyroscope = Some(Vec3 {
                    x: values[0],
                    y: values[1],
                    z: values[2],
                })
            }
            SensorKind::Locator => {
                update.locator = Some(Vec2 {
                    x: values[0],
                    y: values[1],
                })
            }
            SensorKind::Velocity => {
                update.velocity = Some(Vec2 {
                    x: values[0],
                    y: values[1],
                })
            }
            SensorKind::AmbientLight => update.ambient_light = Some(values[0]),
        }
    }
    Some(update)
}

/// Collision report layout: three big-endian impact accelerations, axis bits,
/// three motor powers, speed, and a millisecond timestamp.
fn decode_collision(data: &[u8]) -> Option<CollisionData> {
    if data.len() < 18 {
        return None;
    }
    let u16_at = |i: usize| u16::from_be_bytes([data[i], data[i + 1]]);
    Some(CollisionData {
        acceleration: Vec3 {
            x: u16_at(0) as f64 / 4096.0,
            y: u16_at(2) as f64 / 4096.0,
            z: u16_at(4) as f64 / 4096.0,
        },
        x_axis: data[6] & 1 != 0,
        y_axis: data[6] & 2 != 0,
        power_x: u16_at(7),
        power_y: u16_at(9),
        power_z: u16_at(11),
        speed: data[13],
        time: u32::from_be_bytes([data[14], data[15], data[16], data[17]]) as f64 / 1000.0,
    })
}
