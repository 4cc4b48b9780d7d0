//! Sensor snapshot, orientation/acceleration fusion and the fall detector.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::domain::events::{EventDispatcher, EventKind};

/// A non-resting (low-g) spell must last this long before freefall fires.
const FREEFALL_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Tilt angles in degrees as reported by the device IMU.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Attitude {
    pub pitch: f64,
    pub roll: f64,
    pub yaw: f64,
}

/// The sensor streams a model can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    Attitude,
    Accelerometer,
    Gyroscope,
    Locator,
    Velocity,
    AmbientLight,
}

/// A partial decode of one streaming notification. A single notification may
/// carry any subset of the sensors.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorUpdate {
    pub attitude: Option<Attitude>,
    pub accelerometer: Option<Vec3>,
    pub gyroscope: Option<Vec3>,
    pub locator: Option<Vec2>,
    pub velocity: Option<Vec2>,
    pub ambient_light: Option<f64>,
}

/// Latest reading per sensor plus the derived signals. Never reset during a
/// session; `distance` only ever grows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorSnapshot {
    pub attitude: Option<Attitude>,
    pub accelerometer: Option<Vec3>,
    pub gyroscope: Option<Vec3>,
    pub locator: Option<Vec2>,
    pub velocity: Option<Vec2>,
    pub ambient_light: Option<f64>,
    pub vertical_accel: Option<f64>,
    pub distance: f64,
}

/// Decoded collision report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollisionData {
    pub acceleration: Vec3,
    pub x_axis: bool,
    pub y_axis: bool,
    pub power_x: u16,
    pub power_y: u16,
    pub power_z: u16,
    pub speed: u8,
    pub time: f64,
}

/// Battery charge condition as reported by the power subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryState {
    Charged,
    Charging,
    NotCharging,
    Ok,
    Low,
    Critical,
}

impl BatteryState {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Charged),
            1 => Some(Self::Charging),
            2 => Some(Self::NotCharging),
            3 => Some(Self::Ok),
            4 => Some(Self::Low),
            5 => Some(Self::Critical),
            _ => None,
        }
    }

    pub fn is_charging(self) -> bool {
        matches!(self, Self::Charged | Self::Charging)
    }
}

type Mat3 = [[f64; 3]; 3];

fn rot_x(angle: f64) -> Mat3 {
    let (s, c) = angle.sin_cos();
    [[1.0, 0.0, 0.0], [0.0, c, -s], [0.0, s, c]]
}

fn rot_y(angle: f64) -> Mat3 {
    let (s, c) = angle.sin_cos();
    [[c, 0.0, s], [0.0, 1.0, 0.0], [-s, 0.0, c]]
}

fn rot_z(angle: f64) -> Mat3 {
    let (s, c) = angle.sin_cos();
    [[c, -s, 0.0], [s, c, 0.0], [0.0, 0.0, 1.0]]
}

fn mat_mul(a: &Mat3, b: &Mat3) -> Mat3 {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

/// Applies the transpose (inverse, for rotations) of `m` to `v`.
fn mat_apply_transposed(m: &Mat3, v: [f64; 3]) -> [f64; 3] {
    let mut out = [0.0; 3];
    for (j, cell) in out.iter_mut().enumerate() {
        *cell = (0..3).map(|i| m[i][j] * v[i]).sum();
    }
    out
}

/// Gravity-frame vertical acceleration in g.
///
/// Rotates the raw accelerometer vector back through the device attitude
/// (z-x-y composition over roll/pitch/yaw, degrees) and projects it onto the
/// vertical axis. Upright and at rest this reads +1.
pub fn vertical_acceleration(attitude: Attitude, accel: Vec3) -> f64 {
    let roll = attitude.roll.to_radians();
    let pitch = attitude.pitch.to_radians();
    let yaw = attitude.yaw.to_radians();
    let rotation = mat_mul(&rot_y(yaw), &mat_mul(&rot_x(pitch), &rot_z(roll)));
    let world = mat_apply_transposed(&rotation, [accel.x, -accel.z, accel.y]);
    -world[1]
}

/// What one fall-detector step observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FallTransition {
    pub freefall: bool,
    pub landing: bool,
}

/// Hysteresis state machine for freefall/landing detection.
///
/// The vertical estimate is low-passed with a 1/4 weight on each new sample.
/// A sustained low-g spell longer than [`FREEFALL_DELAY`] signals freefall
/// once; the matching landing fires when the signal spikes back out of the
/// low-g band while a landing is pending.
#[derive(Debug)]
pub struct FallState {
    smoothed: f64,
    last_supported: Instant,
    freefalling: bool,
    landing_pending: bool,
}

impl FallState {
    pub fn new(now: Instant) -> Self {
        Self {
            smoothed: 1.0,
            last_supported: now,
            freefalling: false,
            landing_pending: false,
        }
    }

    pub fn step(&mut self, accel: f64, stabilized: bool, now: Instant) -> FallTransition {
        self.smoothed = (self.smoothed + 3.0 * accel) / 4.0;

        // With the control system on the smoothed estimate is trustworthy;
        // without it the raw sample is the better low-g indicator.
        let low_g = if stabilized {
            self.smoothed.abs() < 0.5
        } else {
            accel.abs() < 0.1
        };

        let mut transition = FallTransition::default();
        if low_g {
            if now.duration_since(self.last_supported) > FREEFALL_DELAY && !self.freefalling {
                self.freefalling = true;
                self.landing_pending = true;
                transition.freefall = true;
            }
        } else {
            self.last_supported = now;
            self.freefalling = false;
        }

        let impact = if stabilized {
            self.smoothed.abs() > 1.1
        } else {
            accel.abs() > 0.8
        };
        if self.landing_pending && impact {
            self.landing_pending = false;
            transition.landing = true;
        }
        transition
    }
}

#[derive(Debug)]
struct Tracked {
    snapshot: SensorSnapshot,
    last_location: Option<Vec2>,
}

/// Merges decoded notifications into the snapshot, derives vertical
/// acceleration and distance, and fires freefall/landing events.
pub struct SensorFusion {
    tracked: Mutex<Tracked>,
    fall: Mutex<FallState>,
    stabilized: Arc<AtomicBool>,
    events: Arc<EventDispatcher>,
}

impl SensorFusion {
    pub fn new(stabilized: Arc<AtomicBool>, events: Arc<EventDispatcher>) -> Self {
        Self {
            tracked: Mutex::new(Tracked {
                snapshot: SensorSnapshot::default(),
                last_location: None,
            }),
            fall: Mutex::new(FallState::new(Instant::now())),
            stabilized,
            events,
        }
    }

    pub fn snapshot(&self) -> SensorSnapshot {
        self.lock_tracked().snapshot.clone()
    }

    /// Folds one partial update into the snapshot and runs the derivations.
    pub fn ingest(&self, update: SensorUpdate) {
        let transition = {
            let mut tracked = self.lock_tracked();
            let snap = &mut tracked.snapshot;
            if let Some(attitude) = update.attitude {
                snap.attitude = Some(attitude);
            }
            if let Some(accel) = update.accelerometer {
                snap.accelerometer = Some(accel);
            }
            if let Some(gyro) = update.gyroscope {
                snap.gyroscope = Some(gyro);
            }
            if let Some(velocity) = update.velocity {
                snap.velocity = Some(velocity);
            }
            if let Some(lux) = update.ambient_light {
                snap.ambient_light = Some(lux);
            }

            let mut transition = FallTransition::default();
            if let (Some(attitude), Some(accel)) = (snap.attitude, snap.accelerometer) {
                let vertical = vertical_acceleration(attitude, accel);
                snap.vertical_accel = Some(vertical);
                let stabilized = self.stabilized.load(Ordering::Relaxed);
                let mut fall = self.fall.lock().unwrap_or_else(|e| e.into_inner());
                transition = fall.step(vertical, stabilized, Instant::now());
            }

            if let Some(location) = update.locator {
                if let Some(previous) = tracked.last_location {
                    let traveled = (location.x - previous.x).hypot(location.y - previous.y);
                    tracked.snapshot.distance += traveled;
                }
                tracked.snapshot.locator = Some(location);
                tracked.last_location = Some(location);
            }
            transition
        };

        if transition.freefall {
            self.events.emit(EventKind::Freefall);
        }
        if transition.landing {
            self.events.emit(EventKind::Landing);
        }
    }

    fn lock_tracked(&self) -> std::sync::MutexGuard<'_, Tracked> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner())
    }
}
