//! Capability tables for the supported toy models.
//!
//! Everything that varies between models is looked up here at construction
//! time: spin timing, speed curves, LED slots and aliasing, the sensor
//! catalog with streaming masks, and which animatronic features exist.

use crate::domain::leds::LedChannel;
use crate::domain::sensors::SensorKind;

/// The toy models this crate can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToyModel {
    Sphero,
    Ollie,
    Bb8,
    Bb9e,
    R2d2,
    R2q5,
    Bolt,
    Mini,
    Rvr,
}

/// One float of a streaming notification: its mask bit and unit scale.
#[derive(Debug, Clone, Copy)]
pub struct ComponentSpec {
    pub mask: u32,
    pub scale: f64,
}

const fn comp(mask: u32) -> ComponentSpec {
    ComponentSpec { mask, scale: 1.0 }
}

/// Locator and velocity stream in meters; the API speaks centimeters.
const fn comp_cm(mask: u32) -> ComponentSpec {
    ComponentSpec { mask, scale: 100.0 }
}

/// A named sensor and its wire components, in wire order.
#[derive(Debug, Clone, Copy)]
pub struct SensorSpec {
    pub kind: SensorKind,
    pub components: &'static [ComponentSpec],
}

/// Where an LED channel lives in the 16-bit LED mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedSlot {
    /// Three consecutive slots starting here: red, green, blue.
    Rgb(u8),
    /// A single brightness slot.
    Single(u8),
}

/// Static description of one model.
#[derive(Debug)]
pub struct ModelCaps {
    pub model: ToyModel,
    pub name: &'static str,
    /// Seconds one full revolution takes when spinning in place.
    pub time_per_rev: f64,
    /// The Mini's firmware expects a compressed speed range.
    pub remap_speed: bool,
    /// Whether the model accepts the stabilization command.
    pub sends_stabilization: bool,
    pub legged: bool,
    pub has_dome: bool,
    /// Highest valid animation id, if the model plays animations.
    pub animations: Option<u16>,
    /// Highest valid sound id, if the model has a speaker.
    pub sounds: Option<u16>,
    pub sensors: &'static [SensorSpec],
    pub extended_sensors: &'static [SensorSpec],
    pub led_layout: &'static [(LedChannel, LedSlot)],
    /// Channels mirroring a main-LED write on this model.
    pub main_led_aliases: &'static [LedChannel],
}

impl ModelCaps {
    pub fn of(model: ToyModel) -> &'static ModelCaps {
        match model {
            ToyModel::Sphero => &SPHERO,
            ToyModel::Ollie => &OLLIE,
            ToyModel::Bb8 => &BB8,
            ToyModel::Bb9e => &BB9E,
            ToyModel::R2d2 => &R2D2,
            ToyModel::R2q5 => &R2Q5,
            ToyModel::Bolt => &BOLT,
            ToyModel::Mini => &MINI,
            ToyModel::Rvr => &RVR,
        }
    }

    pub fn led_slot(&self, channel: LedChannel) -> Option<LedSlot> {
        self.led_layout
            .iter()
            .find(|(ch, _)| *ch == channel)
            .map(|(_, slot)| *slot)
    }

    /// Every sensor kind this model can stream.
    pub fn sensor_kinds(&self) -> Vec<SensorKind> {
        self.sensors
            .iter()
            .chain(self.extended_sensors)
            .map(|spec| spec.kind)
            .collect()
    }

    /// Model-specific speed curve applied to user speeds.
    pub fn adjust_speed(&self, speed: i16) -> i16 {
        if !self.remap_speed || speed == 0 {
            return speed;
        }
        let shifted = if speed > 0 {
            speed as f64 + 126.0
        } else {
            speed as f64 - 126.0
        };
        (shifted * 2.0 / 3.0).round() as i16
    }
}

const ATTITUDE: SensorSpec = SensorSpec {
    kind: SensorKind::Attitude,
    components: &[comp(0x0004_0000), comp(0x0002_0000), comp(0x0001_0000)],
};
const ACCELEROMETER: SensorSpec = SensorSpec {
    kind: SensorKind::Accelerometer,
    components: &[comp(0x8000), comp(0x4000), comp(0x2000)],
};
const GYROSCOPE: SensorSpec = SensorSpec {
    kind: SensorKind::Gyroscope,
    components: &[comp(0x0200_0000), comp(0x0100_0000), comp(0x0080_0000)],
};
const AMBIENT_LIGHT: SensorSpec = SensorSpec {
    kind: SensorKind::AmbientLight,
    components: &[comp(0x0008_0000)],
};
const LOCATOR: SensorSpec = SensorSpec {
    kind: SensorKind::Locator,
    components: &[comp_cm(0x40), comp_cm(0x20)],
};
const VELOCITY: SensorSpec = SensorSpec {
    kind: SensorKind::Velocity,
    components: &[comp_cm(0x10), comp_cm(0x8)],
};

/// Spherical models stream the gyroscope in the primary mask.
const SPHERE_SENSORS: &[SensorSpec] = &[GYROSCOPE, ATTITUDE, ACCELEROMETER, LOCATOR, VELOCITY];
/// Droids keep the gyroscope behind the extended mask.
const DROID_SENSORS: &[SensorSpec] = &[ATTITUDE, ACCELEROMETER, LOCATOR, VELOCITY];
const DROID_EXTENDED: &[SensorSpec] = &[GYROSCOPE];
const LIT_SENSORS: &[SensorSpec] = &[
    GYROSCOPE,
    AMBIENT_LIGHT,
    ATTITUDE,
    ACCELEROMETER,
    LOCATOR,
    VELOCITY,
];

const SPHERE_LEDS: &[(LedChannel, LedSlot)] = &[
    (LedChannel::Main, LedSlot::Rgb(0)),
    (LedChannel::Back, LedSlot::Single(3)),
];
const BB9E_LEDS: &[(LedChannel, LedSlot)] = &[
    (LedChannel::Main, LedSlot::Rgb(0)),
    (LedChannel::Back, LedSlot::Single(3)),
    (LedChannel::Dome, LedSlot::Single(4)),
];
const DROID_LEDS: &[(LedChannel, LedSlot)] = &[
    (LedChannel::Front, LedSlot::Rgb(0)),
    (LedChannel::LogicDisplay, LedSlot::Single(3)),
    (LedChannel::Back, LedSlot::Rgb(4)),
    (LedChannel::HoloProjector, LedSlot::Single(7)),
];
const BOLT_LEDS: &[(LedChannel, LedSlot)] = &[
    (LedChannel::Front, LedSlot::Rgb(0)),
    (LedChannel::Back, LedSlot::Rgb(3)),
];
const RVR_LEDS: &[(LedChannel, LedSlot)] = &[
    (LedChannel::Front, LedSlot::Rgb(0)),
    (LedChannel::Back, LedSlot::Rgb(3)),
    (LedChannel::LeftStatus, LedSlot::Rgb(6)),
    (LedChannel::RightStatus, LedSlot::Rgb(9)),
    (LedChannel::BatteryDoorFront, LedSlot::Single(12)),
    (LedChannel::BatteryDoorRear, LedSlot::Single(13)),
    (LedChannel::PowerButtonFront, LedSlot::Single(14)),
    (LedChannel::PowerButtonRear, LedSlot::Single(15)),
];

const DROID_MAIN_ALIASES: &[LedChannel] = &[LedChannel::Front, LedChannel::Back];
const RVR_MAIN_ALIASES: &[LedChannel] = &[
    LedChannel::Front,
    LedChannel::Back,
    LedChannel::LeftStatus,
    LedChannel::RightStatus,
    LedChannel::BatteryDoorFront,
    LedChannel::BatteryDoorRear,
    LedChannel::PowerButtonFront,
    LedChannel::PowerButtonRear,
];

static SPHERO: ModelCaps = ModelCaps {
    model: ToyModel::Sphero,
    name: "Sphero",
    time_per_rev: 0.45,
    remap_speed: false,
    sends_stabilization: true,
    legged: false,
    has_dome: false,
    animations: None,
    sounds: None,
    sensors: SPHERE_SENSORS,
    extended_sensors: &[],
    led_layout: SPHERE_LEDS,
    main_led_aliases: &[],
};

static OLLIE: ModelCaps = ModelCaps {
    model: ToyModel::Ollie,
    name: "Ollie",
    time_per_rev: 0.6,
    remap_speed: false,
    sends_stabilization: true,
    legged: false,
    has_dome: false,
    animations: None,
    sounds: None,
    sensors: SPHERE_SENSORS,
    extended_sensors: &[],
    led_layout: SPHERE_LEDS,
    main_led_aliases: &[],
};

static BB8: ModelCaps = ModelCaps {
    model: ToyModel::Bb8,
    name: "BB-8",
    time_per_rev: 0.45,
    remap_speed: false,
    sends_stabilization: true,
    legged: false,
    has_dome: false,
    animations: Some(55),
    sounds: Some(5513),
    sensors: SPHERE_SENSORS,
    extended_sensors: &[],
    led_layout: SPHERE_LEDS,
    main_led_aliases: &[],
};

static BB9E: ModelCaps = ModelCaps {
    model: ToyModel::Bb9e,
    name: "BB-9E",
    time_per_rev: 0.45,
    remap_speed: false,
    sends_stabilization: true,
    legged: false,
    has_dome: false,
    animations: Some(55),
    sounds: Some(5513),
    sensors: SPHERE_SENSORS,
    extended_sensors: &[],
    led_layout: BB9E_LEDS,
    main_led_aliases: &[],
};

static R2D2: ModelCaps = ModelCaps {
    model: ToyModel::R2d2,
    name: "R2-D2",
    time_per_rev: 0.7,
    remap_speed: false,
    sends_stabilization: false,
    legged: true,
    has_dome: true,
    animations: Some(55),
    sounds: Some(5513),
    sensors: DROID_SENSORS,
    extended_sensors: DROID_EXTENDED,
    led_layout: DROID_LEDS,
    main_led_aliases: DROID_MAIN_ALIASES,
};

static R2Q5: ModelCaps = ModelCaps {
    model: ToyModel::R2q5,
    name: "R2-Q5",
    time_per_rev: 0.7,
    remap_speed: false,
    sends_stabilization: false,
    legged: true,
    has_dome: true,
    animations: Some(55),
    sounds: Some(5513),
    sensors: DROID_SENSORS,
    extended_sensors: DROID_EXTENDED,
    led_layout: DROID_LEDS,
    main_led_aliases: DROID_MAIN_ALIASES,
};

static BOLT: ModelCaps = ModelCaps {
    model: ToyModel::Bolt,
    name: "BOLT",
    time_per_rev: 0.45,
    remap_speed: false,
    sends_stabilization: true,
    legged: false,
    has_dome: false,
    animations: None,
    sounds: None,
    sensors: LIT_SENSORS,
    extended_sensors: &[],
    led_layout: BOLT_LEDS,
    main_led_aliases: DROID_MAIN_ALIASES,
};

static MINI: ModelCaps = ModelCaps {
    model: ToyModel::Mini,
    name: "Mini",
    time_per_rev: 0.5,
    remap_speed: true,
    sends_stabilization: true,
    legged: false,
    has_dome: false,
    animations: None,
    sounds: None,
    sensors: SPHERE_SENSORS,
    extended_sensors: &[],
    led_layout: SPHERE_LEDS,
    main_led_aliases: &[],
};

static RVR: ModelCaps = ModelCaps {
    model: ToyModel::Rvr,
    name: "RVR",
    time_per_rev: 1.5,
    remap_speed: false,
    sends_stabilization: true,
    legged: false,
    has_dome: false,
    animations: None,
    sounds: None,
    sensors: LIT_SENSORS,
    extended_sensors: &[],
    led_layout: RVR_LEDS,
    main_led_aliases: RVR_MAIN_ALIASES,
};
