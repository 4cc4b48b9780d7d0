//! Shared test double: a scripted in-memory transport.
//!
//! The mock decodes outbound frames, records them, and plays the device:
//! every command gets an immediate success response (unless scripted
//! otherwise), and tests can inject notifications at will.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rollbot::infrastructure::bluetooth::NotifyCallback;
use rollbot::protocol::packet::{flags, NotificationKey, Packet, PacketCollector};
use rollbot::{Error, Result, Robot, Settings, Transport, ToyModel};
use uuid::Uuid;

type Responder = Box<dyn Fn(&Packet) -> Vec<u8> + Send>;

/// Observable and scriptable state shared between a test and its transport.
pub struct MockState {
    /// Every decoded command the toy stack wrote, in order.
    pub commands: Mutex<Vec<Packet>>,
    callback: Mutex<Option<NotifyCallback>>,
    collector: Mutex<PacketCollector>,
    pub connected: AtomicBool,
    pub fail_connect: AtomicBool,
    /// Commands that get no response at all (for timeout tests).
    pub silent: Mutex<HashSet<(u8, u8)>>,
    /// Commands answered with a device error code.
    pub fail_with: Mutex<HashMap<(u8, u8), u8>>,
    /// Custom response payload per command.
    pub responders: Mutex<HashMap<(u8, u8), Responder>>,
    /// Notifications sent shortly after a command is answered.
    pub follow_ups: Mutex<HashMap<(u8, u8), Vec<Packet>>>,
}

impl MockState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            commands: Mutex::new(Vec::new()),
            callback: Mutex::new(None),
            collector: Mutex::new(PacketCollector::new()),
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            silent: Mutex::new(HashSet::new()),
            fail_with: Mutex::new(HashMap::new()),
            responders: Mutex::new(HashMap::new()),
            follow_ups: Mutex::new(HashMap::new()),
        })
    }

    /// Delivers a frame to the subscribed notification callback.
    pub fn notify(&self, packet: &Packet) {
        let frame = packet.encode();
        let mut callback = self.callback.lock().unwrap();
        if let Some(callback) = callback.as_mut() {
            callback(frame);
        }
    }

    pub fn commands_for(&self, did: u8, cid: u8) -> Vec<Packet> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.did == did && p.cid == cid)
            .cloned()
            .collect()
    }

    pub fn command_count(&self) -> usize {
        self.commands.lock().unwrap().len()
    }
}

/// Builds an asynchronous notification frame for `key`.
pub fn notification(key: NotificationKey, data: Vec<u8>) -> Packet {
    Packet {
        flags: 0,
        target: None,
        source: None,
        did: key.device,
        cid: key.command,
        seq: 0,
        err: None,
        data,
    }
}

fn respond(state: &Arc<MockState>, packet: Packet) {
    let key = (packet.did, packet.cid);
    state.commands.lock().unwrap().push(packet.clone());

    if state.silent.lock().unwrap().contains(&key) {
        return;
    }
    let err = state.fail_with.lock().unwrap().get(&key).copied().unwrap_or(0);
    let data = state
        .responders
        .lock()
        .unwrap()
        .get(&key)
        .map(|responder| responder(&packet))
        .unwrap_or_default();
    state.notify(&Packet {
        flags: flags::IS_RESPONSE,
        target: None,
        source: None,
        did: packet.did,
        cid: packet.cid,
        seq: packet.seq,
        err: Some(err),
        data,
    });

    let follow_ups = state
        .follow_ups
        .lock()
        .unwrap()
        .get(&key)
        .cloned()
        .unwrap_or_default();
    if !follow_ups.is_empty() {
        // Give the caller time to start waiting before the report lands.
        let state = Arc::clone(state);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            for packet in follow_ups {
                state.notify(&packet);
            }
        });
    }
}

pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new(state: &Arc<MockState>) -> Self {
        Self {
            state: Arc::clone(state),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::Connection("mock transport refused".into()));
        }
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.state.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&mut self, _characteristic: Uuid, data: &[u8], _: bool) -> Result<()> {
        if !self.state.connected.load(Ordering::SeqCst) {
            return Err(Error::Transport("mock transport is disconnected".into()));
        }
        let packets = {
            let mut collector = self.state.collector.lock().unwrap();
            let mut packets = Vec::new();
            collector.feed(data, |p| packets.push(p));
            packets
        };
        for packet in packets {
            respond(&self.state, packet);
        }
        Ok(())
    }

    async fn subscribe(&mut self, _characteristic: Uuid, callback: NotifyCallback) -> Result<()> {
        *self.state.callback.lock().unwrap() = Some(callback);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }
}

/// Test settings: fast keep-alive, short timeouts, tiny event pool.
pub fn test_settings() -> Settings {
    Settings {
        response_timeout_ms: 2_000,
        keepalive_interval_ms: 100,
        event_workers: 2,
        event_queue_depth: 32,
        ..Settings::default()
    }
}

/// Activates a robot over a fresh mock transport.
pub fn mock_robot(model: ToyModel) -> (Robot, Arc<MockState>) {
    let state = MockState::new();
    let transport = MockTransport::new(&state);
    let robot = Robot::activate_with(Box::new(transport), model, &test_settings())
        .expect("mock activation succeeds");
    (robot, state)
}

/// Encodes a full streaming notification for the spherical models: gyroscope,
/// attitude, accelerometer, locator, velocity, in wire order. Locator and
/// velocity are raw device units (meters); the API reports centimeters.
pub fn sphere_stream(
    attitude: (f64, f64, f64),
    accel: (f64, f64, f64),
    locator_m: (f64, f64),
) -> Packet {
    let values: Vec<f32> = vec![
        0.0,
        0.0,
        0.0, // gyroscope
        attitude.0 as f32,
        attitude.1 as f32,
        attitude.2 as f32, // attitude: pitch, roll, yaw
        accel.0 as f32,
        accel.1 as f32,
        accel.2 as f32, // accelerometer
        locator_m.0 as f32,
        locator_m.1 as f32, // locator
        0.0,
        0.0, // velocity
    ];
    let mut data = Vec::with_capacity(values.len() * 4);
    for value in values {
        data.extend_from_slice(&value.to_be_bytes());
    }
    notification(
        NotificationKey::new(0x18, 0x02), // sensor streaming report
        data,
    )
}
