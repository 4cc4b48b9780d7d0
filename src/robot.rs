//! The user-facing robot API: motion, LEDs, sounds, sensors and events.
//!
//! A [`Robot`] owns one toy session. Activation connects, wakes the device,
//! pushes the initial control state, starts the keep-alive loop and arms the
//! notification subscriptions. Deactivation (explicit [`Robot::close`] or
//! drop) stops the loop, puts the device to sleep and disconnects, on every
//! exit path.
//!
//! The device firmware times out a drive command that is not refreshed, so a
//! background loop re-asserts the commanded motion at a fixed cadence. Every
//! motion mutation and every loop tick hold the same guard; the observed
//! command stream always reflects one consistent motion snapshot per send.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::domain::events::{EventDispatcher, EventHandle, EventKind};
use crate::domain::leds::{clamp_channel, Color, LedChannel, LedState};
use crate::domain::motion::{clamp_power, MotionState};
use crate::domain::sensors::{Attitude, SensorFusion, SensorSnapshot, Vec2, Vec3};
use crate::error::{Error, Result};
use crate::infrastructure::bluetooth::{ConnectionAdapter, Transport};
use crate::protocol::commands::LegAction;
use crate::toy::{LedWrite, Toy, ToyModel};

/// Walking stances of the legged droids. Tripod is required for rolling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stance {
    Bipod,
    Tripod,
}

/// Pacing of the spin stepping loop, so it stays well behaved on transports
/// with no write latency.
const SPIN_STEP_PAUSE: Duration = Duration::from_millis(1);
const FADE_STEP_PAUSE: Duration = Duration::from_millis(15);

/// An active toy session.
pub struct Robot {
    toy: Arc<Toy>,
    adapter: Arc<ConnectionAdapter>,
    motion: Arc<Mutex<MotionState>>,
    leds: Mutex<LedState>,
    stabilized: Arc<AtomicBool>,
    fusion: Arc<SensorFusion>,
    events: Arc<EventDispatcher>,
    keepalive: Option<JoinHandle<()>>,
    stop_tx: Option<mpsc::Sender<()>>,
    closed: bool,
}

impl Robot {
    /// Activates a toy session with default settings.
    pub fn activate(transport: Box<dyn Transport>, model: ToyModel) -> Result<Self> {
        Self::activate_with(transport, model, &Settings::default())
    }

    /// Activates a toy session: connect, wake, push the control state, start
    /// the keep-alive loop and subscribe to the notification streams. Any
    /// failure tears the connection down before the error propagates.
    pub fn activate_with(
        transport: Box<dyn Transport>,
        model: ToyModel,
        settings: &Settings,
    ) -> Result<Self> {
        let adapter = Arc::new(ConnectionAdapter::open(transport)?);
        match Self::bring_up(Arc::clone(&adapter), model, settings) {
            Ok(robot) => Ok(robot),
            Err(e) => {
                adapter.close(true);
                Err(e)
            }
        }
    }

    fn bring_up(
        adapter: Arc<ConnectionAdapter>,
        model: ToyModel,
        settings: &Settings,
    ) -> Result<Self> {
        let toy = Arc::new(Toy::new(
            Arc::clone(&adapter),
            model,
            settings.response_timeout(),
        )?);
        let events = EventDispatcher::new(settings.event_workers, settings.event_queue_depth);
        let stabilized = Arc::new(AtomicBool::new(true));
        let fusion = Arc::new(SensorFusion::new(
            Arc::clone(&stabilized),
            Arc::clone(&events),
        ));

        toy.wake()?;
        if toy.caps().sends_stabilization {
            toy.set_stabilization(true)?;
        }
        toy.reset_yaw()?;
        toy.reset_locator()?;

        {
            let fusion = Arc::clone(&fusion);
            toy.add_sensor_listener(move |update| fusion.ingest(update));
        }
        {
            let events = Arc::clone(&events);
            toy.add_collision_listener(move |_| events.emit(EventKind::Collision));
        }
        {
            let events = Arc::clone(&events);
            toy.add_battery_listener(move |state| {
                events.emit(if state.is_charging() {
                    EventKind::Charging
                } else {
                    EventKind::NotCharging
                })
            });
        }
        {
            let events = Arc::clone(&events);
            toy.add_gyro_max_listener(move |_| events.emit(EventKind::GyroMax));
        }

        toy.start_sensor_streaming(&toy.caps().sensor_kinds(), settings.streaming_interval_ms)?;
        toy.configure_collision_detection()?;
        toy.enable_battery_state_notify(true)?;
        toy.enable_gyro_max_notify(true)?;

        let motion = Arc::new(Mutex::new(MotionState::default()));
        let (stop_tx, stop_rx) = mpsc::channel();
        let keepalive = {
            let toy = Arc::clone(&toy);
            let motion = Arc::clone(&motion);
            let interval = settings.keepalive_interval();
            std::thread::Builder::new()
                .name("rollbot-keepalive".into())
                .spawn(move || keepalive_loop(toy, motion, stop_rx, interval))
                .map_err(|e| Error::Connection(format!("keep-alive thread failed: {e}")))?
        };

        info!(model = toy.caps().name, "toy session active");
        Ok(Self {
            toy,
            adapter,
            motion,
            leds: Mutex::new(LedState::default()),
            stabilized,
            fusion,
            events,
            keepalive: Some(keepalive),
            stop_tx: Some(stop_tx),
            closed: false,
        })
    }

    pub fn toy(&self) -> &Toy {
        &self.toy
    }

    pub fn is_connected(&self) -> bool {
        self.adapter.is_connected()
    }

    /// Deactivates the session: stop and join the keep-alive loop, request
    /// device sleep, then disconnect.
    pub fn close(mut self) -> Result<()> {
        self.shutdown_impl()
    }

    fn shutdown_impl(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        info!("deactivating toy session");

        // Hanging up the channel stops the loop; join before touching the
        // transport so no keep-alive races the disconnect.
        self.stop_tx.take();
        if let Some(handle) = self.keepalive.take() {
            let _ = handle.join();
        }

        let slept = self.toy.sleep();
        self.toy.channel().shutdown();
        self.adapter.close(true);
        slept
    }

    // --- Movement ---------------------------------------------------------

    /// Rolls at `speed` toward `heading` for `duration`, then stops. Negative
    /// speeds roll backward. Blocks for the full duration.
    pub fn roll(&self, heading: i32, speed: i32, duration: Duration) -> Result<()> {
        {
            let mut motion = self.lock_motion();
            let speed = self.toy.caps().adjust_speed(clamp_power(speed));
            motion.set_speed(speed as i32);
            motion.set_heading(heading);
            if speed < 0 {
                let new_heading = motion.heading as i32 + 180;
                motion.set_heading(new_heading);
            }
            self.send_drive(&motion)?;
        }
        std::thread::sleep(duration);
        self.stop_roll(None)
    }

    /// Sets a persistent target speed from −255 to 255.
    pub fn set_speed(&self, speed: i32) -> Result<()> {
        let mut motion = self.lock_motion();
        let speed = self.toy.caps().adjust_speed(clamp_power(speed));
        motion.set_speed(speed as i32);
        self.send_drive(&motion)
    }

    /// Stops rolling, optionally settling on a new heading.
    pub fn stop_roll(&self, heading: Option<i32>) -> Result<()> {
        let mut motion = self.lock_motion();
        if let Some(heading) = heading {
            motion.set_heading(heading);
        }
        motion.set_speed(0);
        self.send_drive(&motion)
    }

    /// Points the toy at `heading` (wrapped into 0–359°).
    pub fn set_heading(&self, heading: i32) -> Result<()> {
        let mut motion = self.lock_motion();
        motion.set_heading(heading);
        self.send_drive(&motion)
    }

    /// Spins through `angle` degrees over roughly `duration`.
    ///
    /// The full displacement is always delivered: the duration is raised to
    /// the model's time-per-revolution floor, and the stepping loop keeps
    /// going past the requested duration if the angle is not yet traversed.
    /// Holds the motion guard, and the calling thread, for the whole spin.
    pub fn spin(&self, angle: i32, duration: Duration) -> Result<()> {
        if angle == 0 {
            return Ok(());
        }
        let abs_angle = i64::from(angle.abs());
        let floor = self.toy.caps().time_per_rev * abs_angle as f64 / 360.0;
        let duration = duration.as_secs_f64().max(floor);

        let start = Instant::now();
        let mut traversed: i64 = 0;
        let mut motion = self.lock_motion();
        while traversed < abs_angle {
            let frac = (start.elapsed().as_secs_f64() / duration).min(1.0);
            let delta = (frac * abs_angle as f64).round() as i64 - traversed;
            let step = if angle > 0 { delta } else { -delta };
            let new_heading = motion.heading as i32 + step as i32;
            motion.set_heading(new_heading);
            self.send_drive(&motion)?;
            traversed += delta;
            std::thread::sleep(SPIN_STEP_PAUSE);
        }
        Ok(())
    }

    /// Turns the control system on or off. Re-enabling it clears raw motor
    /// power; target speed needs it on.
    pub fn set_stabilization(&self, enabled: bool) -> Result<()> {
        let mut motion = self.lock_motion();
        motion.set_stabilization(enabled);
        self.stabilized.store(enabled, Ordering::Relaxed);
        if self.toy.caps().sends_stabilization {
            self.toy.set_stabilization(enabled)?;
        }
        Ok(())
    }

    /// Applies raw power to each motor, −255..255 per side. With a duration,
    /// blocks for the hold, then restores stabilization and stops the motors
    /// even if part of the epilogue fails.
    pub fn raw_motor(&self, left: i32, right: i32, duration: Option<Duration>) -> Result<()> {
        let restore = {
            let mut motion = self.lock_motion();
            let restore = motion.stabilization;
            if restore {
                motion.set_stabilization(false);
                self.stabilized.store(false, Ordering::Relaxed);
                if self.toy.caps().sends_stabilization {
                    self.toy.set_stabilization(false)?;
                }
            }
            motion.set_raw_motors(left, right);
            self.send_raw(&motion)?;
            restore
        };

        if let Some(duration) = duration {
            std::thread::sleep(duration);
            let mut motion = self.lock_motion();
            let mut restored = Ok(());
            if restore {
                motion.set_stabilization(true);
                self.stabilized.store(true, Ordering::Relaxed);
                if self.toy.caps().sends_stabilization {
                    restored = self.toy.set_stabilization(true);
                }
            }
            motion.set_raw_motors(0, 0);
            let stopped = self.send_raw(&motion);
            restored.and(stopped)?;
        }
        Ok(())
    }

    /// Re-zeroes the heading so the current direction reads as 0°.
    pub fn reset_aim(&self) -> Result<()> {
        self.toy.reset_yaw()
    }

    // --- Droid moves ------------------------------------------------------

    /// Plays a model animation, stopping any motion first and blocking until
    /// the device reports completion. Models without animations skip
    /// silently; an id the model does not know is rejected.
    pub fn play_animation(&self, animation: u16) -> Result<()> {
        if self.toy.caps().animations.is_none() {
            debug!(animation, "model has no animations, skipping");
            return Ok(());
        }
        {
            let mut motion = self.lock_motion();
            self.stop_all(&mut motion)?;
        }
        self.toy.play_animation(animation, true)
    }

    /// Rotates the droid dome, clamped to −160°..180°. No-op on domeless
    /// models.
    pub fn set_dome_position(&self, angle: f64) -> Result<()> {
        if !self.toy.caps().has_dome {
            return Ok(());
        }
        self.toy.set_head_position(angle.clamp(-160.0, 180.0))
    }

    /// Switches between bipod and tripod stance. No-op on non-legged models.
    pub fn set_stance(&self, stance: Stance) -> Result<()> {
        if !self.toy.caps().legged {
            return Ok(());
        }
        let action = match stance {
            Stance::Bipod => LegAction::TwoLegs,
            Stance::Tripod => LegAction::ThreeLegs,
        };
        self.toy.perform_leg_action(action)
    }

    /// Starts or stops the waddle walk. No-op on non-legged models.
    pub fn set_waddle(&self, waddle: bool) -> Result<()> {
        if !self.toy.caps().legged {
            return Ok(());
        }
        {
            let mut motion = self.lock_motion();
            self.stop_all(&mut motion)?;
        }
        let action = if waddle {
            LegAction::Waddle
        } else {
            LegAction::Stop
        };
        self.toy.perform_leg_action(action)
    }

    /// Plays a model sound. Models without a speaker skip silently; an id the
    /// model does not know is rejected.
    pub fn play_sound(&self, sound: u16) -> Result<()> {
        if self.toy.caps().sounds.is_none() {
            debug!(sound, "model has no speaker, skipping");
            return Ok(());
        }
        self.toy.play_audio_file(sound)
    }

    // --- Lights -----------------------------------------------------------

    /// Sets the main LED color; on some models the write fans out to every
    /// channel aliased to the main group.
    pub fn set_main_led(&self, color: Color) -> Result<()> {
        let caps = self.toy.caps();
        {
            let mut leds = self.lock_leds();
            leds.set_color(LedChannel::Main, color);
            leds.alias_color(caps.main_led_aliases, color);
        }
        if caps.led_slot(LedChannel::Main).is_some() {
            self.toy.set_led(LedChannel::Main, LedWrite::Rgb(color))?;
        }
        for &channel in caps.main_led_aliases {
            if caps.led_slot(channel).is_some() {
                self.toy.set_led(channel, LedWrite::Rgb(color))?;
            }
        }
        Ok(())
    }

    /// Sets the front LED color on models that have one; silently ignored
    /// elsewhere.
    pub fn set_front_led(&self, color: Color) -> Result<()> {
        if self.toy.caps().led_slot(LedChannel::Front).is_none() {
            return Ok(());
        }
        self.lock_leds().set_color(LedChannel::Front, color);
        self.toy.set_led(LedChannel::Front, LedWrite::Rgb(color))
    }

    /// Sets the back LED color on models with an RGB tail; silently ignored
    /// elsewhere.
    pub fn set_back_led(&self, color: Color) -> Result<()> {
        match self.toy.caps().led_slot(LedChannel::Back) {
            Some(crate::toy::models::LedSlot::Rgb(_)) => {
                self.lock_leds().set_color(LedChannel::Back, color);
                self.toy.set_led(LedChannel::Back, LedWrite::Rgb(color))
            }
            _ => Ok(()),
        }
    }

    /// Sets the brightness of the blue aiming tail light.
    pub fn set_back_led_brightness(&self, brightness: i32) -> Result<()> {
        if self.toy.caps().led_slot(LedChannel::Back).is_none() {
            return Ok(());
        }
        let brightness = clamp_channel(brightness);
        self.lock_leds()
            .set_color(LedChannel::Back, Color::new(0, 0, brightness as i32));
        self.toy.set_led(LedChannel::Back, LedWrite::Level(brightness))
    }

    /// Sets the dome LED brightness on a 0–15 scale. No-op on models without
    /// dome LEDs.
    pub fn set_dome_leds(&self, brightness: i32) -> Result<()> {
        if self.toy.caps().led_slot(LedChannel::Dome).is_none() {
            return Ok(());
        }
        let bounded = brightness.clamp(0, 15) as u8;
        self.lock_leds().set_level(LedChannel::Dome, bounded);
        let ranged = (u16::from(bounded) * 255 / 15) as u8;
        self.toy.set_led(LedChannel::Dome, LedWrite::Level(ranged))
    }

    /// Sets the holographic projector brightness. No-op on models without it.
    pub fn set_holo_projector_led(&self, brightness: i32) -> Result<()> {
        self.set_brightness_channel(LedChannel::HoloProjector, brightness)
    }

    /// Sets the logic display brightness. No-op on models without it.
    pub fn set_logic_display_leds(&self, brightness: i32) -> Result<()> {
        self.set_brightness_channel(LedChannel::LogicDisplay, brightness)
    }

    fn set_brightness_channel(&self, channel: LedChannel, brightness: i32) -> Result<()> {
        if self.toy.caps().led_slot(channel).is_none() {
            return Ok(());
        }
        let brightness = clamp_channel(brightness);
        self.lock_leds().set_level(channel, brightness);
        self.toy.set_led(channel, LedWrite::Level(brightness))
    }

    /// Fades the main LED from one color to another over `duration`. Blocks
    /// for the whole fade.
    pub fn fade(&self, from: Color, to: Color, duration: Duration) -> Result<()> {
        let start = Instant::now();
        while !duration.is_zero() {
            let frac = start.elapsed().as_secs_f64() / duration.as_secs_f64();
            if frac >= 1.0 {
                break;
            }
            self.set_main_led(Color::lerp(from, to, frac))?;
            std::thread::sleep(FADE_STEP_PAUSE);
        }
        self.set_main_led(to)
    }

    /// Blinks the main LED `count` times; each blink is lit for `period` and
    /// dark for `period`. Blocks for the whole sequence.
    pub fn strobe(&self, color: Color, period: Duration, count: u32) -> Result<()> {
        for i in 0..count * 2 {
            if i % 2 == 1 {
                self.set_main_led(color)?;
            } else {
                self.set_main_led(Color::BLACK)?;
            }
            std::thread::sleep(period);
        }
        Ok(())
    }

    // --- Sensors ----------------------------------------------------------

    pub fn snapshot(&self) -> SensorSnapshot {
        self.fusion.snapshot()
    }

    /// Acceleration along each axis in g.
    pub fn get_acceleration(&self) -> Option<Vec3> {
        self.fusion.snapshot().accelerometer
    }

    /// Up/down acceleration regardless of orientation, in g.
    pub fn get_vertical_acceleration(&self) -> Option<f64> {
        self.fusion.snapshot().vertical_accel
    }

    /// Tilt angles in degrees.
    pub fn get_orientation(&self) -> Option<Attitude> {
        self.fusion.snapshot().attitude
    }

    /// Rotation rates in degrees per second.
    pub fn get_gyroscope(&self) -> Option<Vec3> {
        self.fusion.snapshot().gyroscope
    }

    /// Velocity from the motor encoders in centimeters per second.
    pub fn get_velocity(&self) -> Option<Vec2> {
        self.fusion.snapshot().velocity
    }

    /// Offset from the session origin in centimeters.
    pub fn get_location(&self) -> Option<Vec2> {
        self.fusion.snapshot().locator
    }

    /// Total distance traveled this session, in centimeters.
    pub fn get_distance(&self) -> f64 {
        self.fusion.snapshot().distance
    }

    /// Ambient light in lux, on models with a light sensor.
    pub fn get_luminosity(&self) -> Option<f64> {
        self.fusion.snapshot().ambient_light
    }

    /// Current target speed, as sent to the device.
    pub fn get_speed(&self) -> i16 {
        self.lock_motion().speed
    }

    /// Current target heading in degrees.
    pub fn get_heading(&self) -> u16 {
        self.lock_motion().heading
    }

    pub fn get_main_led(&self) -> Option<Color> {
        self.lock_leds().color(LedChannel::Main)
    }

    pub fn get_front_led(&self) -> Option<Color> {
        self.lock_leds().color(LedChannel::Front)
    }

    pub fn get_back_led(&self) -> Option<Color> {
        self.lock_leds().color(LedChannel::Back)
    }

    pub fn get_dome_leds(&self) -> Option<u8> {
        self.lock_leds().level(LedChannel::Dome)
    }

    pub fn get_holo_projector_led(&self) -> Option<u8> {
        self.lock_leds().level(LedChannel::HoloProjector)
    }

    pub fn get_logic_display_leds(&self) -> Option<u8> {
        self.lock_leds().level(LedChannel::LogicDisplay)
    }

    pub fn get_battery_voltage(&self) -> Result<f64> {
        self.toy.get_battery_voltage()
    }

    // --- Events -----------------------------------------------------------

    /// Registers a callback for a toy event. Callbacks run concurrently on
    /// the event worker pool, with no ordering guarantee.
    pub fn register_event(
        &self,
        kind: EventKind,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> EventHandle {
        self.events.register(kind, Arc::new(callback))
    }

    /// Removes one event registration; a no-op if the kind has none.
    pub fn unregister_event(&self, kind: EventKind, handle: EventHandle) {
        self.events.unregister(kind, handle)
    }

    // --- Internals --------------------------------------------------------

    fn stop_all(&self, motion: &mut MotionState) -> Result<()> {
        if motion.is_driving() {
            motion.set_speed(0);
            self.send_drive(motion)?;
        }
        if motion.has_raw_power() {
            motion.set_raw_motors(0, 0);
            self.send_raw(motion)?;
        }
        Ok(())
    }

    fn send_drive(&self, motion: &MotionState) -> Result<()> {
        self.toy.drive_with_heading(motion.speed, motion.heading)
    }

    fn send_raw(&self, motion: &MotionState) -> Result<()> {
        self.toy.set_raw_motors(motion.raw_left, motion.raw_right)
    }

    fn lock_motion(&self) -> MutexGuard<'_, MotionState> {
        self.motion.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_leds(&self) -> MutexGuard<'_, LedState> {
        self.leds.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Robot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Robot")
            .field("model", &self.toy.caps().model)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Drop for Robot {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown_impl() {
            warn!("session teardown failed: {e}");
        }
    }
}

/// Re-asserts the commanded motion every `interval` until the stop channel
/// hangs up. Each tick holds the motion guard, the same one user commands
/// hold.
fn keepalive_loop(
    toy: Arc<Toy>,
    motion: Arc<Mutex<MotionState>>,
    stop_rx: mpsc::Receiver<()>,
    interval: Duration,
) {
    loop {
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }
        let state = motion.lock().unwrap_or_else(|e| e.into_inner());
        let refreshed = if state.is_driving() {
            toy.drive_with_heading(state.speed, state.heading)
        } else if state.has_raw_power() {
            toy.set_raw_motors(state.raw_left, state.raw_right)
        } else {
            Ok(())
        };
        match refreshed {
            Ok(()) => {}
            Err(Error::ConnectionClosed) => break,
            Err(e) => warn!("keep-alive refresh failed: {e}"),
        }
    }
    debug!("keep-alive loop stopped");
}
