//! Telemetry state: readings, actuator state, and the shared store
//!
//! `TelemetryStore` is the single source of truth read by the UI layer:
//! - last NPK nutrient reading (nullable timestamp until one arrives)
//! - fermentation tank environment reading (fields update independently)
//! - actuator state (heater relay, grinder and agitator motors)
//! - link status flags (per-role connected, demo mode, last command line)
//!
//! Every mutation is a single synchronous step under one mutex, followed by a
//! bump of a `watch` revision channel so consumers can either poll
//! `snapshot()` or await changes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

/// One committed soil-nutrient measurement.
///
/// `timestamp == None` means no reading has been obtained yet. Overwritten
/// only by a fully-assembled parse or an explicit simulated read.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NutrientReading {
    pub n: u32,
    pub p: u32,
    pub k: u32,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Tank environment reading. Fields update independently and partially.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentReading {
    /// Raw analog methane value (approx ppm).
    pub methane: f32,
    /// Celsius.
    pub temperature: f32,
    /// Percent relative humidity.
    pub humidity: f32,
    pub ph: f32,
}

impl Default for EnvironmentReading {
    fn default() -> Self {
        Self {
            methane: 0.0,
            temperature: 0.0,
            humidity: 0.0,
            ph: 7.0,
        }
    }
}

/// Partial update to the environment reading; absent fields stay unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvironmentPatch {
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub methane: Option<f32>,
    pub ph: Option<f32>,
}

impl EnvironmentPatch {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.humidity.is_none()
            && self.methane.is_none()
            && self.ph.is_none()
    }
}

/// The two controllable motors on the tank controller board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Motor {
    /// Motor A.
    Grinder,
    /// Motor B.
    Agitator,
}

impl Motor {
    /// Wire code used in `MOTOR:` frames.
    pub fn code(self) -> char {
        match self {
            Motor::Grinder => 'A',
            Motor::Agitator => 'B',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MotorDirection {
    Forward,
    Backward,
}

impl MotorDirection {
    /// Wire code used in `MOTOR:` frames.
    pub fn code(self) -> char {
        match self {
            MotorDirection::Forward => 'F',
            MotorDirection::Backward => 'B',
        }
    }
}

/// Commanded state of one motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MotorState {
    pub running: bool,
    pub speed: u8,
    pub direction: MotorDirection,
}

impl Default for MotorState {
    fn default() -> Self {
        // Firmware defaults: full speed, forward, stopped.
        Self {
            running: false,
            speed: 255,
            direction: MotorDirection::Forward,
        }
    }
}

/// Actuator state mirrored to the controller board.
///
/// The heater relay is binary; the grinder and agitator relays carry a
/// direction and a speed. Mutated only by user intents; forced all-off when
/// the controller link tears down, since hardware state cannot be trusted
/// after an unplug.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActuatorState {
    /// Relay 1.
    pub heater_on: bool,
    /// Relay 2 / Motor A.
    pub grinder: MotorState,
    /// Relay 3 / Motor B.
    pub agitator: MotorState,
}

impl ActuatorState {
    pub fn motor(&self, motor: Motor) -> &MotorState {
        match motor {
            Motor::Grinder => &self.grinder,
            Motor::Agitator => &self.agitator,
        }
    }

    fn motor_mut(&mut self, motor: Motor) -> &mut MotorState {
        match motor {
            Motor::Grinder => &mut self.grinder,
            Motor::Agitator => &mut self.agitator,
        }
    }
}

/// Which logical serial endpoint a link serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkRole {
    /// NPK soil-nutrient sensor.
    Sensor,
    /// Fermentation tank controller.
    Controller,
}

impl LinkRole {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkRole::Sensor => "sensor",
            LinkRole::Controller => "controller",
        }
    }
}

/// Cloneable view of the whole store, read by the UI layer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub nutrients: NutrientReading,
    pub environment: EnvironmentReading,
    pub actuators: ActuatorState,
    pub sensor_connected: bool,
    pub controller_connected: bool,
    pub demo_mode: bool,
    /// Most recent outbound frame or prepared intent, for the status line.
    pub last_command: Option<String>,
}

struct Inner {
    snapshot: Snapshot,
    /// Monotonic instant of the most recent real environment update.
    env_updated_at: Option<Instant>,
}

/// Shared telemetry state container. Last-writer-wins per field; the only
/// derived rule is the motor speed clamp.
pub struct TelemetryStore {
    inner: Mutex<Inner>,
    revision: watch::Sender<u64>,
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner {
                snapshot: Snapshot::default(),
                env_updated_at: None,
            }),
            revision,
        }
    }

    /// Current state, cloned out for the UI layer.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.lock().unwrap().snapshot.clone()
    }

    /// Change notification: the receiver resolves whenever any field mutates.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let out = f(&mut self.inner.lock().unwrap());
        self.revision.send_modify(|rev| *rev += 1);
        out
    }

    /// Commit a nutrient reading with a fresh timestamp.
    pub fn commit_nutrients(&self, n: u32, p: u32, k: u32) {
        tracing::info!(n, p, k, "nutrient reading committed");
        self.mutate(|inner| {
            inner.snapshot.nutrients = NutrientReading {
                n,
                p,
                k,
                timestamp: Some(Utc::now()),
            };
        });
    }

    /// Apply a partial environment update and refresh the staleness marker.
    ///
    /// An empty patch still refreshes the marker: the JSON path fires on key
    /// presence, not on numeric content.
    pub fn apply_environment(&self, patch: EnvironmentPatch) {
        self.mutate(|inner| {
            let env = &mut inner.snapshot.environment;
            if let Some(t) = patch.temperature {
                env.temperature = t;
            }
            if let Some(h) = patch.humidity {
                env.humidity = h;
            }
            if let Some(g) = patch.methane {
                env.methane = g;
            }
            if let Some(ph) = patch.ph {
                env.ph = ph;
            }
            inner.env_updated_at = Some(Instant::now());
        });
    }

    /// Overwrite the whole environment reading with simulated values without
    /// touching the staleness marker (simulated data must not mask a stale
    /// link).
    pub fn set_simulated_environment(&self, reading: EnvironmentReading) {
        self.mutate(|inner| {
            inner.snapshot.environment = reading;
        });
    }

    /// Age of the last real environment update, if any arrived yet.
    pub fn environment_age(&self) -> Option<tokio::time::Duration> {
        self.inner
            .lock()
            .unwrap()
            .env_updated_at
            .map(|at| at.elapsed())
    }

    pub fn set_heater(&self, on: bool) {
        self.mutate(|inner| inner.snapshot.actuators.heater_on = on);
    }

    pub fn set_motor_running(&self, motor: Motor, running: bool) {
        self.mutate(|inner| inner.snapshot.actuators.motor_mut(motor).running = running);
    }

    /// Clamps to the 8-bit PWM range.
    pub fn set_motor_speed(&self, motor: Motor, speed: i64) {
        let clamped = speed.clamp(0, 255) as u8;
        self.mutate(|inner| inner.snapshot.actuators.motor_mut(motor).speed = clamped);
    }

    pub fn set_motor_direction(&self, motor: Motor, direction: MotorDirection) {
        self.mutate(|inner| inner.snapshot.actuators.motor_mut(motor).direction = direction);
    }

    /// Force every actuator off. Used on controller teardown.
    pub fn reset_actuators(&self) {
        self.mutate(|inner| {
            let act = &mut inner.snapshot.actuators;
            act.heater_on = false;
            act.grinder.running = false;
            act.agitator.running = false;
        });
    }

    pub fn set_connected(&self, role: LinkRole, connected: bool) {
        self.mutate(|inner| match role {
            LinkRole::Sensor => inner.snapshot.sensor_connected = connected,
            LinkRole::Controller => inner.snapshot.controller_connected = connected,
        });
    }

    pub fn set_demo_mode(&self, demo: bool) {
        self.mutate(|inner| inner.snapshot.demo_mode = demo);
    }

    pub fn set_last_command(&self, line: impl Into<String>) {
        self.mutate(|inner| inner.snapshot.last_command = Some(line.into()));
    }
}
