//! Hybrid live/simulated telemetry fallback
//!
//! The dashboard must stay alive without hardware. A fixed-interval tick
//! synthesizes plausible tank environment data when either demo mode is
//! active or the controller link is open but has gone quiet past the
//! staleness threshold. Nutrient readings are never auto-simulated; a
//! simulated NPK sample only happens on an explicit user read while in demo
//! mode.

use rand::Rng;
use rand::thread_rng;
use std::sync::Arc;
use tokio::time::{Duration, Instant, interval_at};
use tracing::debug;

use crate::telemetry::{EnvironmentReading, TelemetryStore};

/// Tick period matching the dashboard refresh cadence.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3);
/// Maximum tolerated age of the last real environment update.
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(5);

/// Periodic generator writing simulated environment readings into the store.
pub struct SimulationScheduler {
    store: Arc<TelemetryStore>,
    interval: Duration,
    staleness: Duration,
}

impl SimulationScheduler {
    pub fn new(store: Arc<TelemetryStore>, interval: Duration, staleness: Duration) -> Self {
        Self {
            store,
            interval,
            staleness,
        }
    }

    /// Run forever. The timer is independent of the link read loops and
    /// never blocks on them.
    pub async fn run(self) {
        // First tick after one full period, not immediately.
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        loop {
            ticker.tick().await;
            self.tick();
        }
    }

    fn tick(&self) {
        let snapshot = self.store.snapshot();
        // No real environment data yet counts as stale.
        let stale = self
            .store
            .environment_age()
            .map_or(true, |age| age > self.staleness);

        if !should_simulate(snapshot.demo_mode, snapshot.controller_connected, stale) {
            return;
        }

        let reading = sample_environment(&mut thread_rng());
        debug!(
            methane = reading.methane,
            temperature = reading.temperature,
            humidity = reading.humidity,
            ph = reading.ph,
            "simulated environment reading"
        );
        self.store.set_simulated_environment(reading);
    }
}

/// Gate for one tick: demo mode, or a connected-but-silent controller.
pub fn should_simulate(demo_mode: bool, controller_connected: bool, stale: bool) -> bool {
    demo_mode || (controller_connected && stale)
}

/// Plausible tank environment values, one decimal (two for pH).
pub fn sample_environment<R: Rng>(rng: &mut R) -> EnvironmentReading {
    EnvironmentReading {
        methane: round1(rng.gen_range(100.0..500.0)),
        temperature: round1(rng.gen_range(25.0..35.0)),
        humidity: round1(rng.gen_range(40.0..90.0)),
        ph: round2(rng.gen_range(5.5..8.5)),
    }
}

/// Independently randomized nutrient channels for a demo-mode read.
pub fn sample_nutrients<R: Rng>(rng: &mut R) -> (u32, u32, u32) {
    (
        rng.gen_range(20..200),
        rng.gen_range(10..100),
        rng.gen_range(50..300),
    )
}

fn round1(v: f32) -> f32 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f32) -> f32 {
    (v * 100.0).round() / 100.0
}
