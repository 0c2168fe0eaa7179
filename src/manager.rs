//! Serial connection lifecycle and device control
//!
//! `ConnectionManager` owns up to two concurrent links, the NPK sensor and
//! the tank controller, and for each one runs an indefinite read loop:
//! read a chunk, split on newlines, feed complete lines to the cascade
//! parser, carry the trailing fragment into the next read.
//!
//! Loop termination (EOF, I/O error, or an out-of-band unplug notification)
//! funnels into one idempotent teardown per link: drop the writer, clear the
//! connected flag, and for the controller force every actuator off, since
//! hardware state cannot be trusted after an unplug.
//!
//! Control intents update the store optimistically and write fire-and-forget
//! frames when the controller link is open, so the UI stays responsive while
//! disconnected or in demo mode.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::{motor_frame, relay_frame};
use crate::error::LinkError;
use crate::parser::{FrameParser, FrameUpdate};
use crate::simulation;
use crate::telemetry::{LinkRole, Motor, MotorDirection, TelemetryStore};
use crate::transport::{TransportFactory, TransportReader, TransportWriter};

struct LinkSlot {
    writer: Box<dyn TransportWriter>,
    read_task: JoinHandle<()>,
}

/// Owns the two serial links and translates user intents into frames.
pub struct ConnectionManager {
    store: Arc<TelemetryStore>,
    factory: Arc<dyn TransportFactory>,
    sensor: Mutex<Option<LinkSlot>>,
    controller: Mutex<Option<LinkSlot>>,
}

impl ConnectionManager {
    pub fn new(store: Arc<TelemetryStore>, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            store,
            factory,
            sensor: Mutex::new(None),
            controller: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<TelemetryStore> {
        &self.store
    }

    fn slot(&self, role: LinkRole) -> &Mutex<Option<LinkSlot>> {
        match role {
            LinkRole::Sensor => &self.sensor,
            LinkRole::Controller => &self.controller,
        }
    }

    pub async fn open_sensor_link(self: &Arc<Self>) -> Result<(), LinkError> {
        self.open_link(LinkRole::Sensor).await
    }

    pub async fn open_controller_link(self: &Arc<Self>) -> Result<(), LinkError> {
        self.open_link(LinkRole::Controller).await
    }

    pub async fn close_sensor_link(&self) {
        self.teardown(LinkRole::Sensor, true).await;
    }

    pub async fn close_controller_link(&self) {
        self.teardown(LinkRole::Controller, true).await;
    }

    /// Entry point for transports that deliver an out-of-band unplug event.
    /// Funnels into the same teardown as a failed read.
    pub async fn notify_disconnected(&self, role: LinkRole) {
        warn!(role = role.as_str(), "device reported disconnected");
        self.teardown(role, true).await;
    }

    /// Acquire a transport for the role and start its read loop.
    ///
    /// `Denied` and `Busy` come back to the caller for a user-facing message;
    /// any other open failure (including a cancelled device picker) is a
    /// silent no-op with diagnostic logging. Opening an already-open link is
    /// a no-op.
    async fn open_link(self: &Arc<Self>, role: LinkRole) -> Result<(), LinkError> {
        let mut slot = self.slot(role).lock().await;
        if slot.is_some() {
            debug!(role = role.as_str(), "link already open, ignoring");
            return Ok(());
        }

        let pair = match self.factory.open(role).await {
            Ok(pair) => pair,
            Err(failure) => {
                debug!(role = role.as_str(), ?failure, "open failed");
                return match Option::<LinkError>::from(failure) {
                    Some(err) => {
                        warn!(role = role.as_str(), error = %err, "link open rejected");
                        Err(err)
                    }
                    None => Ok(()),
                };
            }
        };

        self.store.set_connected(role, true);
        self.store.set_demo_mode(false);
        self.store
            .set_last_command(format!("{} link connected", role.as_str()));
        info!(role = role.as_str(), "link connected");

        let manager = Arc::clone(self);
        let read_task = tokio::spawn(manager.read_loop(pair.reader, role));
        *slot = Some(LinkSlot {
            writer: pair.writer,
            read_task,
        });
        Ok(())
    }

    /// Indefinite read loop for one link. The protocol is ASCII, so lossy
    /// UTF-8 decoding per chunk cannot corrupt frames.
    async fn read_loop(self: Arc<Self>, mut reader: Box<dyn TransportReader>, role: LinkRole) {
        let mut parser = FrameParser::new();
        let mut buf = [0u8; 256];
        let mut pending = String::new();

        loop {
            match reader.read_chunk(&mut buf).await {
                Ok(0) => {
                    warn!(role = role.as_str(), "stream ended (EOF)");
                    break;
                }
                Ok(n) => {
                    pending.push_str(&String::from_utf8_lossy(&buf[..n]));
                    while let Some(newline) = pending.find('\n') {
                        let line: String = pending.drain(..=newline).collect();
                        self.handle_line(&mut parser, role, &line);
                    }
                }
                Err(err) => {
                    warn!(role = role.as_str(), error = %err, "read failed");
                    break;
                }
            }
        }

        self.teardown(role, false).await;
    }

    fn handle_line(&self, parser: &mut FrameParser, role: LinkRole, line: &str) {
        let text = line.trim();
        if text.is_empty() {
            return;
        }
        debug!(role = role.as_str(), line = text, "rx");
        self.apply_update(parser.parse_line(text));
    }

    fn apply_update(&self, update: Option<FrameUpdate>) {
        match update {
            Some(FrameUpdate::Nutrient { n, p, k }) => self.store.commit_nutrients(n, p, k),
            Some(FrameUpdate::Environment(patch)) => self.store.apply_environment(patch),
            Some(FrameUpdate::Both {
                n,
                p,
                k,
                environment,
            }) => {
                self.store.commit_nutrients(n, p, k);
                self.store.apply_environment(environment);
            }
            // Matched no grammar rule: normal chatter, discarded silently.
            None => {}
        }
    }

    /// Tear down one link exactly once. Safe to call from both the read
    /// loop's own failure path and the close/unplug handlers.
    async fn teardown(&self, role: LinkRole, abort_reader: bool) {
        let Some(link) = self.slot(role).lock().await.take() else {
            debug!(role = role.as_str(), "teardown skipped, link already closed");
            return;
        };

        if abort_reader {
            link.read_task.abort();
        }
        drop(link.writer);

        self.store.set_connected(role, false);
        if role == LinkRole::Controller {
            // Actuator state cannot reflect hardware after an unplug.
            self.store.reset_actuators();
        }
        info!(role = role.as_str(), "link closed");
    }

    /// Toggle the heater relay (relay 1). Emits `RELAY:<0|1>`.
    pub async fn toggle_heater(&self, on: bool) {
        self.store.set_heater(on);
        self.write_controller(&relay_frame(on)).await;
    }

    /// Start or stop a motor (relays 2/3). Always emits a full-state frame.
    pub async fn toggle_motor(&self, motor: Motor, running: bool) {
        self.store.set_motor_running(motor, running);
        self.send_motor_frame(motor).await;
    }

    /// Change a motor's direction. Re-emits the full frame only while the
    /// motor runs; otherwise the stored state waits for the next start.
    pub async fn set_motor_direction(&self, motor: Motor, direction: MotorDirection) {
        self.store.set_motor_direction(motor, direction);
        if self.store.snapshot().actuators.motor(motor).running {
            self.send_motor_frame(motor).await;
        } else {
            self.store.set_last_command(format!(
                "prepared: {:?} direction -> {}",
                motor,
                direction.code()
            ));
        }
    }

    /// Change a motor's speed (clamped to 0..=255); same emit rule as
    /// direction changes.
    pub async fn set_motor_speed(&self, motor: Motor, speed: i64) {
        self.store.set_motor_speed(motor, speed);
        let state = *self.store.snapshot().actuators.motor(motor);
        if state.running {
            self.send_motor_frame(motor).await;
        } else {
            self.store.set_last_command(format!(
                "prepared: {:?} speed -> {} (wait for start)",
                motor, state.speed
            ));
        }
    }

    async fn send_motor_frame(&self, motor: Motor) {
        let frame = motor_frame(motor, self.store.snapshot().actuators.motor(motor));
        self.write_controller(&frame).await;
    }

    /// Request a fresh NPK measurement.
    ///
    /// With the sensor link open this writes the firmware's `READ_NPK`
    /// request; in demo mode it commits one simulated reading; otherwise it
    /// is a no-op.
    pub async fn request_nutrient_read(&self) {
        let mut slot = self.sensor.lock().await;
        if let Some(link) = slot.as_mut() {
            self.store.set_last_command("sent sensor: READ_NPK");
            if let Err(err) = link.writer.write_frame("READ_NPK\n").await {
                warn!(error = %err, "sensor write failed");
                drop(slot);
                self.teardown(LinkRole::Sensor, true).await;
            }
            return;
        }
        drop(slot);

        if self.store.snapshot().demo_mode {
            let (n, p, k) = simulation::sample_nutrients(&mut rand::thread_rng());
            self.store.commit_nutrients(n, p, k);
            self.store.set_last_command("demo: simulated NPK reading");
        }
    }

    /// Enter demo mode: close both links and synthesize telemetry instead.
    pub async fn enable_demo_mode(&self) {
        self.close_sensor_link().await;
        self.close_controller_link().await;
        self.store.set_demo_mode(true);
        self.store.set_last_command("demo mode: connection simulated");
        info!("demo mode enabled");
    }

    /// Write one frame to the controller if it is open. State was already
    /// updated optimistically, so a closed link only skips the write. A
    /// write failure degrades the link exactly like a read failure.
    async fn write_controller(&self, frame: &str) {
        self.store
            .set_last_command(format!("sent controller: {}", frame.trim_end()));

        let mut slot = self.controller.lock().await;
        let Some(link) = slot.as_mut() else {
            return;
        };
        if let Err(err) = link.writer.write_frame(frame).await {
            warn!(error = %err, "controller write failed");
            drop(slot);
            self.teardown(LinkRole::Controller, true).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OpenFailure;
    use crate::telemetry::Snapshot;
    use crate::transport::TransportPair;
    use async_trait::async_trait;
    use std::io;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio::time::{Duration, timeout};

    struct MockReader {
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    #[async_trait]
    impl TransportReader for MockReader {
        async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.rx.recv().await {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    Ok(n)
                }
                None => Ok(0),
            }
        }
    }

    struct MockWriter {
        tx: mpsc::UnboundedSender<String>,
        fail: bool,
    }

    #[async_trait]
    impl TransportWriter for MockWriter {
        async fn write_frame(&mut self, frame: &str) -> io::Result<()> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write refused"));
            }
            let _ = self.tx.send(frame.to_string());
            Ok(())
        }
    }

    /// Handles to drive one mocked link from a test.
    struct MockLink {
        data_tx: mpsc::UnboundedSender<Vec<u8>>,
        frames_rx: mpsc::UnboundedReceiver<String>,
    }

    fn mock_pair(fail_writes: bool) -> (TransportPair, MockLink) {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (frame_tx, frames_rx) = mpsc::unbounded_channel();
        let pair = TransportPair {
            reader: Box::new(MockReader { rx: data_rx }),
            writer: Box::new(MockWriter {
                tx: frame_tx,
                fail: fail_writes,
            }),
        };
        (pair, MockLink { data_tx, frames_rx })
    }

    #[derive(Default)]
    struct MockFactory {
        sensor: StdMutex<Vec<TransportPair>>,
        controller: StdMutex<Vec<TransportPair>>,
        failure: StdMutex<Option<OpenFailure>>,
        opens: AtomicUsize,
    }

    #[async_trait]
    impl TransportFactory for MockFactory {
        async fn open(&self, role: LinkRole) -> Result<TransportPair, OpenFailure> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if let Some(failure) = self.failure.lock().unwrap().take() {
                return Err(failure);
            }
            let slot = match role {
                LinkRole::Sensor => &self.sensor,
                LinkRole::Controller => &self.controller,
            };
            slot.lock()
                .unwrap()
                .pop()
                .ok_or_else(|| OpenFailure::Busy("no device attached".into()))
        }
    }

    struct Harness {
        manager: Arc<ConnectionManager>,
        store: Arc<TelemetryStore>,
        factory: Arc<MockFactory>,
    }

    fn harness(factory: MockFactory) -> Harness {
        let store = Arc::new(TelemetryStore::new());
        let factory = Arc::new(factory);
        let manager = Arc::new(ConnectionManager::new(
            Arc::clone(&store),
            Arc::clone(&factory) as Arc<dyn TransportFactory>,
        ));
        Harness {
            manager,
            store,
            factory,
        }
    }

    async fn wait_for(store: &TelemetryStore, mut pred: impl FnMut(&Snapshot) -> bool) {
        let mut rx = store.subscribe();
        timeout(Duration::from_secs(1), async {
            loop {
                if pred(&store.snapshot()) {
                    break;
                }
                rx.changed().await.expect("store dropped");
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_sensor_lines_flow_into_store() {
        let factory = MockFactory::default();
        let (pair, link) = mock_pair(false);
        factory.sensor.lock().unwrap().push(pair);
        let h = harness(factory);

        h.manager.open_sensor_link().await.unwrap();
        assert!(h.store.snapshot().sensor_connected);

        link.data_tx.send(b"N:10,P:20,K:30\n".to_vec()).unwrap();
        wait_for(&h.store, |s| s.nutrients.timestamp.is_some()).await;
        let reading = h.store.snapshot().nutrients;
        assert_eq!((reading.n, reading.p, reading.k), (10, 20, 30));
    }

    #[tokio::test]
    async fn test_fragmented_chunks_reassemble_lines() {
        let factory = MockFactory::default();
        let (pair, link) = mock_pair(false);
        factory.sensor.lock().unwrap().push(pair);
        let h = harness(factory);
        h.manager.open_sensor_link().await.unwrap();

        // One frame split across three chunks, plus the start of another.
        link.data_tx.send(b"N:1,P:2".to_vec()).unwrap();
        link.data_tx.send(b",K:3\nT:2".to_vec()).unwrap();
        link.data_tx.send(b"5.5\n".to_vec()).unwrap();

        wait_for(&h.store, |s| s.environment.temperature == 25.5).await;
        let snapshot = h.store.snapshot();
        assert_eq!(
            (snapshot.nutrients.n, snapshot.nutrients.p, snapshot.nutrients.k),
            (1, 2, 3)
        );
    }

    #[tokio::test]
    async fn test_eof_tears_down_sensor_link() {
        let factory = MockFactory::default();
        let (pair, link) = mock_pair(false);
        factory.sensor.lock().unwrap().push(pair);
        let h = harness(factory);
        h.manager.open_sensor_link().await.unwrap();

        drop(link); // closes the data channel: next read returns EOF
        wait_for(&h.store, |s| !s.sensor_connected).await;
    }

    #[tokio::test]
    async fn test_controller_teardown_forces_actuators_off() {
        let factory = MockFactory::default();
        let (pair, link) = mock_pair(false);
        factory.controller.lock().unwrap().push(pair);
        let h = harness(factory);
        h.manager.open_controller_link().await.unwrap();

        h.manager.toggle_heater(true).await;
        h.manager.toggle_motor(Motor::Grinder, true).await;
        assert!(h.store.snapshot().actuators.grinder.running);

        drop(link);
        wait_for(&h.store, |s| !s.controller_connected).await;
        let act = h.store.snapshot().actuators;
        assert!(!act.heater_on);
        assert!(!act.grinder.running);
        assert!(!act.agitator.running);
    }

    #[tokio::test]
    async fn test_heater_toggle_emits_relay_frames() {
        let factory = MockFactory::default();
        let (pair, mut link) = mock_pair(false);
        factory.controller.lock().unwrap().push(pair);
        let h = harness(factory);
        h.manager.open_controller_link().await.unwrap();

        h.manager.toggle_heater(true).await;
        h.manager.toggle_heater(false).await;
        assert_eq!(link.frames_rx.recv().await.unwrap(), "RELAY:1\n");
        assert_eq!(link.frames_rx.recv().await.unwrap(), "RELAY:0\n");
    }

    #[tokio::test]
    async fn test_speed_while_stopped_defers_frame_until_start() {
        let factory = MockFactory::default();
        let (pair, mut link) = mock_pair(false);
        factory.controller.lock().unwrap().push(pair);
        let h = harness(factory);
        h.manager.open_controller_link().await.unwrap();

        h.manager.set_motor_speed(Motor::Grinder, 200).await;
        assert_eq!(h.store.snapshot().actuators.grinder.speed, 200);
        assert!(link.frames_rx.try_recv().is_err(), "no frame while stopped");

        h.manager.toggle_motor(Motor::Grinder, true).await;
        assert_eq!(link.frames_rx.recv().await.unwrap(), "MOTOR:A:F:200\n");
    }

    #[tokio::test]
    async fn test_direction_change_while_running_reemits_full_frame() {
        let factory = MockFactory::default();
        let (pair, mut link) = mock_pair(false);
        factory.controller.lock().unwrap().push(pair);
        let h = harness(factory);
        h.manager.open_controller_link().await.unwrap();

        h.manager.set_motor_speed(Motor::Grinder, 150).await;
        h.manager.toggle_motor(Motor::Grinder, true).await;
        assert_eq!(link.frames_rx.recv().await.unwrap(), "MOTOR:A:F:150\n");

        h.manager
            .set_motor_direction(Motor::Grinder, MotorDirection::Backward)
            .await;
        assert_eq!(link.frames_rx.recv().await.unwrap(), "MOTOR:A:B:150\n");

        h.manager.toggle_motor(Motor::Grinder, false).await;
        assert_eq!(link.frames_rx.recv().await.unwrap(), "MOTOR:A:S:0\n");
    }

    #[tokio::test]
    async fn test_intents_apply_optimistically_while_disconnected() {
        let h = harness(MockFactory::default());

        h.manager.toggle_heater(true).await;
        let snapshot = h.store.snapshot();
        assert!(snapshot.actuators.heater_on);
        assert_eq!(
            snapshot.last_command.as_deref(),
            Some("sent controller: RELAY:1")
        );
    }

    #[tokio::test]
    async fn test_write_failure_degrades_controller_link() {
        let factory = MockFactory::default();
        let (pair, _link) = mock_pair(true);
        factory.controller.lock().unwrap().push(pair);
        let h = harness(factory);
        h.manager.open_controller_link().await.unwrap();
        assert!(h.store.snapshot().controller_connected);

        h.manager.toggle_heater(true).await;
        wait_for(&h.store, |s| !s.controller_connected).await;
    }

    #[tokio::test]
    async fn test_second_open_is_a_no_op() {
        let factory = MockFactory::default();
        let (pair, _link) = mock_pair(false);
        factory.sensor.lock().unwrap().push(pair);
        let h = harness(factory);

        h.manager.open_sensor_link().await.unwrap();
        h.manager.open_sensor_link().await.unwrap();
        assert_eq!(h.factory.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_busy_open_surfaces_classified_error() {
        let h = harness(MockFactory::default());
        let result = h.manager.open_controller_link().await;
        assert!(matches!(result, Err(LinkError::Busy(_))));
        assert!(!h.store.snapshot().controller_connected);
    }

    #[tokio::test]
    async fn test_cancelled_open_is_silent() {
        let factory = MockFactory::default();
        *factory.failure.lock().unwrap() = Some(OpenFailure::Cancelled);
        let h = harness(factory);

        assert!(h.manager.open_sensor_link().await.is_ok());
        assert!(!h.store.snapshot().sensor_connected);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let factory = MockFactory::default();
        let (pair, _link) = mock_pair(false);
        factory.sensor.lock().unwrap().push(pair);
        let h = harness(factory);

        h.manager.open_sensor_link().await.unwrap();
        h.manager.close_sensor_link().await;
        h.manager.close_sensor_link().await;
        assert!(!h.store.snapshot().sensor_connected);
    }

    #[tokio::test]
    async fn test_read_request_writes_to_sensor_when_connected() {
        let factory = MockFactory::default();
        let (pair, mut link) = mock_pair(false);
        factory.sensor.lock().unwrap().push(pair);
        let h = harness(factory);
        h.manager.open_sensor_link().await.unwrap();

        h.manager.request_nutrient_read().await;
        assert_eq!(link.frames_rx.recv().await.unwrap(), "READ_NPK\n");
    }

    #[tokio::test]
    async fn test_read_request_simulates_in_demo_mode() {
        let h = harness(MockFactory::default());
        h.manager.enable_demo_mode().await;

        h.manager.request_nutrient_read().await;
        let reading = h.store.snapshot().nutrients;
        assert!(reading.timestamp.is_some());
        assert!((20..200).contains(&reading.n));
        assert!((10..100).contains(&reading.p));
        assert!((50..300).contains(&reading.k));
    }

    #[tokio::test]
    async fn test_open_clears_demo_mode() {
        let factory = MockFactory::default();
        let (pair, _link) = mock_pair(false);
        factory.sensor.lock().unwrap().push(pair);
        let h = harness(factory);

        h.manager.enable_demo_mode().await;
        assert!(h.store.snapshot().demo_mode);
        h.manager.open_sensor_link().await.unwrap();
        assert!(!h.store.snapshot().demo_mode);
    }
}
