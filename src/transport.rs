//! Transport abstraction over the two serial links
//!
//! The connection manager only sees byte-stream halves: a suspending chunked
//! reader and a frame writer. Any carrier satisfying those (native serial, a
//! TCP bridge, an in-memory mock) plugs in through `TransportFactory`.
//!
//! The stock implementation opens a `tokio_serial::SerialStream` at the
//! configured baud rate and splits it into owned halves, so the read loop and
//! outbound writes never contend on one lock.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::debug;

use crate::config::SerialConfig;
use crate::error::{OpenFailure, classify_open_error};
use crate::telemetry::LinkRole;

/// Receiving half of a link. `read_chunk` suspends until bytes arrive;
/// `Ok(0)` signals end of stream.
#[async_trait]
pub trait TransportReader: Send {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Transmitting half of a link. Writes are fire-and-forget: no
/// acknowledgement is awaited and no retry is attempted.
#[async_trait]
pub trait TransportWriter: Send {
    async fn write_frame(&mut self, frame: &str) -> io::Result<()>;
}

/// An opened link, ready to be handed to a read loop and a writer slot.
pub struct TransportPair {
    pub reader: Box<dyn TransportReader>,
    pub writer: Box<dyn TransportWriter>,
}

/// Acquires a transport for a role. Open failures come back pre-classified.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, role: LinkRole) -> Result<TransportPair, OpenFailure>;
}

struct SerialReader(ReadHalf<SerialStream>);

#[async_trait]
impl TransportReader for SerialReader {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).await
    }
}

struct SerialWriter(WriteHalf<SerialStream>);

#[async_trait]
impl TransportWriter for SerialWriter {
    async fn write_frame(&mut self, frame: &str) -> io::Result<()> {
        self.0.write_all(frame.as_bytes()).await?;
        self.0.flush().await
    }
}

/// Factory for native serial ports, one device path per role.
pub struct SerialFactory {
    sensor: SerialConfig,
    controller: SerialConfig,
}

impl SerialFactory {
    pub fn new(sensor: SerialConfig, controller: SerialConfig) -> Self {
        Self { sensor, controller }
    }

    fn endpoint(&self, role: LinkRole) -> &SerialConfig {
        match role {
            LinkRole::Sensor => &self.sensor,
            LinkRole::Controller => &self.controller,
        }
    }
}

#[async_trait]
impl TransportFactory for SerialFactory {
    async fn open(&self, role: LinkRole) -> Result<TransportPair, OpenFailure> {
        let endpoint = self.endpoint(role);
        debug!(
            role = role.as_str(),
            port = %endpoint.port,
            baud = endpoint.baud_rate,
            "opening serial port"
        );

        let stream = tokio_serial::new(&endpoint.port, endpoint.baud_rate)
            .open_native_async()
            .map_err(|err| classify_open_error(&err))?;

        let (read_half, write_half) = tokio::io::split(stream);
        Ok(TransportPair {
            reader: Box::new(SerialReader(read_half)),
            writer: Box::new(SerialWriter(write_half)),
        })
    }
}
