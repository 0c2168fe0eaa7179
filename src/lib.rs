//! AgriSense Link: serial telemetry and device-control core
//!
//! This library bridges the AgriSense dashboard to its field hardware (an
//! NPK soil-nutrient sensor and a fermentation-tank controller) over two
//! independent 9600-baud serial links:
//! - cascading multi-format line parsing into typed telemetry
//! - connection lifecycle (open, read loop, idempotent teardown)
//! - full-state relay/motor command encoding
//! - hybrid live/simulated telemetry fallback
//!
//! Architecture: transport → read loop → parser → telemetry store ← scheduler;
//! user intents → store (optimistic) → command encoder → transport.

pub mod command;
pub mod config;
pub mod error;
pub mod manager;
pub mod parser;
pub mod simulation;
pub mod telemetry;
pub mod transport;
