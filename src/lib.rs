//! # EOS Payload
//!
//! Flight software for a high-altitude balloon payload. A supervisor
//! process launches one process per configured driver, watches their
//! heartbeats and reports fleet health. Drivers talk to each other over a
//! small publish/subscribe bus.
//!
//! ## Architecture
//!
//! - [`config`] - payload config file parsing and per-device validation
//! - [`bus`] - topics, the [`bus::MessageBus`] trait and its TCP/in-process backends
//! - [`packet`] - the shared packet codec used on the bus and over the radio
//! - [`driver`] - the runtime every driver process runs inside
//! - [`drivers`] - radio, downlink, ping and actuator drivers
//! - [`supervisor`] - process launch, heartbeat tracking and health sweeps
//! - [`logging`] - console and file log setup
//!
//! ## Quick Start
//!
//! ```rust
//! use eos_payload::bus::{LocalBus, MessageBus, Topic};
//! use eos_payload::device::DeviceId;
//! use eos_payload::driver::Heartbeat;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = LocalBus::new();
//! let heartbeat = Heartbeat { is_healthy: true, thread_count: 3 };
//! let packet = heartbeat.to_packet(DeviceId::Radio).unwrap();
//! bus.send(Topic::HealthHeartbeat, packet.encode().unwrap()).unwrap();
//! bus.disconnect();
//! # }
//! ```

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]

pub mod bus;
pub mod config;
pub mod device;
pub mod driver;
pub mod drivers;
pub mod logging;
pub mod packet;
pub mod supervisor;

pub use bus::{MessageBus, Topic};
pub use config::{DeviceConfig, PayloadConfig};
pub use device::DeviceId;
pub use driver::{Driver, DriverRuntime};
pub use drivers::DriverRegistry;
pub use packet::{DataType, Packet, Priority};
pub use supervisor::{DriverStatus, Supervisor};
