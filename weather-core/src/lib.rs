//! Core library for the MQTT weather broadcaster.
//!
//! This crate defines:
//! - The city table and its weather readings
//! - The text protocol spoken on the shared topic
//! - The broadcaster (selection state, inbound commands, publish loop)
//! - A transport abstraction with an MQTT implementation
//! - Configuration handling
//!
//! It is used by `weather-cli`, but can also be embedded in other binaries or services.

pub mod backoff;
pub mod broadcaster;
pub mod config;
pub mod model;
pub mod protocol;
pub mod state;
pub mod transport;

pub use broadcaster::{Broadcaster, InboundOutcome, Tick};
pub use config::Config;
pub use model::{CityEntry, CityTable, TableError, WeatherRecord};
pub use state::{ConnectionState, StateTracker};
pub use transport::{
    ConnectError, IgnoreInbound, InboundHandler, MqttSettings, MqttTransport, Transport,
    TransportError,
};
