// Network layer module
// Line-delimited JSON telemetry over TCP

pub mod connection;
pub mod messages;
pub mod json_client;

pub use connection::{Connection, Frame};
pub use messages::{Packet, PacketError, RawPacket};
pub use json_client::{Backoff, ClientSettings, TelemetryClient};
