//! gatewaylink: persistent connections to sensor gateways
//!
//! - `gateway`: wire codec, per-gateway connection actor, command correlation,
//!   topic routing, the connection manager and an in-process simulator
//! - `telemetry`: vibration / temperature / battery cache fed by pushes and pulls
//! - `discovery`: CONNECT → DISCOVER → ASSOCIATE → CONFIRM workflow
//! - `persistence`: REST client for gateway and sensor records
//! - `config`, `logger`, `arguments`, `errors`: shared infrastructure

pub mod arguments;
pub mod config;
pub mod discovery;
pub mod errors;
pub mod gateway;
pub mod logger;
pub mod persistence;
pub mod telemetry;
