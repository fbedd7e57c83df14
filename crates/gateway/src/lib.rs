//! Operational HTTP façade over the relay engine: status, health, stats,
//! pairing code, manual flush and manual reconnect.

pub mod server;

pub use server::{build_app, serve};
