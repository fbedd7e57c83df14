//! WhatsApp Web transport for parley.
//!
//! The WhatsApp Web protocol is spoken by a Node.js Baileys sidecar. This
//! crate starts (or attaches to) that process, talks JSON to it over a
//! local WebSocket and exposes it as a [`parley_channels::Transport`].

pub mod process;
pub mod sidecar;
pub mod transport;
pub mod types;

pub use {
    process::{SidecarConfig, SidecarProcess, find_sidecar_dir, start_sidecar},
    sidecar::DEFAULT_SIDECAR_PORT,
    transport::WhatsAppTransport,
};
