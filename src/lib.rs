//! # layerproxy
//!
//! The protocol core of an intercepting network proxy, built as a stack of sans-IO layers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │          Host runtime (tokio): sockets, timers           │
//! ├───────────────── Events ▼ ──────── ▲ Commands ──────────┤
//! │  ReverseProxy / TransparentProxy                         │
//! │    └─ NextLayer ── asks addons, then delegates to        │
//! │         ├─ TLS tunnels (client / server)                 │
//! │         ├─ HTTP CONNECT upstream tunnel                  │
//! │         ├─ QUIC tunnels ── RawQuicLayer ── streams       │
//! │         ├─ DNS                                           │
//! │         └─ TCP / UDP relay                               │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Layers never touch a socket. They react to [`events::Event`]s and answer with
//! [`commands::Command`]s; blocking commands suspend the issuing layer until the matching
//! completion arrives.

pub mod commands;
pub mod connection;
pub mod context;
pub mod error;
pub mod events;
pub mod flow;
pub mod hooks;
pub mod layer;
pub mod layers;
pub mod logging;
pub mod options;
pub mod proxy;
pub mod tunnel;

#[cfg(test)]
mod test_utils;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
