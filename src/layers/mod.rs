//! Protocol layers built on the engine and tunnel primitives.

pub mod dns;
pub mod modes;
pub mod quic;
pub mod relay;
pub mod tls;
pub mod upstream_proxy;
