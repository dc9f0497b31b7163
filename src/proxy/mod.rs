//! Host side of the proxy: the tokio runtime driving the layers, the addons answering their
//! hooks, and the certificate authority used for TLS interception.

pub mod addons;
pub mod cert_manager;
pub mod server;

pub use server::*;
