// Transport module: TCP listener and per-connection read loop

pub mod listener;

pub use listener::{bind, handle_connection, serve};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Accept failed: {0}")]
    Accept(#[source] std::io::Error),
}
