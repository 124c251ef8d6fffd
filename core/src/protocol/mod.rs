// Legacy line protocol: grammar, commands and replies

pub mod grammar;
pub mod messages;

pub use grammar::{format_body, frame_response, parse_body, parse_line, Params, CRLF};
pub use messages::{Command, Reply};

use thiserror::Error;

/// Malformed or out-of-place client commands
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Empty command")]
    EmptyLine,
    #[error("Unknown command {0}")]
    UnknownCommand(String),
    #[error("Missing parameter {0}")]
    MissingParameter(&'static str),
    #[error("Invalid parameter {0}")]
    InvalidParameter(&'static str),
    #[error("Not authenticated")]
    NotAuthenticated,
}
