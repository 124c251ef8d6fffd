//! Wire commands, parameter names and reply shapes.

use super::grammar::{frame_response, CRLF};

// INIT parameters
pub const PARAM_HOST: &str = "HST";
pub const PARAM_APP_TYPE: &str = "ATP";
pub const PARAM_APP_VERSION: &str = "AVR";
pub const PARAM_CLASS_ID: &str = "ID";
pub const PARAM_DATE: &str = "DT";
pub const PARAM_TIME: &str = "TM";

// INFO / GREQ / SRSP parameters
pub const PARAM_DATA: &str = "DATA";
pub const PARAM_SEQUENCE: &str = "CMD";

// Decrypted INFO body fields
pub const FIELD_MARKER: &str = "TT";
pub const FIELD_CLIENT_ID: &str = "CID";
pub const FIELD_NAME: &str = "NAME";
pub const FIELD_ALT_NAME: &str = "DESC";
pub const FIELD_ENABLED: &str = "ENB";
pub const FIELD_CREATED_DATE: &str = "CDT";
pub const FIELD_CREATED_TIME: &str = "CTM";
pub const FIELD_EXPIRY: &str = "EXP";

/// Success status code
pub const CODE_OK: u16 = 200;
/// Failure status code
pub const CODE_ERROR: u16 = 503;

/// Commands a client may send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Init,
    Ping,
    Info,
    Greq,
    Srsp,
    Vers,
    Dwnl,
    Errl,
    Unknown(String),
}

impl Command {
    /// Map an upper-cased command token to a command.
    pub fn from_name(name: &str) -> Self {
        match name {
            "INIT" => Command::Init,
            "PING" => Command::Ping,
            "INFO" => Command::Info,
            "GREQ" => Command::Greq,
            "SRSP" => Command::Srsp,
            "VERS" => Command::Vers,
            "DWNL" => Command::Dwnl,
            "ERRL" => Command::Errl,
            other => Command::Unknown(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Command::Init => "INIT",
            Command::Ping => "PING",
            Command::Info => "INFO",
            Command::Greq => "GREQ",
            Command::Srsp => "SRSP",
            Command::Vers => "VERS",
            Command::Dwnl => "DWNL",
            Command::Errl => "ERRL",
            Command::Unknown(name) => name,
        }
    }
}

/// A reply ready for the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Line reply; gets a CR-LF terminator
    Line(String),
    /// Written exactly as is (the INIT handshake)
    Raw(String),
}

impl Reply {
    /// Plain `200`
    pub fn ok() -> Self {
        Reply::Line(CODE_OK.to_string())
    }

    /// `200 <body>`
    pub fn ok_with(body: impl AsRef<str>) -> Self {
        Reply::Line(format!("{} {}", CODE_OK, body.as_ref()))
    }

    /// `503 <message>`
    pub fn error(message: impl AsRef<str>) -> Self {
        Reply::Line(format!("{} {}", CODE_ERROR, message.as_ref()))
    }

    /// The two-line INIT success reply: `200-KEY=<key>\r\n200 LEN=<n>`
    pub fn handshake(server_key: &str, key_length: usize) -> Self {
        Reply::Raw(format!(
            "{}-KEY={}{}{} LEN={}",
            CODE_OK, server_key, CRLF, CODE_OK, key_length
        ))
    }

    /// Bytes as they go onto the wire.
    pub fn to_wire(&self) -> String {
        match self {
            Reply::Line(line) => frame_response(line),
            Reply::Raw(raw) => raw.clone(),
        }
    }

    pub fn is_error(&self) -> bool {
        match self {
            Reply::Line(line) | Reply::Raw(line) => line.starts_with(&CODE_ERROR.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_from_name() {
        assert_eq!(Command::from_name("INIT"), Command::Init);
        assert_eq!(Command::from_name("SRSP"), Command::Srsp);
        assert_eq!(
            Command::from_name("HELO"),
            Command::Unknown("HELO".to_string())
        );
        assert_eq!(Command::from_name("HELO").name(), "HELO");
    }

    #[test]
    fn test_handshake_reply_is_byte_exact() {
        let reply = Reply::handshake("D028", 4);
        assert_eq!(reply.to_wire(), "200-KEY=D028\r\n200 LEN=4");
    }

    #[test]
    fn test_line_replies_are_terminated() {
        assert_eq!(Reply::ok().to_wire(), "200\r\n");
        assert_eq!(Reply::ok_with("CMD=1 DATA=x").to_wire(), "200 CMD=1 DATA=x\r\n");
        assert_eq!(Reply::error("Bad").to_wire(), "503 Bad\r\n");
    }

    #[test]
    fn test_is_error() {
        assert!(Reply::error("x").is_error());
        assert!(!Reply::ok().is_error());
        assert!(!Reply::handshake("AAAA", 1).is_error());
    }
}
