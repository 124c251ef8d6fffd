// INIT / INFO handshake
//
// INIT negotiates key material; INFO proves the client can use it and
// carries the client identity. Together they move a session from pending to
// active. The registry side of that move (duplicate takeover) lives in the
// lifecycle manager.

use super::ConnectionSession;
use crate::crypto::codec::CodecError;
use crate::crypto::dictionary::{is_valid_class, KeyOverrides};
use crate::crypto::keys::{generate_server_key, resolve_session_keys};
use crate::protocol::messages::*;
use crate::protocol::{format_body, parse_body, Params, Reply};
use chrono::{Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime, NaiveTime};
use thiserror::Error;
use tracing::{debug, info};

/// Expiry granted when the client has none
pub const DEFAULT_EXPIRY_DAYS: i64 = 30;

const MARKER_VALUE: &str = "Test";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("Missing parameter {0}")]
    MissingParameter(&'static str),
    #[error("Invalid client class {0}")]
    InvalidClientClass(String),
    #[error("INIT required before INFO")]
    NotInitialized,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Missing client ID")]
    MissingClientId,
    #[error("Client ID mismatch: session is {current}, got {offered}")]
    IdentityMismatch { current: String, offered: String },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Result of a successful INFO
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoOutcome {
    /// Encrypted reply for the client
    pub reply: Reply,
    /// Identity carried by the INFO body
    pub identity: String,
    /// True when this INFO assigned the identity (pending -> active)
    pub newly_identified: bool,
}

/// Signed difference in seconds between client-reported and server time.
///
/// `date` is `YYMMDD`, `time` is `HHMMSS`. Unparseable input yields `None`.
pub fn clock_skew(date: &str, time: &str, server_now: NaiveDateTime) -> Option<i64> {
    let date = NaiveDate::parse_from_str(date, "%y%m%d").ok()?;
    let time = NaiveTime::parse_from_str(time, "%H%M%S").ok()?;
    let client_now = date.and_time(time);
    Some((client_now - server_now).num_seconds())
}

fn required<'a>(params: &'a Params, key: &'static str) -> Result<&'a str, HandshakeError> {
    params
        .get_non_empty(key)
        .ok_or(HandshakeError::MissingParameter(key))
}

impl ConnectionSession {
    /// Handle `INIT HST= ATP= AVR= ID= [DT=] [TM=]`.
    ///
    /// Replaces any previously negotiated keys. The identity is untouched.
    pub fn handle_init(&self, params: &Params, overrides: &KeyOverrides) -> Result<Reply, HandshakeError> {
        let hostname = required(params, PARAM_HOST)?;
        let app_type = required(params, PARAM_APP_TYPE)?;
        let app_version = required(params, PARAM_APP_VERSION)?;
        let class_raw = required(params, PARAM_CLASS_ID)?;

        let class_id = class_raw
            .parse::<u8>()
            .ok()
            .filter(|c| is_valid_class(*c))
            .ok_or_else(|| HandshakeError::InvalidClientClass(class_raw.to_string()))?;

        let skew = match (params.get(PARAM_DATE), params.get(PARAM_TIME)) {
            (Some(date), Some(time)) => clock_skew(date, time, Local::now().naive_local()),
            _ => None,
        };

        let keys = resolve_session_keys(class_id, hostname, &generate_server_key(), overrides)?;

        {
            let mut state = self.state.lock();
            state.hostname = hostname.to_string();
            state.app_type = app_type.to_string();
            state.app_version = app_version.to_string();
            state.client_class = Some(class_id);
            state.server_key = keys.server_key.clone();
            state.key_length = keys.key_length;
            state.crypto_key = keys.crypto_key;
            state.fallback_keys = keys.fallback_keys;
            if skew.is_some() {
                state.clock_skew_secs = skew;
            }
        }

        info!(
            "INIT from {} host={} app={} {} class={} key={} len={}",
            self.remote_addr, hostname, app_type, app_version, class_id, keys.server_key, keys.key_length
        );
        if let Some(skew) = skew {
            debug!("Clock skew for {}: {}s", self.remote_addr, skew);
        }

        Ok(Reply::handshake(&keys.server_key, keys.key_length))
    }

    /// Handle `INFO DATA=<encrypted body>`.
    ///
    /// On success the session carries the client identity from the body.
    pub fn handle_info(&self, params: &Params) -> Result<InfoOutcome, HandshakeError> {
        let data = required(params, PARAM_DATA)?;

        if self.state.lock().crypto_key.is_empty() {
            return Err(HandshakeError::NotInitialized);
        }

        let body = parse_body(&self.decrypt_verified(data)?);

        if body.get(FIELD_MARKER) != Some(MARKER_VALUE) {
            return Err(HandshakeError::InvalidToken);
        }
        let identity = body
            .get_non_empty(FIELD_CLIENT_ID)
            .ok_or(HandshakeError::MissingClientId)?
            .to_string();

        let today = Local::now();
        let (newly_identified, expiry) = {
            let mut state = self.state.lock();
            if !state.identity.is_empty() && state.identity != identity {
                return Err(HandshakeError::IdentityMismatch {
                    current: state.identity.clone(),
                    offered: identity,
                });
            }

            let newly_identified = state.identity.is_empty();
            if newly_identified {
                state.identity = identity.clone();
            }

            if let Some(name) = body
                .get_non_empty(FIELD_NAME)
                .or_else(|| body.get_non_empty(FIELD_ALT_NAME))
            {
                state.display_name = name.to_string();
            }

            let expiry = state
                .expiry
                .or_else(|| {
                    body.get(FIELD_EXPIRY)
                        .and_then(|e| NaiveDate::parse_from_str(e, "%y%m%d").ok())
                })
                .unwrap_or_else(|| today.date_naive() + ChronoDuration::days(DEFAULT_EXPIRY_DAYS));
            state.expiry = Some(expiry);

            (newly_identified, expiry)
        };

        let response = Params::new()
            .with(FIELD_MARKER, MARKER_VALUE)
            .with(FIELD_CLIENT_ID, identity.as_str())
            .with(FIELD_ENABLED, "1")
            .with(FIELD_CREATED_DATE, today.format("%y%m%d").to_string())
            .with(FIELD_CREATED_TIME, today.format("%H%M%S").to_string())
            .with(FIELD_EXPIRY, expiry.format("%y%m%d").to_string());

        let encrypted = self.encrypt(&format_body(&response))?;

        info!(
            "INFO from {} identified as {}{}",
            self.remote_addr,
            identity,
            if newly_identified { "" } else { " (repeat)" }
        );

        Ok(InfoOutcome {
            reply: Reply::ok_with(format!("{}={}", PARAM_DATA, encrypted)),
            identity,
            newly_identified,
        })
    }
}
