//! Connection sessions.
//!
//! One [`ConnectionSession`] exists per accepted socket. A session starts
//! *pending* (no client identity) and becomes *active* once an INFO exchange
//! assigns an identity. The transition is one-way and the identity never
//! changes afterwards.
//!
//! Session-local fields sit behind a `parking_lot` mutex; socket writes are
//! serialized through a separate async mutex so that no two workers ever
//! write to the same socket at once.

mod handshake;
mod snapshot;

pub use handshake::{clock_skew, HandshakeError, InfoOutcome, DEFAULT_EXPIRY_DAYS};
pub use snapshot::SessionInfo;

use crate::crypto::codec::{compress, decompress_with_keys, CodecError};
use crate::protocol::Reply;
use chrono::{DateTime, Local, NaiveDate};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Upper bound on the background socket shutdown after a close
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Write half of a client socket
pub type SessionWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session is closing")]
    Closed,
    #[error("Socket write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Mutable per-session fields
#[derive(Debug)]
struct SessionState {
    identity: String,
    hostname: String,
    display_name: String,
    app_type: String,
    app_version: String,
    client_class: Option<u8>,
    server_key: String,
    key_length: usize,
    crypto_key: String,
    fallback_keys: Vec<String>,
    busy: bool,
    request_counter: u64,
    last_error: String,
    last_activity: Instant,
    last_ping: Option<Instant>,
    clock_skew_secs: Option<i64>,
    expiry: Option<NaiveDate>,
    disconnected_at: Option<DateTime<Local>>,
}

impl SessionState {
    fn new(now: Instant) -> Self {
        Self {
            identity: String::new(),
            hostname: String::new(),
            display_name: String::new(),
            app_type: String::new(),
            app_version: String::new(),
            client_class: None,
            server_key: String::new(),
            key_length: 0,
            crypto_key: String::new(),
            fallback_keys: Vec::new(),
            busy: false,
            request_counter: 0,
            last_error: String::new(),
            last_activity: now,
            last_ping: None,
            clock_skew_secs: None,
            expiry: None,
            disconnected_at: None,
        }
    }
}

/// A live client connection
pub struct ConnectionSession {
    /// Process-unique connection id
    id: u64,
    remote_addr: SocketAddr,
    local_port: u16,
    connected_at: DateTime<Local>,
    started: Instant,
    state: Mutex<SessionState>,
    writer: tokio::sync::Mutex<Option<SessionWriter>>,
    closing: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl ConnectionSession {
    pub fn new(id: u64, remote_addr: SocketAddr, local_port: u16, writer: SessionWriter) -> Self {
        let now = Instant::now();
        let (closed_tx, _) = watch::channel(false);
        Self {
            id,
            remote_addr,
            local_port,
            connected_at: Local::now(),
            started: now,
            state: Mutex::new(SessionState::new(now)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            closing: AtomicBool::new(false),
            closed_tx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn connected_at(&self) -> DateTime<Local> {
        self.connected_at
    }

    /// Client identity; empty while pending
    pub fn identity(&self) -> String {
        self.state.lock().identity.clone()
    }

    /// Whether an identity has been assigned
    pub fn is_active(&self) -> bool {
        !self.state.lock().identity.is_empty()
    }

    /// Label for log lines: identity when known, else the peer address
    pub fn label(&self) -> String {
        let state = self.state.lock();
        if state.identity.is_empty() {
            self.remote_addr.to_string()
        } else {
            state.identity.clone()
        }
    }

    pub fn hostname(&self) -> String {
        self.state.lock().hostname.clone()
    }

    pub fn display_name(&self) -> String {
        self.state.lock().display_name.clone()
    }

    pub fn client_class(&self) -> Option<u8> {
        self.state.lock().client_class
    }

    pub fn server_key(&self) -> String {
        self.state.lock().server_key.clone()
    }

    pub fn key_length(&self) -> usize {
        self.state.lock().key_length
    }

    pub fn crypto_key(&self) -> String {
        self.state.lock().crypto_key.clone()
    }

    pub fn fallback_keys(&self) -> Vec<String> {
        self.state.lock().fallback_keys.clone()
    }

    pub fn clock_skew_secs(&self) -> Option<i64> {
        self.state.lock().clock_skew_secs
    }

    pub fn expiry(&self) -> Option<NaiveDate> {
        self.state.lock().expiry
    }

    pub fn last_error(&self) -> String {
        self.state.lock().last_error.clone()
    }

    pub fn set_last_error(&self, error: impl Into<String>) {
        self.state.lock().last_error = error.into();
    }

    pub fn disconnected_at(&self) -> Option<DateTime<Local>> {
        self.state.lock().disconnected_at
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Record inbound activity
    pub fn touch(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    /// Time since the last inbound line
    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_activity.elapsed()
    }

    /// Time since the socket was accepted
    pub fn connected_for(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn record_ping(&self) {
        self.state.lock().last_ping = Some(Instant::now());
    }

    // ------------------------------------------------------------------
    // Bridge bookkeeping
    // ------------------------------------------------------------------

    pub fn is_busy(&self) -> bool {
        self.state.lock().busy
    }

    /// Mark the session busy and allocate the next request sequence number.
    ///
    /// Returns `None` when a request is already outstanding.
    pub fn begin_request(&self) -> Option<u64> {
        let mut state = self.state.lock();
        if state.busy {
            return None;
        }
        state.busy = true;
        state.request_counter += 1;
        Some(state.request_counter)
    }

    /// Clear the busy flag
    pub fn end_request(&self) {
        self.state.lock().busy = false;
    }

    /// Number of requests issued to this session
    pub fn request_count(&self) -> u64 {
        self.state.lock().request_counter
    }

    // ------------------------------------------------------------------
    // Codec bound to this session's keys
    // ------------------------------------------------------------------

    /// Encrypt `plaintext` under the session's primary key.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CodecError> {
        let mut state = self.state.lock();
        if state.crypto_key.is_empty() {
            let class_id = state.client_class.unwrap_or(0);
            state.last_error = CodecError::NoKey(class_id).to_string();
            return Err(CodecError::NoKey(class_id));
        }
        compress(plaintext, &state.crypto_key).map_err(|e| {
            state.last_error = e.to_string();
            e
        })
    }

    /// Decrypt `ciphertext`, requiring the validation marker.
    ///
    /// Tries the primary key, then each fallback key. A fallback that works
    /// becomes the primary key; the old primary takes its place in the
    /// fallback list. The swap happens under the session lock, so no
    /// concurrent encrypt sees a half-updated key set.
    pub fn decrypt_verified(&self, ciphertext: &str) -> Result<String, CodecError> {
        let mut state = self.state.lock();

        let keys: Vec<&str> = std::iter::once(state.crypto_key.as_str())
            .chain(state.fallback_keys.iter().map(String::as_str))
            .collect();

        match decompress_with_keys(ciphertext, keys) {
            Ok((0, plaintext)) => Ok(plaintext),
            Ok((index, plaintext)) => {
                let state = &mut *state;
                std::mem::swap(&mut state.crypto_key, &mut state.fallback_keys[index - 1]);
                info!(
                    "Session {} promoted fallback key #{} (server key {})",
                    self.remote_addr, index, state.server_key
                );
                Ok(plaintext)
            }
            Err(e) => {
                warn!(
                    "Decrypt failed for {} (class {:?}, server key {}, {} fallback keys): {}",
                    if state.identity.is_empty() { self.remote_addr.to_string() } else { state.identity.clone() },
                    state.client_class,
                    state.server_key,
                    state.fallback_keys.len(),
                    e
                );
                state.last_error = e.to_string();
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Socket
    // ------------------------------------------------------------------

    /// Write a reply to the client.
    ///
    /// Gives up with [`SessionError::Closed`] as soon as the session closes,
    /// even when the peer has stopped reading and the write is stalled.
    pub async fn send(&self, reply: &Reply) -> Result<(), SessionError> {
        if self.is_closing() {
            return Err(SessionError::Closed);
        }

        let wire = reply.to_wire();
        let result = tokio::select! {
            result = self.write_wire(wire.as_bytes()) => result,
            _ = self.closed() => Err(SessionError::Closed),
        };

        if self.is_closing() {
            self.release_writer();
        }
        result
    }

    async fn write_wire(&self, bytes: &[u8]) -> Result<(), SessionError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SessionError::Closed)?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Take the writer out (if no write holds it) and shut it down in the
    /// background.
    fn release_writer(&self) {
        let writer = match self.writer.try_lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => return,
        };
        let Some(mut writer) = writer else {
            return;
        };

        let remote = self.remote_addr;
        tokio::spawn(async move {
            match tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Shutdown of {} failed: {}", remote, e),
                Err(_) => debug!("Shutdown of {} timed out; dropping socket", remote),
            }
        });
    }

    /// Write a single line, CR-LF terminated.
    pub async fn send_line(&self, line: impl Into<String>) -> Result<(), SessionError> {
        self.send(&Reply::Line(line.into())).await
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Close the session. Only the first call does anything; it returns `true`.
    ///
    /// Wakes everything waiting in [`closed`](Self::closed), including the
    /// connection's read loop, any stalled [`send`](Self::send) and any bridge
    /// request on this session. Never waits on the socket.
    pub async fn close(&self) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.state.lock().disconnected_at = Some(Local::now());
        self.closed_tx.send_replace(true);

        // A stalled send holds the writer; it releases it once it sees the close
        self.release_writer();
        debug!("Session {} ({}) closed", self.id, self.label());
        true
    }

    /// Resolves once the session is closing.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Serializable view for the REST API
    pub fn snapshot(&self) -> SessionInfo {
        let state = self.state.lock();
        SessionInfo {
            id: state.identity.clone(),
            name: state.display_name.clone(),
            host: state.hostname.clone(),
            address: self.remote_addr.ip().to_string(),
            port: self.remote_addr.port(),
            local_port: self.local_port,
            app_type: state.app_type.clone(),
            app_version: state.app_version.clone(),
            client_class: state.client_class,
            connected_at: self.connected_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            connected_secs: self.started.elapsed().as_secs(),
            idle_secs: state.last_activity.elapsed().as_secs(),
            busy: state.busy,
            requests: state.request_counter,
            last_ping_secs: state.last_ping.map(|t| t.elapsed().as_secs()),
            clock_skew_secs: state.clock_skew_secs,
            expiry: state.expiry.map(|d| d.format("%Y-%m-%d").to_string()),
            last_error: state.last_error.clone(),
        }
    }
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("identity", &self.identity())
            .field("closing", &self.is_closing())
            .finish()
    }
}
