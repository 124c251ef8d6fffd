// Lifecycle Manager: session creation, command dispatch and idle eviction
//
// Every inbound line from a connection goes through `handle_line`. Handshake
// work is done on the session itself; this layer owns everything that touches
// the registry (promotion, takeover, request queues).

use super::{QueuedRequest, SessionRegistry};
use crate::config::ManagerConfig;
use crate::crypto::{CodecError, KeyOverrides};
use crate::protocol::messages::{PARAM_DATA, PARAM_SEQUENCE};
use crate::protocol::{parse_line, Command, Params, ProtocolError, Reply};
use crate::session::{ConnectionSession, HandshakeError, SessionInfo, SessionWriter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Anything that turns a command into a `503` reply
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl CommandError {
    pub fn to_reply(&self) -> Reply {
        Reply::error(self.to_string())
    }
}

/// Owns the registry and drives every session through its lifecycle
pub struct LifecycleManager {
    registry: SessionRegistry,
    overrides: KeyOverrides,
    config: ManagerConfig,
    next_conn_id: AtomicU64,
}

impl LifecycleManager {
    pub fn new(config: ManagerConfig, overrides: KeyOverrides) -> Self {
        Self {
            registry: SessionRegistry::new(),
            overrides,
            config,
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Create a pending session for a freshly accepted socket
    pub fn open_session(
        &self,
        remote_addr: SocketAddr,
        local_port: u16,
        writer: SessionWriter,
    ) -> Arc<ConnectionSession> {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(ConnectionSession::new(id, remote_addr, local_port, writer));
        self.registry.insert_pending(session.clone());
        info!("Connection #{} from {} on port {}", id, remote_addr, local_port);
        session
    }

    /// Remove a session from the registry and close its socket
    pub async fn close_session(&self, session: &ConnectionSession) {
        let identity = session.identity();
        self.registry.remove(session, &identity);
        if session.close().await {
            info!(
                "Connection #{} ({}) closed after {}s",
                session.id(),
                session.label(),
                session.connected_for().as_secs()
            );
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Process one inbound line and produce the reply to send back.
    pub async fn handle_line(&self, session: &Arc<ConnectionSession>, line: &str) -> Reply {
        session.touch();

        match self.dispatch(session, line).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!("Command from {} failed: {}", session.label(), e);
                session.set_last_error(e.to_string());
                e.to_reply()
            }
        }
    }

    async fn dispatch(&self, session: &Arc<ConnectionSession>, line: &str) -> Result<Reply, CommandError> {
        let (name, params) = parse_line(line).ok_or(ProtocolError::EmptyLine)?;

        let command = Command::from_name(&name);
        match &command {
            Command::Init => Ok(session.handle_init(&params, &self.overrides)?),
            Command::Ping => {
                session.record_ping();
                Ok(Reply::ok())
            }
            Command::Info => self.handle_info(session, &params).await,
            Command::Greq => self.handle_greq(session),
            Command::Srsp => self.handle_srsp(session, &params),
            Command::Vers | Command::Dwnl => {
                debug!("{} from {} acknowledged", command.name(), session.label());
                Ok(Reply::ok())
            }
            Command::Errl => {
                let report: Vec<String> = params
                    .iter()
                    .map(|(k, v)| if v.is_empty() { k.to_string() } else { format!("{}={}", k, v) })
                    .collect();
                warn!("Client error reported by {}: {}", session.label(), report.join(" "));
                Ok(Reply::ok())
            }
            Command::Unknown(name) => Err(ProtocolError::UnknownCommand(name.clone()).into()),
        }
    }

    async fn handle_info(&self, session: &Arc<ConnectionSession>, params: &Params) -> Result<Reply, CommandError> {
        let outcome = session.handle_info(params)?;

        if outcome.newly_identified {
            if let Some(displaced) = self.registry.promote(session, &outcome.identity) {
                warn!(
                    "Client {} reconnected from {}; closing previous connection #{} from {}",
                    outcome.identity,
                    session.remote_addr(),
                    displaced.id(),
                    displaced.remote_addr()
                );
                displaced.close().await;
            }
            info!(
                "Client {} active ({} active, {} pending)",
                outcome.identity,
                self.registry.active_count(),
                self.registry.pending_count()
            );
        }

        Ok(outcome.reply)
    }

    /// Identity of `session` when it is the registered holder of it
    fn active_identity(&self, session: &ConnectionSession) -> Result<String, ProtocolError> {
        let identity = session.identity();
        match self.registry.active(&identity) {
            Some(holder) if !identity.is_empty() && holder.id() == session.id() => Ok(identity),
            _ => Err(ProtocolError::NotAuthenticated),
        }
    }

    fn handle_greq(&self, session: &ConnectionSession) -> Result<Reply, CommandError> {
        let identity = self.active_identity(session)?;

        match self.registry.take_request(&identity) {
            Some(QueuedRequest { seq, data }) => {
                debug!("Request {} picked up by {}", seq, identity);
                Ok(Reply::ok_with(format!("{}={} {}={}", PARAM_SEQUENCE, seq, PARAM_DATA, data)))
            }
            None => Ok(Reply::ok()),
        }
    }

    fn handle_srsp(&self, session: &ConnectionSession, params: &Params) -> Result<Reply, CommandError> {
        let identity = self.active_identity(session)?;

        let seq = params
            .get_non_empty(PARAM_SEQUENCE)
            .ok_or(ProtocolError::MissingParameter(PARAM_SEQUENCE))?
            .parse::<u64>()
            .map_err(|_| ProtocolError::InvalidParameter(PARAM_SEQUENCE))?;
        let data = params
            .get_non_empty(PARAM_DATA)
            .ok_or(ProtocolError::MissingParameter(PARAM_DATA))?;

        if self.registry.deliver_response(&identity, session.id(), seq, data.to_string()) {
            debug!("Response {} delivered by {}", seq, identity);
        } else {
            warn!("Late response {} from {} discarded; no caller waiting", seq, identity);
        }
        Ok(Reply::ok())
    }

    // ------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------

    /// Close pending sessions past the pending timeout and active sessions
    /// idle past the idle timeout. Returns the number closed.
    pub async fn sweep_idle(&self) -> usize {
        let mut expired: Vec<Arc<ConnectionSession>> = self
            .registry
            .pending_sessions()
            .into_iter()
            .filter(|s| s.connected_for() > self.config.pending_timeout)
            .collect();
        expired.extend(
            self.registry
                .active_sessions()
                .into_iter()
                .filter(|s| s.idle_for() > self.config.idle_timeout),
        );

        for session in &expired {
            info!(
                "Evicting idle connection #{} ({}), idle {}s",
                session.id(),
                session.label(),
                session.idle_for().as_secs()
            );
            self.close_session(session).await;
        }
        expired.len()
    }

    /// Run `sweep_idle` on the configured interval, forever
    pub async fn run_sweeper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let closed = self.sweep_idle().await;
            if closed > 0 {
                let stats = self.registry.stats();
                debug!(
                    "Sweep closed {} sessions; {} active, {} pending, {} queued, {} waiting",
                    closed, stats.active, stats.pending, stats.queued_requests, stats.waiting_responses
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Snapshots of all active sessions, ordered by identity
    pub fn client_list(&self) -> Vec<SessionInfo> {
        let mut clients: Vec<SessionInfo> = self
            .registry
            .active_sessions()
            .iter()
            .map(|s| s.snapshot())
            .collect();
        clients.sort_by(|a, b| a.id.cmp(&b.id));
        clients
    }

    /// Snapshot of the active session for `identity`
    pub fn client_stat(&self, identity: &str) -> Option<SessionInfo> {
        self.registry.active(identity).map(|s| s.snapshot())
    }
}
