// RepCol Core: compatibility server for legacy report-collection clients
//
// Clients speak a line protocol over TCP (INIT / INFO / PING / GREQ / SRSP).
// Payloads are zlib + AES-128-CBC + unpadded base64, keyed per session from a
// fixed dictionary. The wire format is frozen by deployed clients.

pub mod config;
pub mod crypto;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

pub use config::{ManagerConfig, ServerConfig};
pub use crypto::{
    compress, decompress, derive_key, generate_registration_key, validate_registration_key,
    CodecError, KeyOverrides, SpecialKeyOverride,
};
pub use protocol::{Command, Params, ProtocolError, Reply};
pub use registry::{BridgeError, CommandError, LifecycleManager, SessionRegistry};
pub use session::{ConnectionSession, HandshakeError, SessionError, SessionInfo};
pub use transport::TransportError;
