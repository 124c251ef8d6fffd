// Cryptography module: legacy key derivation and payload codec

pub mod codec;
pub mod dictionary;
pub mod keys;
pub mod registration;

pub use codec::{compress, decompress, CodecError, VALIDATION_MARKER};
pub use dictionary::{KeyOverrides, SpecialKeyOverride};
pub use keys::{derive_key, generate_server_key, resolve_session_keys, SessionKeys};
pub use registration::{generate_registration_key, validate_registration_key};
