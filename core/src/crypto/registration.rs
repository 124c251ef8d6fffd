//! Product registration keys.
//!
//! A registration key is a fixed 13-character literal encrypted under
//! AES-128-CBC (zero IV) with the MD5 hash of the serial number as key.
//! A key is valid for a serial when it decrypts back to that literal.

use super::codec::{decode_unpadded, decrypt_blocks, encode_unpadded, encrypt_blocks, pad_pkcs7, strip_pkcs7};
use super::CodecError;

/// Plaintext sealed inside every registration key
pub const REGISTRATION_LITERAL: &str = "REPORTSERVER1";

/// Generate the registration key for `serial`.
pub fn generate_registration_key(serial: &str) -> Result<String, CodecError> {
    if serial.is_empty() {
        return Err(CodecError::EmptyInput);
    }

    let mut buffer = pad_pkcs7(REGISTRATION_LITERAL.as_bytes());
    encrypt_blocks(&mut buffer, serial)?;
    Ok(encode_unpadded(&buffer))
}

/// Check whether `key` is the registration key for `serial`.
pub fn validate_registration_key(serial: &str, key: &str) -> bool {
    if serial.is_empty() || key.is_empty() {
        return false;
    }

    let Ok(mut buffer) = decode_unpadded(key) else {
        return false;
    };
    if buffer.is_empty() || decrypt_blocks(&mut buffer, serial).is_err() {
        return false;
    }
    strip_pkcs7(&mut buffer);

    buffer == REGISTRATION_LITERAL.as_bytes()
}
