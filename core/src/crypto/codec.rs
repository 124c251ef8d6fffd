// Payload codec: zlib + AES-128-CBC + unpadded base64
//
// Wire format shared with deployed clients:
//   compress:   zlib(best) -> PKCS#7 -> AES-128-CBC(key = MD5(key string), IV = 0) -> base64, '=' stripped
//   decompress: re-pad '=' -> base64 -> AES-128-CBC -> lenient PKCS#7 strip -> inflate
//
// MD5 and the zero IV are compatibility requirements of the legacy protocol.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use md5::{Digest, Md5};
use std::io::{Read, Write};
use thiserror::Error;
use zeroize::Zeroize;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Marker every valid decrypted payload carries
pub const VALIDATION_MARKER: &str = "TT=Test";

const ZERO_IV: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Empty input")]
    EmptyInput,
    #[error("No key for client class {0}")]
    NoKey(u8),
    #[error("Compression failed: {0}")]
    CompressionError(String),
    #[error("Cipher failure: {0}")]
    CipherError(String),
    #[error("Base64 decode failed: {0}")]
    DecodeError(String),
    #[error("Ciphertext length {0} is not a multiple of the block size")]
    InvalidLength(usize),
    #[error("Decompression failed: {0}")]
    DecompressionError(String),
    #[error("Decryption failed with all keys")]
    AllKeysFailed,
}

/// Hash a key string down to the 128-bit AES key.
fn cipher_key(key: &str) -> [u8; BLOCK_SIZE] {
    let mut digest = Md5::digest(key.as_bytes());
    let mut out = [0u8; BLOCK_SIZE];
    out.copy_from_slice(&digest);
    digest.as_mut_slice().zeroize();
    out
}

/// PKCS#7-pad `data` to a whole number of blocks.
pub(crate) fn pad_pkcs7(data: &[u8]) -> Vec<u8> {
    let padding_len = BLOCK_SIZE - (data.len() % BLOCK_SIZE);
    let mut buffer = vec![padding_len as u8; data.len() + padding_len];
    buffer[..data.len()].copy_from_slice(data);
    buffer
}

/// Strip PKCS#7 padding using the last byte.
///
/// Out-of-range pad values leave the buffer untouched.
pub(crate) fn strip_pkcs7(buffer: &mut Vec<u8>) {
    if let Some(&padding_len) = buffer.last() {
        let padding_len = padding_len as usize;
        if (1..=BLOCK_SIZE).contains(&padding_len) && padding_len <= buffer.len() {
            buffer.truncate(buffer.len() - padding_len);
        }
    }
}

/// AES-128-CBC encrypt already padded data with a zero IV.
pub(crate) fn encrypt_blocks(padded: &mut [u8], key: &str) -> Result<(), CodecError> {
    let mut aes_key = cipher_key(key);
    let result = Aes128CbcEnc::new_from_slices(&aes_key, &ZERO_IV)
        .map_err(|e| CodecError::CipherError(e.to_string()))
        .and_then(|cipher| {
            let len = padded.len();
            cipher
                .encrypt_padded_mut::<NoPadding>(padded, len)
                .map(|_| ())
                .map_err(|e| CodecError::CipherError(e.to_string()))
        });
    aes_key.zeroize();
    result
}

/// AES-128-CBC decrypt whole blocks in place with a zero IV.
pub(crate) fn decrypt_blocks(data: &mut [u8], key: &str) -> Result<(), CodecError> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(CodecError::InvalidLength(data.len()));
    }

    let mut aes_key = cipher_key(key);
    let result = Aes128CbcDec::new_from_slices(&aes_key, &ZERO_IV)
        .map_err(|e| CodecError::CipherError(e.to_string()))
        .and_then(|cipher| {
            cipher
                .decrypt_padded_mut::<NoPadding>(data)
                .map(|_| ())
                .map_err(|e| CodecError::CipherError(e.to_string()))
        });
    aes_key.zeroize();
    result
}

/// Encode bytes as base64 without trailing `=`.
pub(crate) fn encode_unpadded(data: &[u8]) -> String {
    let mut text = STANDARD.encode(data);
    let trimmed = text.trim_end_matches('=').len();
    text.truncate(trimmed);
    text
}

/// Decode base64 that may have had its `=` padding removed.
pub(crate) fn decode_unpadded(text: &str) -> Result<Vec<u8>, CodecError> {
    let mut padded = text.trim().to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    STANDARD
        .decode(padded.as_bytes())
        .map_err(|e| CodecError::DecodeError(e.to_string()))
}

/// Compress and encrypt `plaintext` under `key` into wire text.
pub fn compress(plaintext: &str, key: &str) -> Result<String, CodecError> {
    if plaintext.is_empty() {
        return Err(CodecError::EmptyInput);
    }

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(plaintext.as_bytes())
        .map_err(|e| CodecError::CompressionError(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| CodecError::CompressionError(e.to_string()))?;

    let mut buffer = pad_pkcs7(&compressed);
    encrypt_blocks(&mut buffer, key)?;

    Ok(encode_unpadded(&buffer))
}

/// Decrypt and decompress wire text produced by [`compress`].
pub fn decompress(ciphertext: &str, key: &str) -> Result<String, CodecError> {
    if ciphertext.is_empty() {
        return Err(CodecError::EmptyInput);
    }

    let mut buffer = decode_unpadded(ciphertext)?;
    if buffer.is_empty() {
        return Err(CodecError::EmptyInput);
    }
    decrypt_blocks(&mut buffer, key)?;
    strip_pkcs7(&mut buffer);

    let mut decoder = ZlibDecoder::new(buffer.as_slice());
    let mut inflated = Vec::new();
    decoder
        .read_to_end(&mut inflated)
        .map_err(|e| CodecError::DecompressionError(e.to_string()))?;

    Ok(String::from_utf8_lossy(&inflated).into_owned())
}

/// Decrypt with each key in turn, accepting the first result that carries
/// the validation marker.
///
/// Returns the index of the accepted key alongside the plaintext.
pub fn decompress_with_keys<'a, I>(ciphertext: &str, keys: I) -> Result<(usize, String), CodecError>
where
    I: IntoIterator<Item = &'a str>,
{
    if ciphertext.is_empty() {
        return Err(CodecError::EmptyInput);
    }

    for (index, key) in keys.into_iter().enumerate() {
        if key.is_empty() {
            continue;
        }
        match decompress(ciphertext, key) {
            Ok(plaintext) if plaintext.contains(VALIDATION_MARKER) => return Ok((index, plaintext)),
            Ok(_) => tracing::debug!("Key #{} decrypted without validation marker", index),
            Err(e) => tracing::debug!("Key #{} failed to decrypt: {}", index, e),
        }
    }

    Err(CodecError::AllKeysFailed)
}
