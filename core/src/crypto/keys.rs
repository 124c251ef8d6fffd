// Key derivation: reproduces the legacy server's per-session key construction
//
//   crypto_key = server_key + dict[class][..length] + host[..2] + host[last]
//
// The per-class branches below are literal compatibility rules for clients
// already in the field. Keep them as explicit cases.

use super::codec::CodecError;
use super::dictionary::{dictionary_entry, KeyOverrides};
use rand::Rng;

/// Key length announced to ordinary clients
pub const DEFAULT_KEY_LENGTH: usize = 1;

/// Class 8 clients ignore the issued fragment and expect this one
pub const CLASS8_SERVER_KEY: &str = "D028";
pub const CLASS8_KEY_LENGTH: usize = 4;

/// Class 9 clients use a two-character dictionary prefix
pub const CLASS9_KEY_LENGTH: usize = 2;

/// Extra fallback accepted from overridden class 2 clients
pub const CLASS2_LEGACY_KEY: &str = "RpS2-7741-LEGACY";

/// Length of a freshly issued server key fragment
pub const SERVER_KEY_LENGTH: usize = 4;

const SERVER_KEY_ALPHABET: &[u8] = b"0123456789ABCDEF";

/// Key material negotiated for one INIT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    /// Fragment echoed to the client as `KEY=`
    pub server_key: String,
    /// Length echoed to the client as `LEN=`
    pub key_length: usize,
    /// Primary crypto key
    pub crypto_key: String,
    /// Keys tried in order when the primary fails to decrypt
    pub fallback_keys: Vec<String>,
}

/// Derive a crypto key for a client.
///
/// Returns `None` when `class_id` is outside the dictionary. Callers must
/// treat that as a hard failure.
pub fn derive_key(server_key: &str, class_id: u8, length: usize, hostname: &str) -> Option<String> {
    let entry = dictionary_entry(class_id)?;

    let mut key = String::with_capacity(server_key.len() + length + 3);
    key.push_str(server_key);
    key.extend(entry.chars().take(length));
    key.extend(hostname.chars().take(2));
    if let Some(last) = hostname.chars().last() {
        key.push(last);
    }
    Some(key)
}

/// Generate a fresh server key fragment.
pub fn generate_server_key() -> String {
    let mut rng = rand::thread_rng();
    (0..SERVER_KEY_LENGTH)
        .map(|_| SERVER_KEY_ALPHABET[rng.gen_range(0..SERVER_KEY_ALPHABET.len())] as char)
        .collect()
}

/// Resolve the keys for an INIT from a client of `class_id` on `hostname`.
///
/// `server_key` is the freshly issued fragment; class 8 replaces it.
pub fn resolve_session_keys(
    class_id: u8,
    hostname: &str,
    server_key: &str,
    overrides: &KeyOverrides,
) -> Result<SessionKeys, CodecError> {
    if let Some(special) = overrides.enabled_for(class_id) {
        let derived = derive_key(server_key, class_id, special.key_length, hostname)
            .ok_or(CodecError::NoKey(class_id))?;

        let mut fallback_keys = vec![derived];
        if class_id == 2 {
            fallback_keys.push(CLASS2_LEGACY_KEY.to_string());
        }

        return Ok(SessionKeys {
            server_key: server_key.to_string(),
            key_length: special.key_length,
            crypto_key: special.key.clone(),
            fallback_keys,
        });
    }

    let (server_key, key_length) = match class_id {
        8 => (CLASS8_SERVER_KEY, CLASS8_KEY_LENGTH),
        9 => (server_key, CLASS9_KEY_LENGTH),
        _ => (server_key, DEFAULT_KEY_LENGTH),
    };

    let crypto_key =
        derive_key(server_key, class_id, key_length, hostname).ok_or(CodecError::NoKey(class_id))?;

    Ok(SessionKeys {
        server_key: server_key.to_string(),
        key_length,
        crypto_key,
        fallback_keys: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::dictionary::{dictionary_entry, SpecialKeyOverride};
    use proptest::prelude::*;

    #[test]
    fn test_derive_key_layout() {
        // class 3 entry is "Mf8Jd3YgVe"
        let key = derive_key("A1B2", 3, 1, "PCAB").unwrap();
        assert_eq!(key, "A1B2MPCB");
    }

    #[test]
    fn test_derive_key_truncates_not_pads() {
        let key = derive_key("S", 1, 4, "HOST").unwrap();
        assert_eq!(key, "SKx7vHOT");

        // Longer than the entry: entry is used in full
        let key = derive_key("S", 1, 50, "HOST").unwrap();
        assert_eq!(key, "SKx7vQ2mPzLHOT");
    }

    #[test]
    fn test_derive_key_short_hostnames() {
        assert_eq!(derive_key("K", 2, 1, "X").unwrap(), "KRXX");
        assert_eq!(derive_key("K", 2, 1, "").unwrap(), "KR");
        assert_eq!(derive_key("K", 2, 1, "AB").unwrap(), "KRABB");
    }

    #[test]
    fn test_derive_key_invalid_class() {
        assert!(derive_key("K", 0, 1, "HOST").is_none());
        assert!(derive_key("K", 11, 1, "HOST").is_none());
    }

    #[test]
    fn test_generate_server_key_format() {
        let key = generate_server_key();
        assert_eq!(key.len(), SERVER_KEY_LENGTH);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn test_resolve_default_class() {
        let keys = resolve_session_keys(3, "PCAB", "F00D", &KeyOverrides::default()).unwrap();
        assert_eq!(keys.server_key, "F00D");
        assert_eq!(keys.key_length, 1);
        assert_eq!(keys.crypto_key, "F00DMPCB");
        assert!(keys.fallback_keys.is_empty());
    }

    #[test]
    fn test_resolve_class8_forces_fragment() {
        let keys = resolve_session_keys(8, "TILL01", "F00D", &KeyOverrides::default()).unwrap();
        assert_eq!(keys.server_key, "D028");
        assert_eq!(keys.key_length, 4);
        assert_eq!(keys.crypto_key, "D028Dz6OTI1");
    }

    #[test]
    fn test_resolve_class9_length() {
        let keys = resolve_session_keys(9, "BOX", "0A0A", &KeyOverrides::default()).unwrap();
        assert_eq!(keys.key_length, 2);
        assert_eq!(keys.crypto_key, "0A0AYsBOX");
    }

    #[test]
    fn test_resolve_override_keeps_derived_fallback() {
        let overrides = KeyOverrides::new(vec![SpecialKeyOverride {
            class_id: 5,
            key: "HANDKEY".to_string(),
            key_length: 3,
            enabled: true,
        }]);

        let keys = resolve_session_keys(5, "WS", "1234", &overrides).unwrap();
        assert_eq!(keys.crypto_key, "HANDKEY");
        assert_eq!(keys.key_length, 3);
        assert_eq!(keys.server_key, "1234");
        assert_eq!(keys.fallback_keys, vec!["1234Hw2WSS".to_string()]);
    }

    #[test]
    fn test_resolve_override_class2_gets_legacy_fallback() {
        let overrides = KeyOverrides::new(vec![SpecialKeyOverride {
            class_id: 2,
            key: "CLASS2KEY".to_string(),
            key_length: 1,
            enabled: true,
        }]);

        let keys = resolve_session_keys(2, "POS", "ABCD", &overrides).unwrap();
        assert_eq!(keys.crypto_key, "CLASS2KEY");
        assert_eq!(keys.fallback_keys.len(), 2);
        assert_eq!(keys.fallback_keys[1], CLASS2_LEGACY_KEY);
    }

    #[test]
    fn test_resolve_override_takes_precedence_over_class8() {
        let overrides = KeyOverrides::new(vec![SpecialKeyOverride {
            class_id: 8,
            key: "EIGHT".to_string(),
            key_length: 2,
            enabled: true,
        }]);

        let keys = resolve_session_keys(8, "H", "9999", &overrides).unwrap();
        assert_eq!(keys.server_key, "9999");
        assert_eq!(keys.crypto_key, "EIGHT");
    }

    #[test]
    fn test_resolve_invalid_class() {
        let result = resolve_session_keys(0, "H", "9999", &KeyOverrides::default());
        assert!(matches!(result, Err(CodecError::NoKey(0))));
    }

    proptest! {
        #[test]
        fn prop_derive_key_formula(
            server_key in "[0-9A-F]{0,6}",
            class_id in 1u8..=10,
            length in 0usize..16,
            hostname in "[A-Za-z0-9]{0,12}",
        ) {
            let entry = dictionary_entry(class_id).unwrap();
            let mut expected = server_key.clone();
            expected.push_str(&entry[..length.min(entry.len())]);
            expected.push_str(&hostname[..hostname.len().min(2)]);
            if !hostname.is_empty() {
                expected.push_str(&hostname[hostname.len() - 1..]);
            }

            let key = derive_key(&server_key, class_id, length, &hostname).unwrap();
            prop_assert_eq!(key, expected);
        }
    }
}
