//! Legacy key material: the crypto dictionary and per-class key overrides.
//!
//! Both tables are fixed inputs to key derivation. Deployed clients carry the
//! same values, so changing any entry breaks compatibility with every client
//! of the affected class.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Number of dictionary entries; valid client classes are `1..=DICTIONARY_SIZE`.
pub const DICTIONARY_SIZE: u8 = 10;

/// Dictionary entries, indexed by `client_class - 1`.
const DICTIONARY: [&str; DICTIONARY_SIZE as usize] = [
    "Kx7vQ2mPzL",
    "Rb4Tn9WcHs",
    "Mf8Jd3YgVe",
    "Pq5Zk1XuNa",
    "Hw2Lc6BrTo",
    "Ge9Vy4SiDm",
    "Nt3Ua7FpKj",
    "Dz6Ow8QhEl",
    "Ys1Ie5CnWb",
    "Lj0Ax2GtRv",
];

/// Look up the dictionary entry for a client class.
///
/// Returns `None` for classes outside `1..=10`.
pub fn dictionary_entry(class_id: u8) -> Option<&'static str> {
    if class_id == 0 || class_id > DICTIONARY_SIZE {
        return None;
    }
    Some(DICTIONARY[(class_id - 1) as usize])
}

/// Check whether a client class is inside the dictionary range.
pub fn is_valid_class(class_id: u8) -> bool {
    dictionary_entry(class_id).is_some()
}

/// A hand-assigned key for a legacy client class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialKeyOverride {
    /// Client class this override applies to
    pub class_id: u8,
    /// Literal crypto key used instead of the derived one
    pub key: String,
    /// Key length announced to the client in the INIT reply
    pub key_length: usize,
    /// Disabled overrides are ignored
    pub enabled: bool,
}

/// Immutable lookup table of key overrides, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct KeyOverrides {
    by_class: HashMap<u8, SpecialKeyOverride>,
}

impl KeyOverrides {
    /// Build the table. A later entry for the same class replaces an earlier one.
    pub fn new(overrides: impl IntoIterator<Item = SpecialKeyOverride>) -> Self {
        let by_class = overrides
            .into_iter()
            .map(|o| (o.class_id, o))
            .collect();
        Self { by_class }
    }

    /// The override for `class_id`, only if it exists and is enabled.
    pub fn enabled_for(&self, class_id: u8) -> Option<&SpecialKeyOverride> {
        self.by_class.get(&class_id).filter(|o| o.enabled)
    }

    pub fn len(&self) -> usize {
        self.by_class.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_class.is_empty()
    }
}
