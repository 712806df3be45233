//! Password masking for capability configuration.
//!
//! Config values come back to clients as JSON maps. Any field whose schema
//! marks it `FieldType::Password` must never round-trip its real value to
//! a client; it's masked to the sentinel `"***"` instead. When a client
//! submits an update with that sentinel, the registry treats it as "keep
//! existing value" rather than overwriting with the literal string `***`.
//!
//! `Secret` only owns the masking half (serialization); restoring the prior
//! value on the sentinel is the registry's job in
//! [`CapabilityRegistry::update_provider_config`](crate::capability::CapabilityRegistry::update_provider_config),
//! since that step needs the *previous* stored config, which a bare
//! `Deserialize` impl can't see.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Sentinel emitted in place of a non-empty password field's real value.
pub const MASK_SENTINEL: &str = "***";

/// A string that masks itself as `"***"` on serialization when non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Secret(pub String);

impl Secret {
    /// True if this sentinel-masked value should be treated as "caller
    /// wants to keep whatever is already stored".
    pub fn is_mask_sentinel(value: &str) -> bool {
        value == MASK_SENTINEL
    }

    /// Borrow the underlying plaintext.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<String> for Secret {
    fn from(s: String) -> Self {
        Secret(s)
    }
}

impl Serialize for Secret {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if self.0.is_empty() {
            serializer.serialize_str("")
        } else {
            serializer.serialize_str(MASK_SENTINEL)
        }
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // The mask sentinel is resolved by the registry, not here: a bare
        // Deserialize impl has no access to the previously stored value.
        String::deserialize(deserializer).map(Secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_non_empty_value() {
        let s = Secret("hunter2".into());
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, "\"***\"");
    }

    #[test]
    fn does_not_mask_empty_value() {
        let s = Secret(String::new());
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, "\"\"");
    }

    #[test]
    fn round_trip_preserves_sentinel_for_caller_resolution() {
        let s = Secret("hunter2".into());
        let json = serde_json::to_string(&s).unwrap();
        let back: Secret = serde_json::from_str(&json).unwrap();
        assert!(Secret::is_mask_sentinel(&back.0));
    }
}
