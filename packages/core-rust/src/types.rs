use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::keys;

/// Weight assumed for an instance that does not advertise a usable one.
pub const DEFAULT_WEIGHT: u32 = 100;

/// Metadata key carrying the load-balancing weight of an instance.
pub const WEIGHT_KEY: &str = "weight";

/// Identity of one registered service instance.
///
/// Stored as JSON under `/<prefix>/<name>/<addr>`. The record is treated as
/// immutable once registered: changing any field means registering again,
/// possibly under a new key.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Logical service name shared by all instances.
    pub name: String,
    /// Transport scheme (`rpc`, `http`, ...).
    pub scheme: String,
    /// Network address, `host:port` or a URI.
    pub addr: String,
    /// Free-form routing tags, including the balancing weight.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub env: String,
    #[serde(default)]
    pub version: String,
}

impl ServiceInfo {
    /// Creates a record with only the identity fields set.
    #[must_use]
    pub fn new(name: impl Into<String>, scheme: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scheme: scheme.into(),
            addr: addr.into(),
            ..Self::default()
        }
    }

    /// Adds a metadata entry, returning the updated record.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Coordination-store key for this instance under `prefix`.
    #[must_use]
    pub fn key(&self, prefix: &str) -> String {
        keys::instance_key(prefix, &self.name, &self.addr)
    }

    /// Load-balancing weight advertised in `metadata["weight"]`.
    ///
    /// Missing, unparsable, and non-positive values all resolve to
    /// [`DEFAULT_WEIGHT`].
    #[must_use]
    pub fn weight(&self) -> u32 {
        parse_weight(self.metadata.get(WEIGHT_KEY).map(String::as_str))
    }

    /// Serializes the record into its stored form.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parses a record from its stored form.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not a valid JSON record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Derives a balancing weight from its raw metadata value.
#[must_use]
pub fn parse_weight(raw: Option<&str>) -> u32 {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|w| *w > 0)
        .map_or(DEFAULT_WEIGHT, |w| u32::try_from(w).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn sample() -> ServiceInfo {
        ServiceInfo {
            name: "greeter".to_string(),
            scheme: "rpc".to_string(),
            addr: "10.0.0.7:9000".to_string(),
            metadata: BTreeMap::from([
                ("weight".to_string(), "250".to_string()),
                ("color".to_string(), "blue".to_string()),
            ]),
            region: "eu-west".to_string(),
            zone: "eu-west-1b".to_string(),
            env: "prod".to_string(),
            version: "1.4.2".to_string(),
        }
    }

    #[test]
    fn weight_derivation_table() {
        let cases = [
            (None, 100),
            (Some("0"), 100),
            (Some("-5"), 100),
            (Some("abc"), 100),
            (Some("250"), 250),
        ];
        for (raw, expected) in cases {
            assert_eq!(parse_weight(raw), expected, "raw = {raw:?}");
        }
    }

    #[test]
    fn weight_reads_metadata() {
        assert_eq!(sample().weight(), 250);
        assert_eq!(ServiceInfo::new("a", "rpc", "h:1").weight(), DEFAULT_WEIGHT);
    }

    #[test]
    fn stored_form_round_trips_every_field() {
        let info = sample();
        let bytes = info.to_bytes().unwrap();
        assert_eq!(ServiceInfo::from_bytes(&bytes).unwrap(), info);
    }

    #[test]
    fn stored_form_is_readable_json() {
        let text = String::from_utf8(sample().to_bytes().unwrap()).unwrap();
        assert!(text.contains("\"name\":\"greeter\""));
        assert!(text.contains("\"weight\":\"250\""));
    }

    #[test]
    fn missing_optional_fields_default() {
        let info =
            ServiceInfo::from_bytes(br#"{"name":"a","scheme":"rpc","addr":"h:1"}"#).unwrap();
        assert!(info.metadata.is_empty());
        assert!(info.version.is_empty());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(ServiceInfo::from_bytes(b"not json").is_err());
    }

    proptest! {
        #[test]
        fn positive_weights_are_kept(w in 1u32..=1_000_000) {
            prop_assert_eq!(parse_weight(Some(&w.to_string())), w);
        }

        #[test]
        fn non_positive_weights_fall_back(w in i64::MIN..=0) {
            prop_assert_eq!(parse_weight(Some(&w.to_string())), DEFAULT_WEIGHT);
        }
    }
}
