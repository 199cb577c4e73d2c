use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use skiff_domain::TargetState;

/// The target-state row as persisted: the document plus the metadata the
/// reconciler and cloud sync key change detection on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTargetState {
    pub target: TargetState,
    /// Monotonically increasing, bumped on every save.
    pub version: u64,
    /// SHA-256 over the canonical JSON of `target`.
    pub hash: String,
}

/// Serialize `value` to canonical JSON (object keys sorted) and return its
/// SHA-256 hex digest. A pure function of the JSON value: any change in
/// content changes the hash, and field ordering never does.
pub fn canonical_hash<T: Serialize>(value: &T) -> String {
    let v = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
    let canonical = sort_json_keys(v);
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    format!("{:x}", digest)
}

fn sort_json_keys(v: serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, serde_json::Value> = map
                .into_iter()
                .map(|(k, v)| (k, sort_json_keys(v)))
                .collect();
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(sort_json_keys).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_under_key_reordering() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":3}}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"a":{"x":3,"y":2},"b":1}"#).unwrap();
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn hash_changes_with_content() {
        let a: serde_json::Value = serde_json::from_str(r#"{"a":1}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"a":2}"#).unwrap();
        assert_ne!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn hash_of_equal_targets_is_equal() {
        let doc = r#"{"apps":{"1":{"app_id":1,"app_name":"web","services":[]}},"config":{}}"#;
        let t1: TargetState = serde_json::from_str(doc).unwrap();
        let t2: TargetState = serde_json::from_str(doc).unwrap();
        assert_eq!(canonical_hash(&t1), canonical_hash(&t2));
    }
}
