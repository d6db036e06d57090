//! Well-known label keys
//!
//! These labels are the durable state the coordinator keeps on nodes and
//! pods. The keys must stay stable so previously labelled objects keep
//! their meaning across versions.

use serde_json::{json, Value};

pub const LABEL_PREFIX: &str = "suss.world-direct.at/";

/// Set to `"true"` on a node whose lock should be released on next start
pub const DELAYED_RELEASE: &str = "suss.world-direct.at/delayedrelease";

/// Unix timestamp of the last release, informational only
pub const LAST_RELEASE: &str = "suss.world-direct.at/lastrelease";

/// Marks a pod that teardown already asked to evict
pub const POD_EVICTED: &str = "suss.world-direct.at/evicted";

/// Explicit criticality override on a pod (`"true"` / `"false"`)
pub const CRITICAL_POD: &str = "suss.world-direct.at/critical";

/// Merge patch setting a single label; an empty value removes it
pub fn patch(key: &str, value: &str) -> Value {
    let value = if value.is_empty() {
        Value::Null
    } else {
        Value::String(value.to_string())
    };
    json!({ "metadata": { "labels": { key: value } } })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_share_prefix() {
        for key in [DELAYED_RELEASE, LAST_RELEASE, POD_EVICTED, CRITICAL_POD] {
            assert!(key.starts_with(LABEL_PREFIX), "{key}");
        }
    }

    #[test]
    fn test_empty_value_patches_null() {
        assert_eq!(
            patch(POD_EVICTED, ""),
            json!({"metadata": {"labels": {"suss.world-direct.at/evicted": null}}})
        );
        assert_eq!(
            patch(POD_EVICTED, "true"),
            json!({"metadata": {"labels": {"suss.world-direct.at/evicted": "true"}}})
        );
    }
}
