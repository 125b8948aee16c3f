//! Small helpers for merging layered configuration values.

use std::collections::BTreeMap;

/// Returns the first populated value, scanning left to right.
///
/// Used when building effective configuration from user values, pool-level
/// defaults and library defaults.
pub fn pick<T>(values: impl IntoIterator<Item = Option<T>>) -> Option<T> {
    values.into_iter().flatten().next()
}

/// Like [`pick`], but falls back to `default` when every value is unset.
pub fn pick_or<T>(values: impl IntoIterator<Item = Option<T>>, default: T) -> T {
    pick(values).unwrap_or(default)
}

/// Joins map entries as `<key><kv><value>` pairs separated by `sep`,
/// in key order.
///
/// Produces deterministic strings like etcd's `initial-cluster` member list.
pub fn join_sorted(values: &BTreeMap<String, String>, kv: &str, sep: &str) -> String {
    values
        .iter()
        .map(|(k, v)| format!("{k}{kv}{v}"))
        .collect::<Vec<_>>()
        .join(sep)
}
