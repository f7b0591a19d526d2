//! Key/value records as reported by the music server.
//!
//! Every response of the server is a flat list of `key: value` lines. A
//! single-record response (status, current song) collapses into one
//! [`Attrs`]; list responses (queue, stored playlists) are split into one
//! record per boundary key.

use std::collections::BTreeMap;

/// One record: attribute name to value.
pub type Attrs = BTreeMap<String, String>;

/// Collapse all pairs into a single record. Later duplicates win.
pub fn to_attrs(pairs: Vec<(String, String)>) -> Attrs {
    pairs.into_iter().collect()
}

/// Split pairs into records, starting a new record whenever one of the
/// `boundaries` keys shows up.
///
/// Pairs that appear before the first boundary key are dropped, since they
/// don't belong to any record.
pub fn split_records(pairs: Vec<(String, String)>, boundaries: &[&str]) -> Vec<Attrs> {
    let mut records = Vec::new();
    let mut current: Option<Attrs> = None;

    for (key, value) in pairs {
        if boundaries.contains(&key.as_str()) {
            if let Some(done) = current.take() {
                records.push(done);
            }
            current = Some(Attrs::new());
        }
        if let Some(record) = current.as_mut() {
            record.insert(key, value);
        }
    }

    if let Some(done) = current {
        records.push(done);
    }
    records
}

/// Collect the values of every pair with the given key, in order.
pub fn values_of(pairs: Vec<(String, String)>, key: &str) -> Vec<String> {
    pairs
        .into_iter()
        .filter(|(k, _)| k == key)
        .map(|(_, v)| v)
        .collect()
}
