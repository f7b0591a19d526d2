//! Identifiers handed out by the gateway.

use ulid::Ulid;

/// Prefix of client connection ids.
pub const CLIENT_PREFIX: &str = "cl";

/// `<prefix>_<ULID>`.
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{prefix}_{}", Ulid::new())
}

/// A fresh id for a websocket client, used as its key in the broker.
///
/// ```
/// let id = webmpc_common::id::client_id();
/// assert!(id.starts_with("cl_"));
/// ```
pub fn client_id() -> String {
    prefixed_ulid(CLIENT_PREFIX)
}
