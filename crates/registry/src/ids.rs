//! Identifier generation: prefix + `YYYYMMDDhhmmss` + 4 random alphanumerics.

use chrono::{DateTime, Utc};

/// Prefix of service group ids.
pub const GROUP_ID_PREFIX: &str = "GRP";

/// Prefix of cluster event ids.
pub const EVENT_ID_PREFIX: &str = "EVT";

/// Prefix of ack ids.
pub const ACK_ID_PREFIX: &str = "ACK";

const TIMESTAMP_LEN: usize = 14;
const SUFFIX_LEN: usize = 4;

/// Generate an id with the given prefix, stamped with `at`.
pub fn generate(prefix: &str, at: DateTime<Utc>) -> String {
    let mut id = String::with_capacity(prefix.len() + TIMESTAMP_LEN + SUFFIX_LEN);
    id.push_str(prefix);
    id.push_str(&at.format("%Y%m%d%H%M%S").to_string());
    id.extend(std::iter::repeat_with(fastrand::alphanumeric).take(SUFFIX_LEN));
    id
}

/// Whether `id` has the shape produced by [`generate`] for `prefix`.
pub fn is_well_formed(prefix: &str, id: &str) -> bool {
    let Some(rest) = id.strip_prefix(prefix) else {
        return false;
    };

    rest.len() == TIMESTAMP_LEN + SUFFIX_LEN
        && rest[..TIMESTAMP_LEN].bytes().all(|b| b.is_ascii_digit())
        && rest[TIMESTAMP_LEN..].bytes().all(|b| b.is_ascii_alphanumeric())
}
