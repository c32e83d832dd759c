//! Range helpers for prefix scans and sortable keys.

/// Exclusive end bound for a prefix scan: `"run-1:"` becomes `"run-1;"`.
pub fn prefix_end_bound(prefix: &str) -> String {
    if prefix.is_empty() {
        return String::new();
    }

    let mut bytes = prefix.as_bytes().to_vec();
    if let Some(last) = bytes.last_mut() {
        *last = last.saturating_add(1);
    }

    String::from_utf8(bytes).unwrap_or_else(|_| format!("{}\x7F", prefix))
}

/// `(start, end)` pair for `table.range(start..end)`.
pub fn prefix_range(prefix: &str) -> (String, String) {
    (prefix.to_string(), prefix_end_bound(prefix))
}

/// Zero-padded decimal so lexical order equals numeric order.
pub fn sortable_u64(value: u64) -> String {
    format!("{:020}", value)
}

/// Parse the numeric suffix written by [`sortable_u64`] after the last `sep`.
pub fn parse_sortable_suffix(key: &str, sep: char) -> Option<u64> {
    key.rsplit(sep).next()?.parse().ok()
}
