//! Smol utilities for logging

use std::ascii;

/// Make an Ascii-safe string
pub fn ascii_escape(s: &[u8]) -> String {
    s.iter().flat_map(|&b| ascii::escape_default(b)).map(char::from).collect()
}

/// Like `ascii_escape`, but only the first `limit` bytes, marking the cut.
pub fn ascii_escape_capped(s: &[u8], limit: usize) -> String {
    if s.len() <= limit {
        return ascii_escape(s);
    }

    let mut escaped = ascii_escape(&s[..limit]);
    escaped.push_str(&format!("... ({} more bytes)", s.len() - limit));
    escaped
}

#[test]
fn escapes_control_bytes() {
    assert_eq!(ascii_escape(b"a\r\n\xff"), "a\\r\\n\\xff");
}

#[test]
fn caps_long_input() {
    assert_eq!(ascii_escape_capped(b"abcdef", 3), "abc... (3 more bytes)");
    assert_eq!(ascii_escape_capped(b"abc", 3), "abc");
}
