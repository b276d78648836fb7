//! Identifier segments of request paths.
//!
//! Room names, room ids and matchmaking methods are runs of
//! `[A-Za-z0-9_-]`; every other character separates segments.

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// All identifier runs in `path`, in order.
pub fn identifier_segments(path: &str) -> Vec<&str> {
    path.split(|c: char| !is_identifier_char(c))
        .filter(|segment| !segment.is_empty())
        .collect()
}

/// The last identifier run in `path`. Preceding segments are ignored.
pub fn trailing_identifier(path: &str) -> Option<&str> {
    path.rsplit(|c: char| !is_identifier_char(c))
        .find(|segment| !segment.is_empty())
}
