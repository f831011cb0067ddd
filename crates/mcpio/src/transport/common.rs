//! Pieces shared by the HTTP-based transports.

use std::sync::Arc;

pub mod http_header;
pub mod sse;

/// Opaque session identifier carried in the `Mcp-Session-Id` header.
pub type SessionId = Arc<str>;

pub fn session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string().into()
}

/// Whether an `Accept` header admits the given mime type, honoring `*/*`
/// and `type/*` wildcards.
pub fn accept_contains(accept: &str, mime_type: &str) -> bool {
    let (wanted_type, wanted_subtype) = match mime_type.split_once('/') {
        Some(parts) => parts,
        None => return false,
    };
    accept.split(',').any(|entry| {
        let entry = entry.trim();
        let entry = entry.split(';').next().unwrap_or(entry).trim();
        match entry.split_once('/') {
            Some(("*", "*")) => true,
            Some((t, "*")) => t.eq_ignore_ascii_case(wanted_type),
            Some((t, s)) => {
                t.eq_ignore_ascii_case(wanted_type) && s.eq_ignore_ascii_case(wanted_subtype)
            }
            None => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::common::http_header::{EVENT_STREAM_MIME_TYPE, JSON_MIME_TYPE};

    #[test]
    fn accept_header_matching() {
        assert!(accept_contains(
            "application/json, text/event-stream",
            JSON_MIME_TYPE
        ));
        assert!(accept_contains("*/*", EVENT_STREAM_MIME_TYPE));
        assert!(accept_contains("text/*;q=0.9", EVENT_STREAM_MIME_TYPE));
        assert!(!accept_contains("application/json", EVENT_STREAM_MIME_TYPE));
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(session_id(), session_id());
    }
}
