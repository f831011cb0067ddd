//! Bearer-token verification hook for the HTTP server transports.

use std::time::SystemTime;

use async_trait::async_trait;

/// A verified token's claims, as far as the transport cares.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub subject: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<SystemTime>,
}

impl AccessToken {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => at <= SystemTime::now(),
            None => false,
        }
    }
}

/// Validates the bearer token of incoming HTTP requests. Plug an
/// implementation into the streamable HTTP server to require authorization;
/// without one, all requests are accepted.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// `None` means the token is rejected and the request gets a 401.
    async fn verify(&self, token: &str) -> Option<AccessToken>;
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let rest = header_value.strip_prefix("Bearer ")?;
    let rest = rest.trim();
    if rest.is_empty() { None } else { Some(rest) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_extraction() {
        assert_eq!(bearer_token("Bearer abc123"), Some("abc123"));
        assert_eq!(bearer_token("Basic abc123"), None);
        assert_eq!(bearer_token("Bearer "), None);
    }
}
