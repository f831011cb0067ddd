//! Retry policy and stream alias shared by the SSE-consuming clients.

use std::time::Duration;

use futures::stream::BoxStream;
use sse_stream::{Error as SseError, Sse};

pub type BoxedSseResponse = BoxStream<'static, Result<Sse, SseError>>;

/// Reconnect policy for a dropped SSE stream. `None` for `max_times` retries
/// forever; the server-sent `retry` field overrides `min_duration` when
/// larger.
#[derive(Debug, Clone)]
pub struct SseRetryConfig {
    pub max_times: Option<usize>,
    pub min_duration: Duration,
}

impl Default for SseRetryConfig {
    fn default() -> Self {
        Self {
            max_times: Some(16),
            min_duration: Duration::from_millis(1000),
        }
    }
}

impl SseRetryConfig {
    /// Delay before the next attempt, or `None` when retries are exhausted.
    pub fn delay(&self, attempt: usize, server_retry_ms: Option<u64>) -> Option<Duration> {
        if let Some(max) = self.max_times {
            if attempt >= max {
                return None;
            }
        }
        let server = server_retry_ms.map(Duration::from_millis);
        Some(match server {
            Some(server) if server > self.min_duration => server,
            _ => self.min_duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_respects_server_hint_and_limit() {
        let config = SseRetryConfig {
            max_times: Some(2),
            min_duration: Duration::from_millis(100),
        };
        assert_eq!(config.delay(0, None), Some(Duration::from_millis(100)));
        assert_eq!(config.delay(1, Some(500)), Some(Duration::from_millis(500)));
        assert_eq!(config.delay(2, None), None);
    }
}
