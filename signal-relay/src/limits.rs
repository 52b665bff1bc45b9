//! Rate limiting for signal-relay.
//!
//! Inbound frames are metered per [`ConnectionId`] with a governor keyed
//! limiter backed by DashMap. Frame size is capped separately.

use crate::config::LimitsConfig;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use signal_types::ConnectionId;
use std::num::NonZeroU32;
use std::sync::Arc;
use thiserror::Error;

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Per-connection frame limits.
#[derive(Clone)]
pub struct RateLimits {
    /// Frames per connection, configured via `limits.messages_per_minute`.
    message_limiter: Arc<KeyedLimiter<ConnectionId>>,

    /// Largest accepted text frame.
    max_message_bytes: usize,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("message_limiter", &"KeyedLimiter<ConnectionId>")
            .field("max_message_bytes", &self.max_message_bytes)
            .finish()
    }
}

impl RateLimits {
    /// Create rate limiters from configuration.
    ///
    /// A zero `messages_per_minute` is rejected by config validation; should
    /// one get here anyway it is treated as 1.
    pub fn new(config: &LimitsConfig) -> Self {
        let per_minute = NonZeroU32::new(config.messages_per_minute).unwrap_or(NonZeroU32::MIN);

        Self {
            message_limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(per_minute))),
            max_message_bytes: config.max_message_bytes,
        }
    }

    /// Check whether one more frame from `connection_id` is allowed.
    pub fn check_message(&self, connection_id: &ConnectionId) -> Result<(), RateLimitError> {
        self.message_limiter
            .check_key(connection_id)
            .map_err(|_| RateLimitError::MessageLimitExceeded)
    }

    /// Check a frame's size against `limits.max_message_bytes`.
    pub fn check_size(&self, len: usize) -> Result<(), RateLimitError> {
        if len > self.max_message_bytes {
            return Err(RateLimitError::MessageTooLarge {
                len,
                max: self.max_message_bytes,
            });
        }
        Ok(())
    }

    /// Number of tracked connection keys (for metrics).
    pub fn message_keys_count(&self) -> usize {
        self.message_limiter.len()
    }

    /// Evict limiter entries whose cells have fully recharged.
    ///
    /// Closed connections otherwise leave their key behind forever. Called
    /// on every reaper tick.
    pub fn shrink(&self) {
        self.message_limiter.retain_recent();
        self.message_limiter.shrink_to_fit();
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    /// Too many frames from this connection.
    #[error("message rate limit exceeded")]
    MessageLimitExceeded,

    /// Frame larger than the configured maximum.
    #[error("message of {len} bytes exceeds limit of {max}")]
    MessageTooLarge {
        /// Frame length in bytes.
        len: usize,
        /// Configured maximum.
        max: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(messages_per_minute: u32) -> LimitsConfig {
        LimitsConfig {
            max_connections: 100,
            messages_per_minute,
            max_message_bytes: 1024,
        }
    }

    #[test]
    fn message_limit_allows_within_quota() {
        let limits = RateLimits::new(&test_config(5));
        let id = ConnectionId::new();

        for _ in 0..5 {
            assert!(limits.check_message(&id).is_ok());
        }
        assert_eq!(
            limits.check_message(&id),
            Err(RateLimitError::MessageLimitExceeded)
        );
    }

    #[test]
    fn different_connections_have_independent_limits() {
        let limits = RateLimits::new(&test_config(2));
        let a = ConnectionId::new();
        let b = ConnectionId::new();

        assert!(limits.check_message(&a).is_ok());
        assert!(limits.check_message(&a).is_ok());
        assert!(limits.check_message(&a).is_err());

        assert!(limits.check_message(&b).is_ok());
        assert!(limits.check_message(&b).is_ok());
        assert!(limits.check_message(&b).is_err());
        assert_eq!(limits.message_keys_count(), 2);
    }

    #[test]
    fn size_cap() {
        let limits = RateLimits::new(&test_config(5));
        assert!(limits.check_size(1024).is_ok());
        assert_eq!(
            limits.check_size(1025),
            Err(RateLimitError::MessageTooLarge {
                len: 1025,
                max: 1024
            })
        );
    }

    #[test]
    fn zero_quota_falls_back_to_one() {
        let limits = RateLimits::new(&test_config(0));
        let id = ConnectionId::new();
        assert!(limits.check_message(&id).is_ok());
        assert!(limits.check_message(&id).is_err());
    }

    #[test]
    fn shrink_keeps_working_limiter() {
        let limits = RateLimits::new(&test_config(5));
        let id = ConnectionId::new();
        let _ = limits.check_message(&id);

        limits.shrink();
        assert!(limits.check_message(&id).is_ok());
    }

    #[test]
    fn rate_limits_are_debug() {
        let limits = RateLimits::new(&test_config(5));
        assert!(format!("{limits:?}").contains("RateLimits"));
    }
}
