//! Messaging configuration
//!
//! Broker connection settings plus the retention, redelivery and fan-out
//! policies applied when streams, consumers and bus listeners are created.

use crate::error::{MessagingError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retention policy applied to every provisioned stream
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StreamPolicy {
    /// Maximum age of a stored message
    pub max_age: Duration,

    /// Window within which a repeated dedup key is discarded by the broker
    pub duplicate_window: Duration,
}

impl Default for StreamPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(86400 * 7), // 7 days
            duplicate_window: Duration::from_secs(120),
        }
    }
}

/// Acknowledgement policy applied to every provisioned consumer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConsumerPolicy {
    /// Time the broker waits for an ack before redelivering
    pub ack_wait: Duration,

    /// Deliveries after which a message is considered poison
    pub max_deliver: i64,
}

impl Default for ConsumerPolicy {
    fn default() -> Self {
        Self {
            ack_wait: Duration::from_secs(30),
            max_deliver: 10,
        }
    }
}

/// In-process fan-out bus policy
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BusConfig {
    /// Per-listener channel capacity
    pub listener_capacity: usize,

    /// How long a dispatch waits on one listener before evicting it.
    /// `None` blocks until the listener drains.
    pub send_timeout: Option<Duration>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            listener_capacity: 16,
            send_timeout: Some(Duration::from_secs(5)),
        }
    }
}

impl BusConfig {
    /// Unbounded wait on every listener, in registration order.
    pub fn blocking() -> Self {
        Self {
            listener_capacity: 1,
            send_timeout: None,
        }
    }
}

/// NATS messaging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NatsConfig {
    /// NATS server URL (e.g., "nats://localhost:4222")
    pub url: String,

    /// Connection name reported to the server
    pub client_name: Option<String>,

    /// Default deadline for request/reply calls
    pub request_timeout: Duration,

    /// Stream retention
    pub stream: StreamPolicy,

    /// Consumer redelivery
    pub consumer: ConsumerPolicy,

    /// Fan-out bus
    pub bus: BusConfig,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            client_name: None,
            request_timeout: Duration::from_secs(5),
            stream: StreamPolicy::default(),
            consumer: ConsumerPolicy::default(),
            bus: BusConfig::default(),
        }
    }
}

impl NatsConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(MessagingError::Config("URL cannot be empty".to_string()));
        }

        if self.request_timeout.is_zero() {
            return Err(MessagingError::Config(
                "Request timeout must be greater than zero".to_string(),
            ));
        }

        if self.consumer.max_deliver < 1 {
            return Err(MessagingError::Config(
                "Max deliver must be at least 1".to_string(),
            ));
        }

        if self.bus.listener_capacity == 0 {
            return Err(MessagingError::Config(
                "Listener capacity must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Create configuration from environment variables
    ///
    /// # Environment Variables
    /// - `NATS_URL`: NATS server URL
    /// - `NATS_CLIENT_NAME`: connection name (optional)
    /// - `NATS_REQUEST_TIMEOUT_MS`: request/reply deadline
    /// - `NATS_STREAM_MAX_AGE_SECS`: stream retention
    /// - `NATS_DUPLICATE_WINDOW_SECS`: dedup window
    /// - `NATS_ACK_WAIT_SECS`: consumer ack wait
    /// - `NATS_MAX_DELIVER`: consumer max deliveries
    /// - `BUS_LISTENER_CAPACITY`: per-listener buffer
    /// - `BUS_SEND_TIMEOUT_MS`: slow listener eviction timeout, `0` to block
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let send_timeout = match env_parse::<u64>("BUS_SEND_TIMEOUT_MS") {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => defaults.bus.send_timeout,
        };

        let config = Self {
            url: std::env::var("NATS_URL").unwrap_or(defaults.url),
            client_name: std::env::var("NATS_CLIENT_NAME").ok(),
            request_timeout: env_parse("NATS_REQUEST_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
            stream: StreamPolicy {
                max_age: env_parse("NATS_STREAM_MAX_AGE_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.stream.max_age),
                duplicate_window: env_parse("NATS_DUPLICATE_WINDOW_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.stream.duplicate_window),
            },
            consumer: ConsumerPolicy {
                ack_wait: env_parse("NATS_ACK_WAIT_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.consumer.ack_wait),
                max_deliver: env_parse("NATS_MAX_DELIVER")
                    .unwrap_or(defaults.consumer.max_deliver),
            },
            bus: BusConfig {
                listener_capacity: env_parse("BUS_LISTENER_CAPACITY")
                    .unwrap_or(defaults.bus.listener_capacity),
                send_timeout,
            },
        };

        config.validate()?;
        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
