use std::time::Duration;

use serde::Serialize;

use crate::error::{GatewayError, Result};

/// Default time a request is held open when the client did not ask for a timeout.
pub const DEFAULT_LONG_POLLING_TIMEOUT_MS: u64 = 10_000;
/// Default period of the per-type probe that retries blocked requests.
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 10_000;
/// Default number of back-to-back empty rounds after which new requests block without polling.
pub const DEFAULT_MIN_EMPTY_RESPONSES: u32 = 3;
/// Default upper bound for a single response batch, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Long polling behaviour of the activation scheduler.
///
/// When long polling is disabled every request behaves as if the client had sent a negative
/// request timeout: it sweeps all partitions once and completes, never blocking.
#[derive(Debug, Clone, Serialize)]
pub struct LongPollingConfig {
    pub enabled: bool,
    /// Used for requests whose timeout is zero or unset.
    pub timeout_ms: u64,
    /// Period of the probe timer that retries blocked requests if a notification was lost.
    pub probe_timeout_ms: u64,
    /// Consecutive empty rounds after which a job type is considered empty.
    pub min_empty_responses: u32,
}

impl Default for LongPollingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: DEFAULT_LONG_POLLING_TIMEOUT_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            min_empty_responses: DEFAULT_MIN_EMPTY_RESPONSES,
        }
    }
}

impl LongPollingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayConfig {
    pub long_polling: LongPollingConfig,
    /// Batches larger than this are truncated; the remainder is released back to the broker.
    pub max_message_size: usize,
    /// Capacity of the scheduler's inbound message queue.
    pub channel_capacity: usize,
    /// Capacity of each client's response stream.
    pub response_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            long_polling: LongPollingConfig::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            channel_capacity: 256,
            response_buffer: 32,
        }
    }
}

impl GatewayConfig {
    pub fn with_long_polling_timeout(mut self, timeout_ms: u64) -> Self {
        self.long_polling.timeout_ms = timeout_ms;
        self
    }

    pub fn with_probe_timeout(mut self, probe_timeout_ms: u64) -> Self {
        self.long_polling.probe_timeout_ms = probe_timeout_ms;
        self
    }

    pub fn with_min_empty_responses(mut self, min_empty_responses: u32) -> Self {
        self.long_polling.min_empty_responses = min_empty_responses;
        self
    }

    pub fn with_long_polling_enabled(mut self, enabled: bool) -> Self {
        self.long_polling.enabled = enabled;
        self
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.long_polling.enabled && self.long_polling.timeout_ms == 0 {
            return Err(GatewayError::InvalidArgument(
                "long polling timeout must be greater than zero".to_string(),
            ));
        }
        if self.long_polling.probe_timeout_ms == 0 {
            return Err(GatewayError::InvalidArgument(
                "probe timeout must be greater than zero".to_string(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(GatewayError::InvalidArgument(
                "max message size must be greater than zero".to_string(),
            ));
        }
        if self.channel_capacity == 0 || self.response_buffer == 0 {
            return Err(GatewayError::InvalidArgument(
                "channel capacities must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
