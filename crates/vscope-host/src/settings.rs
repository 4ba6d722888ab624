//! Host settings.
//!
//! Supplied by the embedding application (settings persistence itself is a
//! collaborator, not this crate's concern).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::TransportError;

/// Polling and retry configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// State-poll cadence: state, timing, trigger, channel map.
    pub state_polling_hz: f64,
    /// Frame-poll cadence: live sample frames while running.
    pub frame_polling_hz: f64,
    /// Per-transaction deadline in milliseconds.
    pub frame_timeout_ms: u64,
    /// Retries after a CRC-failed response.
    pub crc_retry_attempts: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            state_polling_hz: 20.0,
            frame_polling_hz: 10.0,
            frame_timeout_ms: 100,
            crc_retry_attempts: 3,
        }
    }
}

impl Settings {
    /// Interval between state polls.
    pub fn state_poll_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.state_polling_hz)
    }

    /// Interval between frame polls.
    pub fn frame_poll_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_polling_hz)
    }

    /// Per-transaction deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    /// Age beyond which a polled value counts as stale: three missed state
    /// polls.
    pub fn staleness_bound(&self) -> Duration {
        self.state_poll_period() * 3
    }

    /// Validate ranges before use.
    pub fn validate(&self) -> Result<(), TransportError> {
        if !(self.state_polling_hz.is_finite() && self.state_polling_hz > 0.0) {
            return Err(TransportError::InvalidConfig {
                message: format!("statePollingHz must be positive, got {}", self.state_polling_hz),
            });
        }
        if !(self.frame_polling_hz.is_finite() && self.frame_polling_hz > 0.0) {
            return Err(TransportError::InvalidConfig {
                message: format!("framePollingHz must be positive, got {}", self.frame_polling_hz),
            });
        }
        if self.frame_timeout_ms == 0 {
            return Err(TransportError::InvalidConfig {
                message: "frameTimeoutMs must be nonzero".to_string(),
            });
        }
        Ok(())
    }
}
