//! Scheme parameter access
//!
//! Typed lookups over the `[cluster.parameters]` map with the errors
//! `initialize` is expected to fail with.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::config::DEFAULT_GRACE_PERIOD_MS;
use crate::error::{Error, Result};

pub const GRACE_PERIOD_MS: &str = "grace_period_ms";
pub const CONNECT_TIMEOUT_MS: &str = "connect_timeout_ms";
pub const REQUEST_TIMEOUT_MS: &str = "request_timeout_ms";

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;

/// Read-only view over scheme parameters
#[derive(Debug, Clone, Copy)]
pub struct SchemeParameters<'a> {
    values: &'a HashMap<String, String>,
}

impl<'a> SchemeParameters<'a> {
    pub fn new(values: &'a HashMap<String, String>) -> Self {
        Self { values }
    }

    /// A key that must be present and non-blank
    pub fn required(&self, key: &str) -> Result<&'a str> {
        self.optional(key)
            .ok_or_else(|| Error::MissingParameter(key.to_string()))
    }

    /// A key that may be absent; blank values count as absent
    pub fn optional(&self, key: &str) -> Option<&'a str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.optional(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| Error::InvalidParameter {
                key: key.to_string(),
                reason: format!("'{}': {}", raw, e),
            }),
            None => Ok(default),
        }
    }

    /// Millisecond duration; zero is rejected
    pub fn millis_or(&self, key: &str, default_ms: u64) -> Result<Duration> {
        let ms: u64 = self.parse_or(key, default_ms)?;
        if ms == 0 {
            return Err(Error::InvalidParameter {
                key: key.to_string(),
                reason: "must be greater than zero".into(),
            });
        }
        Ok(Duration::from_millis(ms))
    }
}

/// Settings every network-backed scheme understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonSettings {
    pub grace_period: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for CommonSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_millis(DEFAULT_GRACE_PERIOD_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }
}

impl CommonSettings {
    pub fn from_parameters(params: &SchemeParameters<'_>) -> Result<Self> {
        Ok(Self {
            grace_period: params.millis_or(GRACE_PERIOD_MS, DEFAULT_GRACE_PERIOD_MS)?,
            connect_timeout: params.millis_or(CONNECT_TIMEOUT_MS, DEFAULT_CONNECT_TIMEOUT_MS)?,
            request_timeout: params.millis_or(REQUEST_TIMEOUT_MS, DEFAULT_REQUEST_TIMEOUT_MS)?,
        })
    }
}
