use std::net::IpAddr;
use std::time::Duration;

use crate::error::PingError;
use crate::icmp::DEFAULT_PAYLOAD_SIZE;

const MAX_PAYLOAD_SIZE: usize = 65500;
const MAX_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddressFamily {
    #[default]
    Any,
    V4,
    V6,
}

impl AddressFamily {
    pub fn accepts(&self, addr: &IpAddr) -> bool {
        match self {
            AddressFamily::Any => true,
            AddressFamily::V4 => addr.is_ipv4(),
            AddressFamily::V6 => addr.is_ipv6(),
        }
    }
}

/// Everything a session needs up front. Build with [`PingConfig::new`] and
/// the `with_*` methods; [`PingConfig::validate`] runs again on `start`.
#[derive(Debug, Clone, PartialEq)]
pub struct PingConfig {
    pub host: String,
    /// Seconds between echo requests
    pub interval: f64,
    /// Seconds to wait for each reply
    pub timeout: f64,
    /// Stop by itself after this many seconds
    pub max_duration: Option<f64>,
    /// Send this many requests, then stop once each is answered or timed out
    pub count: Option<u32>,
    pub payload_size: usize,
    pub ttl: Option<u32>,
    pub family: AddressFamily,
    pub source: Option<IpAddr>,
}

impl PingConfig {
    pub fn new(host: impl Into<String>, interval: f64, timeout: f64) -> Self {
        Self {
            host: host.into(),
            interval,
            timeout,
            max_duration: None,
            count: None,
            payload_size: DEFAULT_PAYLOAD_SIZE,
            ttl: None,
            family: AddressFamily::Any,
            source: None,
        }
    }

    pub fn with_max_duration(mut self, seconds: f64) -> Self {
        self.max_duration = Some(seconds);
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_payload_size(mut self, size: usize) -> Self {
        self.payload_size = size;
        self
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_family(mut self, family: AddressFamily) -> Self {
        self.family = family;
        self
    }

    pub fn with_source(mut self, source: IpAddr) -> Self {
        self.source = Some(source);
        self
    }

    pub fn validate(&self) -> Result<(), PingError> {
        let invalid = |msg: String| Err(PingError::InvalidConfiguration(msg));

        if self.host.trim().is_empty() {
            return invalid("host must not be empty".to_string());
        }

        self.timing()?;

        if self.count == Some(0) {
            return invalid("count must be at least 1".to_string());
        }

        if self.payload_size > MAX_PAYLOAD_SIZE {
            return invalid(format!("payload size must not exceed {} bytes", MAX_PAYLOAD_SIZE));
        }

        if let Some(ttl) = self.ttl {
            if ttl == 0 || ttl > 255 {
                return invalid("TTL must be in the range 1-255".to_string());
            }
        }

        if let Some(source) = self.source {
            if !self.family.accepts(&source) {
                return invalid(format!("source address {} does not match the requested address family", source));
            }
        }

        Ok(())
    }

    /// The interval, timeout and max duration as [`Duration`]s a timer can be
    /// scheduled with. Values that round to zero or exceed a year are rejected.
    pub fn timing(&self) -> Result<Timing, PingError> {
        Ok(Timing {
            interval: period("interval", self.interval)?,
            timeout: period("timeout", self.timeout)?,
            max_duration: self.max_duration.map(|seconds| period("max duration", seconds)).transpose()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_duration: Option<Duration>,
}

fn period(name: &str, seconds: f64) -> Result<Duration, PingError> {
    match Duration::try_from_secs_f64(seconds) {
        Ok(duration) if !duration.is_zero() && duration <= MAX_PERIOD => Ok(duration),
        _ => Err(PingError::InvalidConfiguration(format!(
            "{} must be a positive number of seconds no larger than {}, got {}",
            name,
            MAX_PERIOD.as_secs(),
            seconds
        ))),
    }
}
