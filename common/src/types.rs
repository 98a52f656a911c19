use std::{fmt, net::Ipv4Addr};

use serde::Serialize;

/// Latest environmental sample. `valid` stays false until the first
/// successful read; consumers must not treat an invalid reading as zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub temperature: f32,
    pub humidity: f32,
    pub sampled_at_ms: u64,
    pub valid: bool,
}

impl Reading {
    pub const UNSET: Self = Self {
        temperature: 0.0,
        humidity: 0.0,
        sampled_at_ms: 0,
        valid: false,
    };

    pub fn new(temperature: f32, humidity: f32, sampled_at_ms: u64) -> Self {
        Self {
            temperature,
            humidity,
            sampled_at_ms,
            valid: true,
        }
    }

    pub fn age_ms(&self, now_ms: u64) -> Option<u64> {
        self.valid
            .then(|| now_ms.saturating_sub(self.sampled_at_ms))
    }

    pub fn is_stale(&self, now_ms: u64, stale_after_ms: u64) -> bool {
        match self.age_ms(now_ms) {
            Some(age) => age > stale_after_ms,
            None => true,
        }
    }
}

impl Default for Reading {
    fn default() -> Self {
        Self::UNSET
    }
}

/// IPv4 address assigned to the station interface, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkAddress {
    pub octets: [u8; 4],
    pub present: bool,
}

impl LinkAddress {
    pub const NONE: Self = Self {
        octets: [0; 4],
        present: false,
    };

    pub fn new(octets: [u8; 4]) -> Self {
        Self {
            octets,
            present: true,
        }
    }

    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.present.then(|| Ipv4Addr::from(self.octets))
    }
}

impl From<Ipv4Addr> for LinkAddress {
    fn from(addr: Ipv4Addr) -> Self {
        Self::new(addr.octets())
    }
}

impl fmt::Display for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip() {
            Some(ip) => write!(f, "{ip}"),
            None => f.write_str("unassigned"),
        }
    }
}

/// Output level requested for the LED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedCommand {
    On,
    Off,
}

impl LedCommand {
    pub fn level(self) -> bool {
        matches!(self, Self::On)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

/// Body of `GET /data`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DataPayload {
    pub temperature: f32,
    pub humidity: f32,
    pub valid: bool,
}

impl From<Reading> for DataPayload {
    fn from(reading: Reading) -> Self {
        Self {
            temperature: reading.temperature,
            humidity: reading.humidity,
            valid: reading.valid,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueCounters {
    pub submitted: u64,
    pub completed: u64,
    pub rejected: u64,
}

/// Body of `GET /api/status`.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub connectivity: &'static str,
    pub address: Option<String>,
    #[serde(rename = "readingValid")]
    pub reading_valid: bool,
    #[serde(rename = "readingAgeMs")]
    pub reading_age_ms: Option<u64>,
    #[serde(rename = "readingStale")]
    pub reading_stale: bool,
    #[serde(rename = "samplesOk")]
    pub samples_ok: u64,
    #[serde(rename = "samplesFailed")]
    pub samples_failed: u64,
    #[serde(rename = "ledOn")]
    pub led_on: bool,
    pub deferred: QueueCounters,
}
