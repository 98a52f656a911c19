use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub sample_period_ms: u64,
    pub sensor_timeout_ms: u64,
    pub stale_after_ms: u64,
    pub max_body_bytes: usize,
    pub deferred_capacity: usize,
    pub deferred_workers: usize,
    pub deferred_timeout_ms: u64,
    /// Serve `0.0/0.0` with `valid: false` from `/data` before the first
    /// sample instead of answering 503.
    pub serve_unready_reading: bool,
    pub http_port: u16,
    pub led_pin: i32,
    pub dht_pin: i32,
    pub network: NetworkConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            sample_period_ms: 2_000,
            sensor_timeout_ms: 500,
            stale_after_ms: 10_000,
            max_body_bytes: 100,
            deferred_capacity: 4,
            deferred_workers: 1,
            deferred_timeout_ms: 2_000,
            serve_unready_reading: true,
            http_port: 80,
            led_pin: 2,
            dht_pin: 4,
            network: NetworkConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn sanitize(&mut self) {
        self.sample_period_ms = self.sample_period_ms.clamp(500, 3_600_000);
        self.sensor_timeout_ms = self.sensor_timeout_ms.clamp(10, self.sample_period_ms);
        self.stale_after_ms = self.stale_after_ms.max(self.sample_period_ms);
        self.max_body_bytes = self.max_body_bytes.clamp(16, 4_096);
        self.deferred_capacity = self.deferred_capacity.clamp(1, 64);
        self.deferred_workers = self.deferred_workers.clamp(1, 8);
        self.deferred_timeout_ms = self.deferred_timeout_ms.clamp(100, 60_000);

        if self.http_port == 0 {
            self.http_port = 80;
        }
        if self.led_pin < 0 {
            self.led_pin = 2;
        }
        if self.dht_pin < 0 {
            self.dht_pin = 4;
        }
    }

    pub fn sample_period(&self) -> Duration {
        Duration::from_millis(self.sample_period_ms)
    }

    pub fn sensor_timeout(&self) -> Duration {
        Duration::from_millis(self.sensor_timeout_ms)
    }

    pub fn deferred_timeout(&self) -> Duration {
        Duration::from_millis(self.deferred_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
}

impl NetworkConfig {
    pub fn has_station_credentials(&self) -> bool {
        let ssid = self.wifi_ssid.trim();
        !ssid.is_empty() && ssid != "CHANGE_ME"
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_match_reference_device() {
        let config = NodeConfig::default();

        assert_eq!(config.sample_period(), Duration::from_secs(2));
        assert_eq!(config.max_body_bytes, 100);
        assert!(config.serve_unready_reading);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"http_port": 8080, "network": {"wifi_ssid": "lab"}}"#)
                .unwrap();

        assert_eq!(config.http_port, 8080);
        assert_eq!(config.sample_period_ms, 2_000);
        assert_eq!(config.network.wifi_ssid, "lab");
        assert!(config.network.has_station_credentials());
    }

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut config = NodeConfig {
            sample_period_ms: 1,
            sensor_timeout_ms: 60_000,
            stale_after_ms: 0,
            max_body_bytes: 0,
            deferred_capacity: 0,
            deferred_workers: 100,
            http_port: 0,
            led_pin: -1,
            ..NodeConfig::default()
        };
        config.sanitize();

        assert_eq!(config.sample_period_ms, 500);
        assert_eq!(config.sensor_timeout_ms, 500);
        assert_eq!(config.stale_after_ms, 500);
        assert_eq!(config.max_body_bytes, 16);
        assert_eq!(config.deferred_capacity, 1);
        assert_eq!(config.deferred_workers, 8);
        assert_eq!(config.http_port, 80);
        assert_eq!(config.led_pin, 2);
    }

    #[test]
    fn placeholder_ssid_is_not_a_credential() {
        let network = NetworkConfig {
            wifi_ssid: "CHANGE_ME".to_string(),
            wifi_pass: String::new(),
        };

        assert!(!network.has_station_credentials());
    }
}
