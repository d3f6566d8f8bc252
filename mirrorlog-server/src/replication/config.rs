use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HaConfig {
    /// Address the master side listens on for slave connections.
    pub listen_addr: SocketAddr,

    /// Master `host:port` the slave side connects to. Unset leaves the
    /// client idle until an address is provided.
    pub master_address: Option<String>,

    /// Max quiet time before the slave sends an offset heartbeat (ms).
    pub heartbeat_interval_ms: u64,

    /// Max quiet time before either side declares its peer dead (ms).
    pub housekeeping_interval_ms: u64,

    /// Allowed bytes the master may be ahead of the slave watermark before
    /// the slave is reported unhealthy.
    pub slave_fallbehind_max: u64,

    /// Upper bound of a producer's replication wait (ms).
    pub sync_flush_timeout_ms: u64,

    /// Delay before the slave retries a failed master connection (ms).
    pub reconnect_delay_ms: u64,

    /// Max bytes pushed to a slave in one frame.
    pub transfer_batch_bytes: usize,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:10912".parse().expect("static listen address"),
            master_address: None,
            heartbeat_interval_ms: 5000,
            housekeeping_interval_ms: 20_000,
            slave_fallbehind_max: 256 * 1024 * 1024,
            sync_flush_timeout_ms: 5000,
            reconnect_delay_ms: 5000,
            transfer_batch_bytes: 32 * 1024,
        }
    }
}

impl HaConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval_ms == 0 {
            return Err("heartbeat_interval_ms must be positive".to_string());
        }
        if self.housekeeping_interval_ms == 0 {
            return Err("housekeeping_interval_ms must be positive".to_string());
        }
        if self.transfer_batch_bytes == 0 {
            return Err("transfer_batch_bytes must be positive".to_string());
        }
        if let Some(addr) = &self.master_address {
            if addr.parse::<SocketAddr>().is_err() {
                return Err(format!("master_address is not host:port: {addr}"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HaConfig::default();
        assert_eq!(config.listen_addr.port(), 10912);
        assert!(config.master_address.is_none());
        assert_eq!(config.heartbeat_interval_ms, 5000);
        assert_eq!(config.sync_flush_timeout_ms, 5000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let mut config = HaConfig::default();
        config.heartbeat_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = HaConfig::default();
        config.transfer_batch_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_master_address_validation() {
        let mut config = HaConfig::default();
        config.master_address = Some("127.0.0.1:10912".to_string());
        assert!(config.validate().is_ok());

        config.master_address = Some("not-an-address".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let yaml = r#"
listen_addr: "0.0.0.0:10912"
master_address: "10.0.0.1:10912"
heartbeat_interval_ms: 2000
"#;
        let config: HaConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.heartbeat_interval_ms, 2000);
        assert_eq!(config.master_address.as_deref(), Some("10.0.0.1:10912"));
        // Unspecified fields keep their defaults.
        assert_eq!(config.housekeeping_interval_ms, 20_000);
    }
}
