use crate::error::ShardingError;
use crate::types::PodAddress;
use std::time::Duration;

/// Configuration for the per-pod sharding runtime.
#[derive(Debug, Clone)]
pub struct ShardingConfig {
    /// Divisor of the shard function. Both ends of a deployment must agree. Default: 300.
    pub number_of_shards: u32,
    /// Host this pod advertises to the Shard Manager and other pods.
    pub self_host: String,
    /// Port this pod advertises for sharding traffic.
    pub sharding_port: u16,
    /// Default per-send timeout. `None` disables the timeout. Default: 10s.
    pub send_timeout: Option<Duration>,
    /// Max idle time before an entity is expired. Default: 60s.
    pub entity_max_idle_time: Duration,
    /// Bound on waiting for graceful entity termination. Default: 3s.
    pub entity_termination_timeout: Duration,
    /// Backoff before restarting the assignment refresh pipeline. Default: 5s.
    pub refresh_assignments_retry_interval: Duration,
    /// Debounce interval for unhealthy-pod reports to the Shard Manager. Default: 5s.
    pub unhealthy_pod_report_interval: Duration,
    /// If true, self-targeted sends go through the serialize + transport loop
    /// instead of the local shortcut. Default: false.
    pub simulate_remote_pods: bool,
    /// Backoff while a shard is unassigned or an entity is terminating. Default: 100ms.
    pub send_retry_interval: Duration,
    /// Backoff after a transient routing error (stale table, unavailable pod). Default: 200ms.
    pub stale_routing_retry_interval: Duration,
}

impl ShardingConfig {
    /// The address this pod identifies itself with.
    pub fn self_address(&self) -> PodAddress {
        PodAddress::new(self.self_host.clone(), self.sharding_port)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ShardingError> {
        if self.number_of_shards < 1 {
            return Err(ShardingError::InvalidConfig {
                reason: "number_of_shards must be >= 1".to_string(),
            });
        }
        if self.self_host.is_empty() {
            return Err(ShardingError::InvalidConfig {
                reason: "self_host must not be empty".to_string(),
            });
        }
        if self.entity_max_idle_time.is_zero() {
            return Err(ShardingError::InvalidConfig {
                reason: "entity_max_idle_time must be > 0".to_string(),
            });
        }
        if self.entity_termination_timeout.is_zero() {
            return Err(ShardingError::InvalidConfig {
                reason: "entity_termination_timeout must be > 0".to_string(),
            });
        }
        if self.refresh_assignments_retry_interval.is_zero() {
            return Err(ShardingError::InvalidConfig {
                reason: "refresh_assignments_retry_interval must be > 0".to_string(),
            });
        }
        if self.unhealthy_pod_report_interval.is_zero() {
            return Err(ShardingError::InvalidConfig {
                reason: "unhealthy_pod_report_interval must be > 0".to_string(),
            });
        }
        if self.send_retry_interval.is_zero() {
            return Err(ShardingError::InvalidConfig {
                reason: "send_retry_interval must be > 0".to_string(),
            });
        }
        if self.stale_routing_retry_interval.is_zero() {
            return Err(ShardingError::InvalidConfig {
                reason: "stale_routing_retry_interval must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            number_of_shards: 300,
            self_host: "localhost".to_string(),
            sharding_port: 54321,
            send_timeout: Some(Duration::from_secs(10)),
            entity_max_idle_time: Duration::from_secs(60),
            entity_termination_timeout: Duration::from_secs(3),
            refresh_assignments_retry_interval: Duration::from_secs(5),
            unhealthy_pod_report_interval: Duration::from_secs(5),
            simulate_remote_pods: false,
            send_retry_interval: Duration::from_millis(100),
            stale_routing_retry_interval: Duration::from_millis(200),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = ShardingConfig::default();
        assert_eq!(config.number_of_shards, 300);
        assert_eq!(config.send_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.entity_max_idle_time, Duration::from_secs(60));
        assert_eq!(config.entity_termination_timeout, Duration::from_secs(3));
        assert!(!config.simulate_remote_pods);
    }

    #[test]
    fn default_config_is_valid() {
        ShardingConfig::default().validate().unwrap();
    }

    #[test]
    fn self_address_from_parts() {
        let config = ShardingConfig {
            self_host: "10.1.2.3".into(),
            sharding_port: 9000,
            ..Default::default()
        };
        assert_eq!(config.self_address(), PodAddress::new("10.1.2.3", 9000));
    }

    #[test]
    fn validate_zero_shards() {
        let config = ShardingConfig {
            number_of_shards: 0,
            ..Default::default()
        };
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("number_of_shards"), "got: {msg}");
    }

    #[test]
    fn validate_zero_duration() {
        let config = ShardingConfig {
            entity_max_idle_time: Duration::ZERO,
            ..Default::default()
        };
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("entity_max_idle_time"), "got: {msg}");
    }

    #[test]
    fn validate_no_send_timeout_is_valid() {
        let config = ShardingConfig {
            send_timeout: None,
            ..Default::default()
        };
        config.validate().unwrap();
    }
}
