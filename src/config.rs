//! Environment-driven configuration, per the variable table in §6.
//!
//! This is deliberately a flat struct read straight from `std::env` rather
//! than a layered file-based config system; elaborate configuration
//! management is out of scope, not configurability itself.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

fn env_var<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Runtime configuration for both the proxy and backend-agent binaries.
#[derive(Debug, Clone)]
pub struct Config {
    /// Proxy endpoint a backend registers/heartbeats against.
    pub proxy_url: String,
    /// This backend's self-identity, used only by the backend-agent binary.
    pub backend_url: String,
    pub backend_port: u16,
    /// Heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Registry TTL for liveness; defaults to 2x heartbeat interval.
    pub heartbeat_timeout: Duration,
    /// HTTP path a backend serves probe responses on.
    pub probe_path: String,
    /// Probe-rate constant `K` (§4.G).
    pub probe_rate_k: f64,
    /// Fairness floor (§4.G).
    pub min_probe_interval: Duration,
    /// Probe worker pool size (§4.E).
    pub max_concurrent_probes: usize,
    /// Probes or forwards before a backend is marked unhealthy.
    pub consecutive_failure_threshold: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let heartbeat_interval_secs: u64 = env_var("BACKEND_HEARTBEAT_SECONDS", 30)?;
        let heartbeat_timeout_secs: u64 =
            env_var("BACKEND_HEARTBEAT_TIMEOUT", heartbeat_interval_secs * 2)?;

        Ok(Self {
            proxy_url: env_var("PROXY_URL", "http://localhost:8000".to_string())?,
            backend_url: env_var("BACKEND_URL", "http://localhost:9000".to_string())?,
            backend_port: env_var("BACKEND_PORT", 9000u16)?,
            heartbeat_interval: Duration::from_secs(heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(heartbeat_timeout_secs),
            probe_path: env_var("BACKEND_HEALTH_PATH", "/probe".to_string())?,
            probe_rate_k: env_var("PROBE_PROBE_RATE_K", 5.0)?,
            min_probe_interval: Duration::from_secs(env_var("MIN_PROBE_INTERVAL", 20u64)?),
            max_concurrent_probes: env_var("MAX_CONCURRENT_PROBES", 20usize)?,
            consecutive_failure_threshold: env_var("CONSECUTIVE_FAILURE_THRESHOLD", 3u32)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        // Run in isolation from the process environment.
        let cfg = Config {
            proxy_url: "http://localhost:8000".to_string(),
            backend_url: "http://localhost:9000".to_string(),
            backend_port: 9000,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            probe_path: "/probe".to_string(),
            probe_rate_k: 5.0,
            min_probe_interval: Duration::from_secs(20),
            max_concurrent_probes: 20,
            consecutive_failure_threshold: 3,
        };
        assert_eq!(cfg.heartbeat_timeout, cfg.heartbeat_interval * 2);
        assert_eq!(cfg.max_concurrent_probes, 20);
        assert_eq!(cfg.consecutive_failure_threshold, 3);
    }
}
