//! JSON wire shapes for the control plane (`/register`, `/unregister`) and
//! the probe protocol (`GET {backend}/probe`). See SPEC_FULL §3.

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Body of `POST /register` and `POST /unregister`, and of a backend's
/// periodic heartbeat.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegisterRequest {
    pub url: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_true")]
    pub health: bool,
    #[serde(default)]
    pub in_flight_requests: Option<f64>,
    #[serde(default)]
    pub rif_avg_latency: Option<f64>,
    #[serde(default)]
    pub overall_avg_latency: Option<f64>,
}

/// A `Backend` rendered as JSON for `/register` and `/unregister` responses.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendView {
    pub url: String,
    pub port: Option<u16>,
    pub healthy: bool,
    pub in_flight_requests: f64,
    pub rif_avg_latency: f64,
    pub overall_avg_latency: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterResponse {
    pub status: &'static str,
    pub backend: BackendView,
}

/// Response body a backend's `/probe` endpoint returns.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeResponse {
    pub status: String,
    pub in_flight_requests: f64,
    pub rif_avg_latency: f64,
    pub overall_avg_latency: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_request_defaults_missing_fields() {
        let parsed: RegisterRequest = serde_json::from_str(r#"{"url":"http://a"}"#).unwrap();
        assert_eq!(parsed.url, "http://a");
        assert!(parsed.health);
        assert_eq!(parsed.port, None);
        assert_eq!(parsed.in_flight_requests, None);
    }

    #[test]
    fn probe_response_round_trips() {
        let original = ProbeResponse {
            status: "ok".to_string(),
            in_flight_requests: 2.0,
            rif_avg_latency: 0.01,
            overall_avg_latency: 0.02,
        };
        let json = serde_json::to_string(&original).unwrap();
        let parsed: ProbeResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.in_flight_requests, 2.0);
    }
}
