//! HTTP endpoint checks for the agent's management and web ports.

use std::time::{Duration, Instant};

use reqwest::Client;
use tracing::{debug, warn};

use crate::error::{ConvergeError, Result};

/// Connection timeout in seconds.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Result of a single endpoint check.
#[derive(Debug, Clone)]
pub struct EndpointCheck {
    /// Endpoint URL.
    pub url: String,
    /// Whether the endpoint answered with a success status.
    pub healthy: bool,
    /// HTTP status code, if a response arrived.
    pub status_code: Option<u16>,
    /// Response time in milliseconds.
    pub response_time_ms: Option<u64>,
    /// Error message, if unhealthy.
    pub error: Option<String>,
}

/// Checks HTTP endpoints.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    /// HTTP client.
    client: Client,
}

impl HealthChecker {
    /// Creates a health checker whose requests time out after `timeout_secs`.
    ///
    /// Certificates are not verified: agents ship self-signed management
    /// certificates and only reachability is judged.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS.min(timeout_secs)))
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| ConvergeError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client })
    }

    /// Checks a single HTTP endpoint.
    pub async fn check_endpoint(&self, url: &str) -> EndpointCheck {
        let start = Instant::now();

        match self.client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                let response_time = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
                let healthy = status.is_success();

                if !healthy {
                    debug!("Endpoint {url} returned status {status}");
                }

                EndpointCheck {
                    url: url.to_string(),
                    healthy,
                    status_code: Some(status.as_u16()),
                    response_time_ms: Some(response_time),
                    error: if healthy {
                        None
                    } else {
                        Some(format!("HTTP {status}"))
                    },
                }
            }
            Err(e) => {
                warn!("Endpoint check failed for {url}: {e}");

                EndpointCheck {
                    url: url.to_string(),
                    healthy: false,
                    status_code: None,
                    response_time_ms: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

impl std::fmt::Display for EndpointCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.healthy { "healthy" } else { "unhealthy" };
        write!(f, "{}: {status}", self.url)?;

        if let Some(error) = &self.error {
            write!(f, " - {error}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_healthy_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/services/server/info"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let checker = HealthChecker::new(5).expect("client");
        let check = checker
            .check_endpoint(&format!("{}/services/server/info", server.uri()))
            .await;

        assert!(check.healthy);
        assert_eq!(check.status_code, Some(200));
        assert!(check.error.is_none());
    }

    #[tokio::test]
    async fn test_error_status_is_unhealthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let checker = HealthChecker::new(5).expect("client");
        let check = checker.check_endpoint(&server.uri()).await;

        assert!(!check.healthy);
        assert_eq!(check.status_code, Some(503));
        assert!(check.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let checker = HealthChecker::new(2).expect("client");
        let check = checker.check_endpoint(&format!("http://127.0.0.1:{port}/")).await;

        assert!(!check.healthy);
        assert!(check.status_code.is_none());
        assert!(check.error.is_some());
    }
}
