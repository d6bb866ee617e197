//! Health probing for supervised engines.
//!
//! An engine with a health URL is probed over HTTP; one without falls back
//! to a bare TCP connect on its port. Probes are issued only by the
//! supervisor's background loop, never by status queries.

use crate::config::SupervisorConfig;
use crate::manifest::HealthCheck;
use crate::registry::EngineConfig;
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone)]
pub struct HealthProbe {
    pub url: Option<String>,
    pub port: u16,
    pub expect_status: u16,
    pub expect_substring: Option<String>,
    pub timeout: Duration,
}

impl HealthProbe {
    /// Probe built from registry config alone: HTTP against the stored
    /// health URL, expecting a 2xx.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            url: config.health_url.clone(),
            port: config.port,
            expect_status: 200,
            expect_substring: None,
            timeout: SupervisorConfig::HEALTH_PROBE_TIMEOUT,
        }
    }

    /// Probe enriched with the manifest's health-check descriptor.
    pub fn from_check(check: &HealthCheck, port: u16) -> Self {
        Self {
            url: Some(check.url(port)),
            port,
            expect_status: check.expect_status,
            expect_substring: check.expect_substring.clone(),
            timeout: SupervisorConfig::HEALTH_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// One probe attempt. Failures are expected during startup and are not
    /// errors.
    pub async fn probe(&self, client: &reqwest::Client) -> bool {
        match &self.url {
            Some(url) => self.probe_http(client, url).await,
            None => self.probe_tcp().await,
        }
    }

    async fn probe_http(&self, client: &reqwest::Client, url: &str) -> bool {
        let response = match client.get(url).timeout(self.timeout).send().await {
            Ok(r) => r,
            Err(e) => {
                trace!("Health probe {} failed: {}", url, e);
                return false;
            }
        };

        if response.status().as_u16() != self.expect_status {
            trace!(
                "Health probe {} returned {} (wanted {})",
                url,
                response.status(),
                self.expect_status
            );
            return false;
        }

        match &self.expect_substring {
            None => true,
            Some(needle) => match response.text().await {
                Ok(body) => body.contains(needle),
                Err(_) => false,
            },
        }
    }

    async fn probe_tcp(&self) -> bool {
        let addr = format!("127.0.0.1:{}", self.port);
        matches!(
            tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(&addr)).await,
            Ok(Ok(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn probe_for(url: Option<String>, port: u16) -> HealthProbe {
        HealthProbe {
            url,
            port,
            expect_status: 200,
            expect_substring: None,
            timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_tcp_probe_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = probe_for(None, port);
        assert!(probe.probe(&reqwest::Client::new()).await);
    }

    #[tokio::test]
    async fn test_tcp_probe_closed_port() {
        // Bind then drop to get a port that is very likely closed
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = probe_for(None, port);
        assert!(!probe.probe(&reqwest::Client::new()).await);
    }

    #[tokio::test]
    async fn test_http_probe_status_and_substring() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            // Serve two requests with a fixed healthy response
            for _ in 0..2 {
                if let Ok((mut stream, _)) = listener.accept().await {
                    let body = "{\"status\":\"ok\"}";
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                }
            }
        });

        let client = reqwest::Client::new();

        let mut probe = probe_for(Some(format!("http://127.0.0.1:{}/health", port)), port);
        probe.expect_substring = Some("\"status\":\"ok\"".into());
        assert!(probe.probe(&client).await);

        let mut probe = probe_for(Some(format!("http://127.0.0.1:{}/health", port)), port);
        probe.expect_substring = Some("nope".into());
        assert!(!probe.probe(&client).await);
    }

    #[tokio::test]
    async fn test_http_probe_unexpected_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let _ = stream
                    .write_all(b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
            }
        });

        let probe = probe_for(Some(format!("http://127.0.0.1:{}/health", port)), port);
        assert!(!probe.probe(&reqwest::Client::new()).await);
    }
}
