//! Upstream target discovery.
//!
//! The discovery service answers a region name with a plain-text body of two
//! newline-separated tokens: the origin endpoint and the join code.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tracing::debug;

use crate::config::DiscoveryConfig;
use crate::error::RelayError;

/// One game instance to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// `host[:port]` of the upstream server
    pub origin_endpoint: String,
    pub join_code: String,
}

impl Target {
    /// Parses a discovery response body.
    ///
    /// Surrounding whitespace on each line is ignored, so `\r\n` line endings
    /// and a trailing newline are accepted. Lines past the second are
    /// ignored.
    pub fn parse(body: &str) -> Result<Self, RelayError> {
        let mut lines = body.lines().map(str::trim);

        let origin_endpoint = match lines.next() {
            Some(endpoint) if !endpoint.is_empty() => endpoint.to_string(),
            _ => return Err(RelayError::Discovery("response has no origin endpoint".to_string())),
        };
        let join_code = match lines.next() {
            Some(code) if !code.is_empty() => code.to_string(),
            _ => return Err(RelayError::Discovery("response has no join code".to_string())),
        };

        Ok(Self {
            origin_endpoint,
            join_code,
        })
    }
}

/// Source of upstream targets.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn discover(&self) -> Result<Target, RelayError>;
}

/// Discovery over HTTP: POSTs the region name and parses the reply.
#[derive(Debug, Clone)]
pub struct HttpDiscovery {
    client: Client,
    config: DiscoveryConfig,
}

impl HttpDiscovery {
    pub fn new(config: DiscoveryConfig) -> Result<Self, RelayError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RelayError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl Discovery for HttpDiscovery {
    async fn discover(&self) -> Result<Target, RelayError> {
        debug!("Requesting target for region {} from {}", self.config.region, self.config.url);

        let body = self
            .client
            .post(&self.config.url)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(self.config.region.clone())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| RelayError::Discovery(e.to_string()))?
            .text()
            .await
            .map_err(|e| RelayError::Discovery(e.to_string()))?;

        Target::parse(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        let target = Target::parse("10.0.0.5:443\nABCDEF").unwrap();
        assert_eq!(target.origin_endpoint, "10.0.0.5:443");
        assert_eq!(target.join_code, "ABCDEF");
    }

    #[test]
    fn test_parse_tolerates_crlf() {
        let target = Target::parse("host:1500\r\ncode\r\n").unwrap();
        assert_eq!(target.origin_endpoint, "host:1500");
        assert_eq!(target.join_code, "code");
    }

    #[test]
    fn test_parse_rejects_incomplete_body() {
        assert!(matches!(Target::parse(""), Err(RelayError::Discovery(_))));
        assert!(matches!(Target::parse("host:1500"), Err(RelayError::Discovery(_))));
        assert!(matches!(Target::parse("host:1500\n\n"), Err(RelayError::Discovery(_))));
    }
}
