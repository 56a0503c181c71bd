//! Cluster-local API gateway
//!
//! The dispatcher talks to each member cluster's local API to create and
//! delete instances. Access goes through the [`ClusterGateway`] trait so the
//! fan-out loop can be exercised without a network; the HTTP implementation
//! authenticates with per-cluster bearer tokens requested on demand.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Bearer token for one cluster-local API
#[derive(Debug, Clone)]
pub struct Token {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

/// Errors from cluster-local API calls
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request to cluster api at {host} failed: {source}")]
    Http {
        host: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("cluster api at {host} returned status {status}")]
    Status { host: String, status: u16 },

    #[error("malformed response from {host}: {reason}")]
    Malformed { host: String, reason: String },
}

/// Operations the dispatcher performs against a member cluster
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Create an instance for the workload spec; returns the instance id
    async fn server_create(
        &self,
        host: &str,
        token: &str,
        spec: &serde_json::Value,
    ) -> Result<String, GatewayError>;

    async fn delete_instance(
        &self,
        host: &str,
        token: &str,
        hostname: &str,
    ) -> Result<(), GatewayError>;

    async fn request_token(&self, host: &str) -> Result<Token, GatewayError>;

    /// Whether a cached token must be refreshed before talking to `host`
    fn token_expired(&self, token: &Token, host: &str) -> bool;
}

#[derive(Debug, Deserialize)]
struct ServerCreateResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

/// HTTP implementation of the cluster-local API
pub struct HttpClusterGateway {
    client: reqwest::Client,
}

impl HttpClusterGateway {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn url(host: &str, path: &str) -> String {
        format!("http://{host}{path}")
    }
}

impl Default for HttpClusterGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterGateway for HttpClusterGateway {
    async fn server_create(
        &self,
        host: &str,
        token: &str,
        spec: &serde_json::Value,
    ) -> Result<String, GatewayError> {
        let response = self
            .client
            .post(Self::url(host, "/v2/servers"))
            .bearer_auth(token)
            .json(spec)
            .send()
            .await
            .map_err(|source| GatewayError::Http {
                host: host.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(GatewayError::Status {
                host: host.to_string(),
                status: response.status().as_u16(),
            });
        }

        let created: ServerCreateResponse =
            response.json().await.map_err(|err| GatewayError::Malformed {
                host: host.to_string(),
                reason: err.to_string(),
            })?;
        debug!(host = %host, instance_id = %created.id, "instance created");
        Ok(created.id)
    }

    async fn delete_instance(
        &self,
        host: &str,
        token: &str,
        hostname: &str,
    ) -> Result<(), GatewayError> {
        let response = self
            .client
            .delete(Self::url(host, &format!("/v2/servers/{hostname}")))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|source| GatewayError::Http {
                host: host.to_string(),
                source,
            })?;

        // A missing instance means the delete already happened.
        if !response.status().is_success() && response.status().as_u16() != 404 {
            return Err(GatewayError::Status {
                host: host.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    async fn request_token(&self, host: &str) -> Result<Token, GatewayError> {
        let response = self
            .client
            .post(Self::url(host, "/v3/auth/tokens"))
            .send()
            .await
            .map_err(|source| GatewayError::Http {
                host: host.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(GatewayError::Status {
                host: host.to_string(),
                status: response.status().as_u16(),
            });
        }

        let issued: TokenResponse =
            response.json().await.map_err(|err| GatewayError::Malformed {
                host: host.to_string(),
                reason: err.to_string(),
            })?;
        Ok(Token {
            value: issued.token,
            expires_at: issued.expires_at,
        })
    }

    fn token_expired(&self, token: &Token, _host: &str) -> bool {
        token.expires_at <= Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_expiry_check() {
        let gateway = HttpClusterGateway::new();
        let live = Token {
            value: "t".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        };
        let stale = Token {
            value: "t".to_string(),
            expires_at: Utc::now() - chrono::Duration::seconds(1),
        };
        assert!(!gateway.token_expired(&live, "10.0.0.1"));
        assert!(gateway.token_expired(&stale, "10.0.0.1"));
    }

    #[test]
    fn test_url_building() {
        assert_eq!(
            HttpClusterGateway::url("10.0.0.1:8774", "/v2/servers"),
            "http://10.0.0.1:8774/v2/servers"
        );
    }
}
