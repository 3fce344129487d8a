//! Address Enrichment Module
//!
//! Looks up geolocation and ISP data for discovered addresses.
//!
//! ## Outcomes
//!
//! - `Ok(Some(geo))`: usable data, caller creates or refreshes the node
//! - `Ok(None)`: the service answered but has no data for the address
//! - `Err(RateLimitExceeded)`: quota exhausted, caller cools down
//! - any other `Err`: transient, logged and skipped

mod protocol;
mod rate_limiter;

pub use rate_limiter::RateLimiter;

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, warn};

use crate::types::GeoInfo;
use protocol::{LookupResponse, REQUESTED_FIELDS};

/// Enrichment failures
#[derive(Debug, thiserror::Error)]
pub enum EnrichmentError {
    #[error("Lookup service rate limit exceeded")]
    RateLimitExceeded,

    #[error("Lookup request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Lookup service returned HTTP {0}")]
    Status(StatusCode),

    #[error("Invalid lookup response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Source of geolocation data for an address
#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn lookup(&self, ip: &str) -> Result<Option<GeoInfo>, EnrichmentError>;
}

/// HTTP client for the geolocation service, throttled by a token bucket
pub struct EnrichmentClient {
    http: reqwest::Client,
    base_url: String,
    limiter: RateLimiter,
}

impl EnrichmentClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        limiter: RateLimiter,
    ) -> Result<Self, EnrichmentError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            limiter,
        })
    }

    fn lookup_url(&self, ip: &str) -> String {
        format!("{}/{}?fields={}", self.base_url, ip, REQUESTED_FIELDS)
    }
}

#[async_trait]
impl GeoLookup for EnrichmentClient {
    async fn lookup(&self, ip: &str) -> Result<Option<GeoInfo>, EnrichmentError> {
        self.limiter.wait().await;

        debug!(ip = %ip, "Looking up address");
        let response = self.http.get(self.lookup_url(ip)).send().await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(EnrichmentError::RateLimitExceeded);
        }
        if !status.is_success() {
            return Err(EnrichmentError::Status(status));
        }

        let body = response.bytes().await?;
        classify(serde_json::from_slice(&body)?, ip)
    }
}

/// Map a decoded response onto the lookup outcome
fn classify(response: LookupResponse, ip: &str) -> Result<Option<GeoInfo>, EnrichmentError> {
    if response.is_success() {
        return Ok(Some(response.geo));
    }

    if response.is_quota_exhausted() {
        return Err(EnrichmentError::RateLimitExceeded);
    }

    warn!(
        ip = %ip,
        status = %response.status,
        message = response.message.as_deref().unwrap_or(""),
        "Lookup service has no data for address"
    );
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(text: &str) -> LookupResponse {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn test_classify_success() {
        let geo = classify(
            decode(r#"{"status":"success","country":"Canada","isp":"OVH"}"#),
            "51.79.1.1",
        )
        .unwrap()
        .unwrap();

        assert_eq!(geo.country, "Canada");
        assert_eq!(geo.isp, "OVH");
    }

    #[test]
    fn test_classify_no_data() {
        let outcome = classify(
            decode(r#"{"status":"fail","message":"reserved range"}"#),
            "240.0.0.1",
        )
        .unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn test_classify_quota() {
        let outcome = classify(
            decode(r#"{"status":"fail","message":"quota exceeded"}"#),
            "8.8.8.8",
        );
        assert!(matches!(outcome, Err(EnrichmentError::RateLimitExceeded)));
    }

    #[test]
    fn test_lookup_url() {
        let client = EnrichmentClient::new(
            "http://ip-api.com/json/",
            Duration::from_secs(10),
            RateLimiter::new(1.0, 1.0),
        )
        .unwrap();

        let url = client.lookup_url("93.184.216.34");
        assert!(url.starts_with("http://ip-api.com/json/93.184.216.34?fields=status,message"));
    }

    /// Local stand-in for the lookup service: one address per response kind
    async fn serve_lookups() -> std::net::SocketAddr {
        use axum::extract::Path;
        use axum::http::StatusCode as HttpStatus;
        use axum::response::{IntoResponse, Response};
        use axum::routing::get;
        use axum::{Json, Router};

        async fn answer(Path(ip): Path<String>) -> Response {
            match ip.as_str() {
                "1.1.1.1" => HttpStatus::TOO_MANY_REQUESTS.into_response(),
                "2.2.2.2" => HttpStatus::INTERNAL_SERVER_ERROR.into_response(),
                _ => Json(serde_json::json!({
                    "status": "success",
                    "country": "Germany",
                    "city": "Falkenstein",
                    "isp": "Hetzner Online GmbH",
                    "query": ip,
                }))
                .into_response(),
            }
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/json/:ip", get(answer));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_http_outcomes_and_token_use() {
        let addr = serve_lookups().await;
        let client = EnrichmentClient::new(
            &format!("http://{}/json", addr),
            Duration::from_secs(5),
            RateLimiter::new(0.001, 3.0),
        )
        .unwrap();

        let limited = client.lookup("1.1.1.1").await;
        assert!(matches!(limited, Err(EnrichmentError::RateLimitExceeded)));

        match client.lookup("2.2.2.2").await {
            Err(EnrichmentError::Status(status)) => assert_eq!(status.as_u16(), 500),
            other => panic!("expected HTTP status error, got {:?}", other),
        }

        let geo = client.lookup("3.3.3.3").await.unwrap().unwrap();
        assert_eq!(geo.country, "Germany");
        assert_eq!(geo.isp, "Hetzner Online GmbH");
        assert_eq!(geo.query, "3.3.3.3");

        // Every request took a token, refused ones included
        assert!(client.limiter.available() < 1.0);
    }
}
