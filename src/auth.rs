//! External authorization channel.
//!
//! Alternative to the PIN: the unblock request is relayed to a backend
//! where a remote device approves or denies it. The client creates a
//! request keyed by a request id, waits for the decision within a wait
//! budget, and abandons the request (DELETE) when the budget lapses. A
//! grant carries the unblock duration in hours; a grant without one gets
//! a one-hour default.

use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Unblock duration applied when a grant does not carry one.
pub const DEFAULT_UNBLOCK_HOURS: f64 = 1.0;

/// A successful remote authorization.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthGrant {
    pub hours: f64,
}

/// Asynchronous request/decision exchange with an authorization backend.
#[allow(async_fn_in_trait)]
pub trait AuthChannel: Send + Sync {
    /// Ask for permission to unblock `url`, waiting up to `budget` for
    /// the decision. Returns [`CoreError::AuthTimeout`] when the budget
    /// lapses and [`CoreError::AuthFailed`] on denial or backend failure.
    async fn request_unblock(&self, url: &str, budget: Duration) -> Result<AuthGrant>;
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    status: String,
    #[serde(default)]
    req_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DecisionResponse {
    status: String,
    #[serde(default)]
    hours: Option<f64>,
}

/// HTTP implementation polling the backend's decision endpoint on a
/// jittered cadence.
pub struct HttpAuthChannel {
    client: Client,
    endpoint: String,
    client_id: String,
    poll_interval: Duration,
    poll_jitter: Duration,
}

impl HttpAuthChannel {
    /// Create a channel for the given backend base URL.
    pub fn new(
        endpoint: &str,
        poll_interval_secs: u64,
        poll_jitter_secs: u64,
    ) -> anyhow::Result<Self> {
        let parsed = url::Url::parse(endpoint).context("Invalid authorization endpoint URL")?;
        if parsed.scheme() != "https" {
            anyhow::bail!(
                "Authorization endpoint must use HTTPS (got: {})",
                parsed.scheme()
            );
        }

        let client = Client::builder()
            .user_agent(format!("sitegate/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .https_only(true)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client_id: Uuid::new_v4().to_string(),
            poll_interval: Duration::from_secs(poll_interval_secs),
            poll_jitter: Duration::from_secs(poll_jitter_secs),
        })
    }

    async fn create_request(&self, url: &str) -> Result<String> {
        let body = serde_json::json!({
            "type": "unblock request",
            "url": url,
            "client_id": self.client_id,
        });

        let response = self
            .client
            .post(format!("{}/unblock", self.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::AuthFailed(format!("request creation failed: {e}")))?;

        match response.status() {
            StatusCode::OK => {
                let created: CreateResponse = response
                    .json()
                    .await
                    .map_err(|e| CoreError::AuthFailed(format!("malformed response: {e}")))?;
                if created.status != "ok" {
                    return Err(CoreError::AuthFailed(format!(
                        "backend refused request: {}",
                        created.status
                    )));
                }
                created
                    .req_id
                    .ok_or_else(|| CoreError::AuthFailed("response carried no req_id".to_string()))
            }
            status => Err(CoreError::AuthFailed(format!(
                "backend returned {status} creating unblock request"
            ))),
        }
    }

    async fn poll_decision(&self, req_id: &str) -> Result<Option<AuthGrant>> {
        let response = self
            .client
            .get(format!("{}/unblock/{}", self.endpoint, req_id))
            .send()
            .await
            .map_err(|e| CoreError::AuthFailed(format!("decision poll failed: {e}")))?;

        if response.status() != StatusCode::OK {
            return Err(CoreError::AuthFailed(format!(
                "backend returned {} polling decision",
                response.status()
            )));
        }

        let decision: DecisionResponse = response
            .json()
            .await
            .map_err(|e| CoreError::AuthFailed(format!("malformed decision: {e}")))?;

        match decision.status.as_str() {
            "ok" => Ok(Some(AuthGrant {
                hours: decision.hours.unwrap_or(DEFAULT_UNBLOCK_HOURS),
            })),
            "pending" => Ok(None),
            other => Err(CoreError::AuthFailed(format!("request {other}"))),
        }
    }

    /// Abandon a request whose wait budget lapsed. Failures only logged:
    /// the backend reaps stale requests on its own.
    async fn abandon_request(&self, req_id: &str) {
        let result = self
            .client
            .delete(format!("{}/unblock/{}", self.endpoint, req_id))
            .send()
            .await;
        if let Err(err) = result {
            tracing::warn!("failed to abandon unblock request {req_id}: {err}");
        }
    }

    /// Poll cadence with jitter to avoid synchronized client bursts.
    fn next_poll_delay(&self) -> Duration {
        let jitter_secs = if self.poll_jitter.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.poll_jitter.as_secs())
        };
        self.poll_interval + Duration::from_secs(jitter_secs)
    }
}

impl AuthChannel for HttpAuthChannel {
    async fn request_unblock(&self, url: &str, budget: Duration) -> Result<AuthGrant> {
        let deadline = Instant::now() + budget;
        let req_id = self.create_request(url).await?;
        tracing::debug!("created unblock request {} for {}", req_id, url);

        loop {
            let delay = self.next_poll_delay().min(
                deadline.saturating_duration_since(Instant::now()),
            );
            tokio::time::sleep(delay).await;

            if Instant::now() >= deadline {
                self.abandon_request(&req_id).await;
                return Err(CoreError::AuthTimeout(budget.as_secs()));
            }

            match self.poll_decision(&req_id).await {
                Ok(Some(grant)) => {
                    tracing::info!("unblock request {} authorized for {} hour(s)", req_id, grant.hours);
                    return Ok(grant);
                }
                Ok(None) => continue,
                Err(CoreError::AuthFailed(reason)) if reason.starts_with("decision poll") => {
                    // Transient transport failure; keep polling within budget.
                    tracing::warn!("{reason}");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_https_endpoints() {
        assert!(HttpAuthChannel::new("http://auth.example.com", 2, 1).is_err());
        assert!(HttpAuthChannel::new("not a url", 2, 1).is_err());
    }

    #[test]
    fn accepts_https_endpoint_and_strips_trailing_slash() {
        let channel = HttpAuthChannel::new("https://auth.example.com/", 2, 1).unwrap();
        assert_eq!(channel.endpoint, "https://auth.example.com");
    }

    #[test]
    fn poll_delay_stays_within_jitter_range() {
        let channel = HttpAuthChannel::new("https://auth.example.com", 2, 3).unwrap();
        for _ in 0..100 {
            let delay = channel.next_poll_delay();
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(5));
        }
    }

    #[test]
    fn poll_delay_with_zero_jitter_is_fixed() {
        let channel = HttpAuthChannel::new("https://auth.example.com", 2, 0).unwrap();
        for _ in 0..10 {
            assert_eq!(channel.next_poll_delay(), Duration::from_secs(2));
        }
    }

    #[test]
    fn each_channel_gets_its_own_client_id() {
        let a = HttpAuthChannel::new("https://auth.example.com", 2, 0).unwrap();
        let b = HttpAuthChannel::new("https://auth.example.com", 2, 0).unwrap();
        assert_ne!(a.client_id, b.client_id);
    }
}
