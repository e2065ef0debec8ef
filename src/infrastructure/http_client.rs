//! HTTP client for portal sessions with rate limiting and login handling
//!
//! One `PortalClient` per worker session: its own cookie jar, its own
//! browser fingerprint, its own rate limiter. Sessions are never shared
//! across concurrent requests because the portal ties rate limits and
//! cookies to session identity.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, direct::NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Client, Response};
use tokio_util::sync::CancellationToken;

use crate::domain::entities::Credential;
use crate::infrastructure::config::PortalConfig;
use crate::infrastructure::fingerprint::BrowserFingerprint;

/// Authenticated HTTP session against the claims portal.
pub struct PortalClient {
    client: Client,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    portal: Arc<PortalConfig>,
    fingerprint: BrowserFingerprint,
}

impl PortalClient {
    /// Build a fresh client presenting the given browser identity.
    ///
    /// The cookie jar starts empty; call [`PortalClient::login`] before
    /// using the session for listing or download requests.
    pub fn new(fingerprint: BrowserFingerprint, portal: Arc<PortalConfig>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&fingerprint.user_agent).context("Invalid user agent")?,
        );
        headers.insert(
            ACCEPT,
            HeaderValue::from_str(&fingerprint.accept).context("Invalid accept header")?,
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_str(&fingerprint.accept_language)
                .context("Invalid accept-language header")?,
        );
        if !fingerprint.sec_ch_ua_platform.is_empty() {
            headers.insert(
                HeaderName::from_static("sec-ch-ua-platform"),
                HeaderValue::from_str(&fingerprint.sec_ch_ua_platform)
                    .context("Invalid sec-ch-ua-platform header")?,
            );
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(portal.request_timeout_seconds))
            .default_headers(headers)
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("Failed to create HTTP client")?;

        let quota = Quota::per_second(
            NonZeroU32::new(portal.max_requests_per_second)
                .context("Rate limit must be greater than 0")?,
        );
        let rate_limiter = RateLimiter::direct(quota);

        Ok(Self {
            client,
            rate_limiter,
            portal,
            fingerprint,
        })
    }

    pub fn fingerprint(&self) -> &BrowserFingerprint {
        &self.fingerprint
    }

    pub fn portal(&self) -> &PortalConfig {
        &self.portal
    }

    /// Resolve a portal-relative path to an absolute URL.
    pub fn absolute_url(&self, path: &str) -> String {
        if path.starts_with("http") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.portal.base_url.trim_end_matches('/'), path)
        } else {
            format!("{}/{}", self.portal.base_url.trim_end_matches('/'), path)
        }
    }

    /// Rate-limited GET returning the raw response.
    ///
    /// The status is deliberately not checked here; the fetch engine needs
    /// to distinguish rate-limit responses (429/403) from other failures.
    pub async fn get(&self, url: &str) -> Result<Response> {
        self.rate_limiter.until_ready().await;

        tracing::debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch URL: {url}"))?;
        Ok(response)
    }

    /// Fetch a page and return its body, failing on non-2xx status.
    pub async fn get_text(&self, url: &str) -> Result<String> {
        let response = self.get(url).await?;
        if !response.status().is_success() {
            anyhow::bail!(
                "HTTP request failed with status {}: {}",
                response.status(),
                url
            );
        }
        let text = response
            .text()
            .await
            .with_context(|| format!("Failed to read response body from: {url}"))?;
        Ok(text)
    }

    /// Fetch a page body, aborting as soon as the token fires.
    ///
    /// Used for the listing fetch so a batch cancelled during discovery
    /// does not sit out the rate limiter or a slow portal response.
    pub async fn get_text_with_cancellation(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if cancel.is_cancelled() {
            anyhow::bail!("Fetch of {url} aborted: batch cancelled");
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                anyhow::bail!("Fetch of {url} aborted while waiting on the rate limiter");
            }
            _ = self.rate_limiter.until_ready() => {}
        }

        tracing::debug!("GET {}", url);
        let response = tokio::select! {
            _ = cancel.cancelled() => {
                anyhow::bail!("Fetch of {url} aborted mid-request");
            }
            result = self.client.get(url).send() => {
                result.with_context(|| format!("Failed to fetch URL: {url}"))?
            }
        };

        if !response.status().is_success() {
            anyhow::bail!(
                "HTTP request failed with status {}: {}",
                response.status(),
                url
            );
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                anyhow::bail!("Fetch of {url} aborted while reading the body");
            }
            body = response.text() => {
                body.with_context(|| format!("Failed to read response body from: {url}"))
            }
        }
    }

    /// Authenticate this session against the portal.
    ///
    /// Verification is fail-closed: a 2xx response is not enough. The final
    /// URL must not be the login page again (the portal redirects rejected
    /// logins back to the form) and the post-login page must contain the
    /// configured content marker. Anything ambiguous is a failure.
    pub async fn login(&self, credential: &Credential) -> Result<()> {
        let login_url = self.absolute_url(&self.portal.login_path);

        // Prime the session cookie before posting the form.
        let _ = self
            .get_text(&login_url)
            .await
            .context("Failed to load login page")?;

        self.rate_limiter.until_ready().await;
        let response = self
            .client
            .post(&login_url)
            .form(&[
                (self.portal.username_field.as_str(), credential.username.as_str()),
                (self.portal.password_field.as_str(), credential.secret.as_str()),
            ])
            .send()
            .await
            .context("Login request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Login rejected with status {}", response.status());
        }

        // Redirect-back detection: landing on the login path again means
        // the credentials were rejected even though the status was 2xx.
        let final_path = response.url().path().to_string();
        if final_path.trim_end_matches('/') == self.portal.login_path.trim_end_matches('/') {
            anyhow::bail!("Login redirected back to the login page");
        }

        let body = response
            .text()
            .await
            .context("Failed to read post-login page")?;
        if !body.contains(&self.portal.login_success_marker) {
            anyhow::bail!(
                "Post-login page missing expected marker '{}'",
                self.portal.login_success_marker
            );
        }

        tracing::info!(
            "Login verified for '{}' using fingerprint {}",
            credential.label,
            self.fingerprint.name
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::fingerprint::FingerprintPool;

    fn test_client() -> PortalClient {
        let fingerprint = FingerprintPool::new().shuffled().remove(0);
        PortalClient::new(fingerprint, Arc::new(PortalConfig::default())).unwrap()
    }

    #[tokio::test]
    async fn client_creation_succeeds_for_every_fingerprint() {
        let portal = Arc::new(PortalConfig::default());
        for fingerprint in FingerprintPool::new().shuffled() {
            assert!(PortalClient::new(fingerprint, Arc::clone(&portal)).is_ok());
        }
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_the_fetch() {
        let client = test_client();
        let token = CancellationToken::new();
        token.cancel();

        // Must fail before any network activity is attempted.
        let err = client
            .get_text_with_cancellation("http://127.0.0.1:1/listing", &token)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn absolute_url_resolution() {
        let client = test_client();
        let base = client.portal().base_url.clone();

        assert_eq!(
            client.absolute_url("/webComponent/download"),
            format!("{base}/webComponent/download")
        );
        assert_eq!(
            client.absolute_url("relative/page"),
            format!("{base}/relative/page")
        );
        assert_eq!(
            client.absolute_url("https://other.example.com/x"),
            "https://other.example.com/x"
        );
    }
}
