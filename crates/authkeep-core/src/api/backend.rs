//! Login, renewal and registration endpoints.
//!
//! These are the only calls that are never routed through the request
//! interceptor: they either create credentials or consume the renewal
//! credential directly.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::CredentialPair;
use crate::config::Config;

use super::ApiError;

/// Outcome of a renewal exchange.
///
/// `renewal` is only present when the backend rotates renewal credentials.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RenewedCredentials {
    pub access: String,
    #[serde(rename = "refresh", default)]
    pub renewal: Option<String>,
}

impl RenewedCredentials {
    /// Apply the rotation policy: a rotated renewal credential replaces the
    /// old one, otherwise the old one stays in use.
    pub fn into_pair(self, previous_renewal: &str) -> CredentialPair {
        let renewal = self
            .renewal
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| previous_renewal.to_string());
        CredentialPair::new(self.access, renewal)
    }
}

/// The credential-issuing side of the backend.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Exchange identity + secret for a fresh credential pair
    async fn login(&self, username: &str, password: &str) -> Result<CredentialPair, ApiError>;

    /// Exchange a renewal credential for a new access credential
    async fn renew(&self, renewal: &str) -> Result<RenewedCredentials, ApiError>;

    /// Create an account. Does not log in.
    async fn register(&self, username: &str, password: &str) -> Result<(), ApiError>;
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RenewalRequest<'a> {
    refresh: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    access: String,
    refresh: String,
}

/// [`AuthBackend`] over HTTP.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpAuthBackend {
    client: Client,
    login_url: String,
    refresh_url: String,
    register_url: String,
}

impl HttpAuthBackend {
    pub fn new(client: Client, config: &Config) -> Self {
        Self {
            client,
            login_url: config.endpoint(&config.login_path),
            refresh_url: config.endpoint(&config.refresh_path),
            register_url: config.endpoint(&config.register_path),
        }
    }

    async fn post_json<B: Serialize>(&self, url: &str, body: &B) -> Result<reqwest::Response, ApiError> {
        let response = self
            .client
            .post(url)
            .header(header::ACCEPT, "application/json")
            .json(body)
            .send()
            .await?;
        debug!(url = url, status = %response.status(), "Auth endpoint responded");
        Ok(response)
    }

    async fn error_from(response: reqwest::Response) -> ApiError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        ApiError::from_status(status, &body)
    }
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn login(&self, username: &str, password: &str) -> Result<CredentialPair, ApiError> {
        let response = self
            .post_json(&self.login_url, &LoginRequest { username, password })
            .await?;

        match response.status() {
            s if s.is_success() => {
                let body: LoginResponse = response
                    .json()
                    .await
                    .map_err(|e| ApiError::InvalidResponse(format!("login response: {e}")))?;
                Ok(CredentialPair::new(body.access, body.refresh))
            }
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => Err(ApiError::InvalidCredentials),
            _ => Err(Self::error_from(response).await),
        }
    }

    async fn renew(&self, renewal: &str) -> Result<RenewedCredentials, ApiError> {
        let response = self
            .post_json(&self.refresh_url, &RenewalRequest { refresh: renewal })
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("renewal response: {e}")))
    }

    async fn register(&self, username: &str, password: &str) -> Result<(), ApiError> {
        let response = self
            .post_json(&self.register_url, &LoginRequest { username, password })
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_from(response).await)
        }
    }
}
