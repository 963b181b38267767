//! API client for protected endpoints.
//!
//! Every call goes through [`ApiClient::send`], which attaches the session's
//! current access credential to that one request, and on a 401 renews the
//! credential through the [`RefreshCoordinator`] and replays the request once.

use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::claims::fingerprint;
use crate::auth::{RefreshCoordinator, Session};
use crate::config::Config;

use super::ApiError;

/// Account details returned by the profile endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub username: String,
    #[serde(default)]
    pub email: String,
}

/// Credential-attaching client with transparent renewal.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    profile_path: String,
    session: Session,
    coordinator: RefreshCoordinator,
}

impl ApiClient {
    pub fn new(client: Client, config: &Config, session: Session, coordinator: RefreshCoordinator) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            profile_path: config.profile_path.clone(),
            session,
            coordinator,
        }
    }

    /// Absolute URL for a path on the configured backend
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    /// Send a request built by `build`, with the session credential attached.
    ///
    /// `build` is called again for the replay, so it must describe the whole
    /// request. Any status other than 401 is returned untouched, as are
    /// transport errors. A 401 triggers one coordinated renewal and one
    /// replay; if renewal fails the result is [`ApiError::SessionExpired`].
    /// The replay's response is returned as is, even if it is another 401.
    pub async fn send<F>(&self, build: F) -> Result<Response, ApiError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let sent_with = self.session.access_token();
        let response = self.dispatch(&build, sent_with.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!(
            credential = ?sent_with.as_deref().map(fingerprint),
            "Authorization failure, renewing before replay"
        );
        let access = match self.session.access_token() {
            // Another call already renewed while this one was in flight
            Some(current) if sent_with.as_deref() != Some(current.as_str()) => current,
            _ => self.coordinator.refresh().await?.access,
        };

        let response = self.dispatch(&build, Some(&access)).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(url = %response.url(), "Replayed request still unauthorized");
        }
        Ok(response)
    }

    async fn dispatch<F>(&self, build: &F, access: Option<&str>) -> Result<Response, ApiError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut request = build(&self.client).header(header::ACCEPT, "application/json");
        if let Some(token) = access {
            request = request.bearer_auth(token);
        }
        Ok(request.send().await?)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn parse<T: DeserializeOwned>(response: Response, url: &str) -> Result<T, ApiError> {
        let response = Self::check_response(response).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON response from {url}: {e}")))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.url(path);
        let response = self.send(|client| client.get(&url)).await?;
        Self::parse(response, &url).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let url = self.url(path);
        let response = self.send(|client| client.post(&url).json(body)).await?;
        Self::parse(response, &url).await
    }

    /// Fetch the signed-in account's profile
    pub async fn fetch_profile(&self) -> Result<Profile, ApiError> {
        self.get(&self.profile_path).await
    }
}
