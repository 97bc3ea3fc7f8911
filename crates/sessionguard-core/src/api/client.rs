//! HTTP client for the identity provider and for authorized business calls.
//!
//! `ApiClient` implements both [`AuthBackend`] (sign-in, refresh, revoke,
//! authorities) and [`Dispatch`] (sending already-decorated requests). It
//! never runs through the request pipeline itself, so the refresh call can
//! not recurse into the refresh coordinator.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::{BoxFuture, FutureExt};
use reqwest::{header, Client};
use serde::Deserialize;
use tracing::{debug, warn};

use super::request::{ApiRequest, ApiResponse, AuthBackend, Dispatch, LoginRequest};
use super::ApiError;
use crate::auth::{CapabilityRecord, Credential};
use crate::config::SessionConfig;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(alias = "accessToken", alias = "access_token", alias = "jwt")]
    token: String,
}

/// Entries accepted from the authorities endpoint.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AuthorityEntry {
    Name(String),
    Record(CapabilityRecord),
    Authority { authority: String },
}

impl From<AuthorityEntry> for CapabilityRecord {
    fn from(entry: AuthorityEntry) -> Self {
        match entry {
            AuthorityEntry::Name(name) | AuthorityEntry::Authority { authority: name } => {
                CapabilityRecord::granted(name)
            }
            AuthorityEntry::Record(record) => record,
        }
    }
}

/// Identity-provider endpoints.
#[derive(Debug, Clone)]
pub struct AuthEndpoints {
    pub login_url: String,
    pub refresh_url: String,
    pub revoke_url: Option<String>,
    pub authorities_url: Option<String>,
}

/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    endpoints: AuthEndpoints,
}

impl ApiClient {
    pub fn new(endpoints: AuthEndpoints, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client, endpoints })
    }

    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        Self::new(config.endpoints(), config.request_timeout())
    }

    pub fn endpoints(&self) -> &AuthEndpoints {
        &self.endpoints
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status.as_u16(), &body))
        }
    }

    /// Token from a JSON body, falling back to a bearer `Authorization` header.
    async fn read_token(response: reqwest::Response) -> Result<String, ApiError> {
        let from_header = response
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);

        let body = response.text().await?;
        match serde_json::from_str::<TokenResponse>(&body) {
            Ok(parsed) => Ok(parsed.token),
            Err(e) => from_header.ok_or_else(|| {
                ApiError::InvalidResponse(format!("No token in authentication response: {}", e))
            }),
        }
    }
}

impl AuthBackend for ApiClient {
    fn login<'a>(&'a self, material: &'a LoginRequest) -> BoxFuture<'a, Result<String, ApiError>> {
        async move {
            debug!(username = %material.username, "Authenticating");
            let response = self
                .client
                .post(&self.endpoints.login_url)
                .header(header::ACCEPT, "application/json")
                .json(material)
                .send()
                .await?;

            let response = Self::check_response(response).await?;
            Self::read_token(response).await
        }
        .boxed()
    }

    fn refresh<'a>(&'a self, current: &'a Credential) -> BoxFuture<'a, Result<String, ApiError>> {
        async move {
            let response = self
                .client
                .post(&self.endpoints.refresh_url)
                .header(header::ACCEPT, "application/json")
                .bearer_auth(current.token())
                .send()
                .await?;

            let response = Self::check_response(response).await?;
            Self::read_token(response).await
        }
        .boxed()
    }

    fn revoke<'a>(&'a self, current: &'a Credential) -> BoxFuture<'a, Result<(), ApiError>> {
        async move {
            let Some(ref url) = self.endpoints.revoke_url else {
                return Ok(());
            };
            let response = self
                .client
                .post(url)
                .bearer_auth(current.token())
                .send()
                .await?;
            Self::check_response(response).await?;
            Ok(())
        }
        .boxed()
    }

    fn fetch_capabilities<'a>(
        &'a self,
        current: &'a Credential,
    ) -> BoxFuture<'a, Result<Option<Vec<CapabilityRecord>>, ApiError>> {
        async move {
            let Some(ref url) = self.endpoints.authorities_url else {
                return Ok(None);
            };
            let response = self
                .client
                .get(url)
                .header(header::ACCEPT, "application/json")
                .bearer_auth(current.token())
                .send()
                .await?;

            let response = Self::check_response(response).await?;
            let entries: Vec<AuthorityEntry> = response.json().await.map_err(|e| {
                warn!(error = %e, "Failed to parse authorities response");
                ApiError::InvalidResponse(format!("Failed to parse authorities: {}", e))
            })?;
            Ok(Some(entries.into_iter().map(CapabilityRecord::from).collect()))
        }
        .boxed()
    }
}

impl Dispatch for ApiClient {
    fn dispatch(&self, request: ApiRequest) -> BoxFuture<'_, Result<ApiResponse, ApiError>> {
        async move {
            let mut builder = self.client.request(request.method.clone(), &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(ref body) = request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await?;
            let status = response.status().as_u16();
            let body = response.text().await?;
            debug!(method = %request.method, url = %request.url, status, "Request completed");
            Ok(ApiResponse { status, body })
        }
        .boxed()
    }
}
