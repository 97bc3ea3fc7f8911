//! Outbound request types and the seams the session layer talks through.

use std::fmt;

use futures::future::{self, BoxFuture, FutureExt};
use reqwest::header::AUTHORIZATION;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::ApiError;
use crate::auth::{CapabilityRecord, Credential};

/// A request that can be decorated and re-sent.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post<B: Serialize>(url: impl Into<String>, body: &B) -> Result<Self, ApiError> {
        let body = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidResponse(format!("Unserializable request body: {}", e)))?;
        Ok(Self {
            body: Some(body),
            ..Self::new(Method::POST, url)
        })
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Copy of this request carrying `credential` as its bearer token.
    /// Any previous `Authorization` header is replaced.
    pub fn decorated(&self, credential: &Credential) -> Self {
        let mut request = self.clone();
        request
            .headers
            .retain(|(name, _)| !name.eq_ignore_ascii_case(AUTHORIZATION.as_str()));
        request
            .headers
            .push((AUTHORIZATION.as_str().to_string(), credential.bearer()));
        request
    }

    pub fn authorization(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(AUTHORIZATION.as_str()))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_str(&self.body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON response: {}", e)))
    }

    /// Turn a non-2xx response into the matching `ApiError`.
    pub fn error_for_status(self) -> Result<Self, ApiError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ApiError::from_status(self.status, &self.body))
        }
    }
}

/// Sign-in material exchanged for a credential.
#[derive(Clone, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

impl LoginRequest {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Sends a fully decorated request. Transport failures are errors; any
/// HTTP status, including 401, comes back as a response.
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, request: ApiRequest) -> BoxFuture<'_, Result<ApiResponse, ApiError>>;
}

/// Identity-provider endpoints: sign-in, refresh, revoke, authorities.
///
/// `login` and `refresh` return the raw token of the new credential.
pub trait AuthBackend: Send + Sync {
    fn login<'a>(&'a self, material: &'a LoginRequest) -> BoxFuture<'a, Result<String, ApiError>>;

    fn refresh<'a>(&'a self, current: &'a Credential) -> BoxFuture<'a, Result<String, ApiError>>;

    fn revoke<'a>(&'a self, _current: &'a Credential) -> BoxFuture<'a, Result<(), ApiError>> {
        future::ready(Ok(())).boxed()
    }

    /// Supplementary capability records; `None` when no such endpoint exists.
    fn fetch_capabilities<'a>(
        &'a self,
        _current: &'a Credential,
    ) -> BoxFuture<'a, Result<Option<Vec<CapabilityRecord>>, ApiError>> {
        future::ready(Ok(None)).boxed()
    }
}
