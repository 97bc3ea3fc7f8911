//! Authorization decoration for outbound requests.
//!
//! Per request: attach a fresh credential, dispatch, and on a 401 refresh
//! once and re-send once. A second 401 ends the session. Failures that have
//! nothing to do with credentials are returned untouched.

use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::request::{ApiRequest, ApiResponse, Dispatch};
use super::ApiError;
use crate::auth::expiry::{self, Freshness};
use crate::auth::{CredentialStore, RefreshCoordinator, SessionEvent, TerminationHook};
use crate::error::SessionError;

/// Clone is cheap; all parts are shared.
#[derive(Clone)]
pub struct RequestPipeline {
    dispatcher: Arc<dyn Dispatch>,
    store: Arc<CredentialStore>,
    coordinator: RefreshCoordinator,
    hook: Arc<TerminationHook>,
    refresh_url: String,
}

impl RequestPipeline {
    pub fn new(
        dispatcher: Arc<dyn Dispatch>,
        store: Arc<CredentialStore>,
        coordinator: RefreshCoordinator,
        hook: Arc<TerminationHook>,
        refresh_url: impl Into<String>,
    ) -> Self {
        Self {
            dispatcher,
            store,
            coordinator,
            hook,
            refresh_url: refresh_url.into(),
        }
    }

    /// Requests to the refresh endpoint are never decorated or retried.
    fn is_refresh_call(&self, request: &ApiRequest) -> bool {
        let url = request.url.split(['?', '#']).next().unwrap_or_default();
        url.trim_end_matches('/') == self.refresh_url.trim_end_matches('/')
    }

    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, SessionError> {
        if self.is_refresh_call(&request) {
            debug!("Refresh endpoint request, sending undecorated");
            return self.send_plain(request).await;
        }

        let Some(current) = self.store.get() else {
            debug!(url = %request.url, "No credential, sending undecorated");
            return self.send_plain(request).await;
        };

        if expiry::evaluate(current.claims(), Utc::now(), self.coordinator.threshold())
            == Freshness::ExpiringSoon
        {
            let remaining = expiry::time_until_expiry(current.claims(), Utc::now());
            self.hook.notify(SessionEvent::Expiring {
                seconds_remaining: remaining.num_seconds(),
            });
        }

        let credential = self.coordinator.ensure_fresh().await?;
        let response = self.dispatcher.dispatch(request.decorated(&credential)).await?;
        if !response.is_unauthorized() {
            return Ok(response.error_for_status()?);
        }

        // One reactive refresh and one re-send, never more.
        debug!(url = %request.url, "Credential rejected, refreshing and retrying once");
        let original = ApiError::from_status(response.status, &response.body);
        let renewed = match self.coordinator.refresh_rejected(&credential).await {
            Ok(renewed) => renewed,
            Err(_) => return Err(SessionError::AuthorizationFailure(original)),
        };

        let retried = self.dispatcher.dispatch(request.decorated(&renewed)).await?;
        if retried.is_unauthorized() {
            warn!(url = %request.url, "Refreshed credential rejected, ending session");
            self.coordinator.terminate_rejected(&renewed);
            return Err(SessionError::AuthorizationFailure(original));
        }
        Ok(retried.error_for_status()?)
    }

    async fn send_plain(&self, request: ApiRequest) -> Result<ApiResponse, SessionError> {
        let response = self.dispatcher.dispatch(request).await?;
        Ok(response.error_for_status()?)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, SessionError> {
        let response = self.execute(ApiRequest::get(url)).await?;
        Ok(response.json()?)
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, SessionError> {
        let response = self.execute(ApiRequest::post(url, body)?).await?;
        Ok(response.json()?)
    }
}
