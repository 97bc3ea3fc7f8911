//! The session manager: one owned instance per process.
//!
//! Wires the credential store, refresh coordinator, termination hook and
//! request pipeline together and exposes what consumers need: a fresh
//! credential, capability checks, termination notification, login and
//! logout.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::api::{
    ApiClient, ApiError, ApiRequest, ApiResponse, AuthBackend, Dispatch, LoginRequest,
    RequestPipeline,
};
use crate::auth::expiry;
use crate::auth::{
    CapabilityCache, Credential, CredentialStore, MemoryBackend, RefreshCoordinator,
    SessionEvent, SessionState, StorageBackend, TerminationHook, TerminationReason,
};
use crate::config::SessionConfig;
use crate::error::SessionError;

pub struct SessionManager {
    store: Arc<CredentialStore>,
    backend: Arc<dyn AuthBackend>,
    coordinator: RefreshCoordinator,
    hook: Arc<TerminationHook>,
    pipeline: RequestPipeline,
}

impl SessionManager {
    pub fn new(
        config: &SessionConfig,
        backend: Arc<dyn AuthBackend>,
        dispatcher: Arc<dyn Dispatch>,
        storage: Box<dyn StorageBackend>,
    ) -> Self {
        let store = Arc::new(CredentialStore::new(storage));
        let hook = Arc::new(TerminationHook::new());
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            backend.clone(),
            hook.clone(),
            config.threshold(),
            config.refresh_timeout(),
        );
        let pipeline = RequestPipeline::new(
            dispatcher,
            store.clone(),
            coordinator.clone(),
            hook.clone(),
            config.refresh_url.clone(),
        );

        Self {
            store,
            backend,
            coordinator,
            hook,
            pipeline,
        }
    }

    /// Build a manager talking to the configured endpoints over HTTP.
    ///
    /// If the configured storage cannot be opened the session is kept in
    /// memory for this process only.
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let client = Arc::new(ApiClient::from_config(config)?);
        let storage = config.storage_backend().unwrap_or_else(|e| {
            warn!(error = %e, "Credential storage unavailable, keeping session in memory");
            Box::new(MemoryBackend::new())
        });
        Ok(Self::new(config, client.clone(), client, storage))
    }

    // ===== Credentials =====

    /// A credential that is valid and not about to expire.
    pub async fn ensure_fresh(&self) -> Result<Credential, SessionError> {
        self.coordinator.ensure_fresh().await
    }

    /// The stored credential as is, without refreshing.
    pub fn current_credential(&self) -> Option<Credential> {
        self.store.get()
    }

    pub fn state(&self) -> SessionState {
        self.coordinator.state()
    }

    /// Time left on the stored credential; `None` when signed out.
    pub fn time_until_expiry(&self) -> Option<chrono::Duration> {
        self.store
            .get()
            .map(|c| expiry::time_until_expiry(c.claims(), Utc::now()))
    }

    // ===== Capabilities =====

    pub fn has_capability(&self, name: &str) -> bool {
        self.store.has_capability(name)
    }

    pub fn has_all<S: AsRef<str>>(&self, names: &[S]) -> bool {
        self.store.has_all(names)
    }

    pub fn has_any<S: AsRef<str>>(&self, names: &[S]) -> bool {
        self.store.has_any(names)
    }

    pub fn capabilities(&self) -> CapabilityCache {
        self.store.capabilities()
    }

    // ===== Notifications =====

    pub fn on_session_terminated<F>(&self, callback: F)
    where
        F: Fn(TerminationReason) + Send + Sync + 'static,
    {
        self.hook.on_terminated(callback);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.hook.subscribe()
    }

    // ===== Sign-in / sign-out =====

    /// Exchange sign-in material for a credential and make it current.
    pub async fn login(&self, material: LoginRequest) -> Result<Credential, SessionError> {
        let token = self.backend.login(&material).await.map_err(|e| match e {
            ApiError::Unauthorized | ApiError::AccessDenied(_) => SessionError::InvalidCredentials,
            other => SessionError::Api(other),
        })?;

        let credential = Credential::new(token);
        if expiry::is_expired(credential.claims(), Utc::now()) {
            warn!("Identity provider issued an unusable credential");
            return Err(SessionError::Api(ApiError::InvalidResponse(
                "Sign-in returned an expired or malformed credential".to_string(),
            )));
        }

        self.coordinator.install(credential.clone());
        info!(subject = ?credential.subject(), "Signed in");
        self.coordinator.sync_capabilities().await;
        Ok(credential)
    }

    /// End the session locally. Never fails and may be called repeatedly.
    ///
    /// When running inside a tokio runtime the credential is also revoked
    /// server-side in the background; a failed revoke is only logged.
    pub fn logout(&self) {
        let Some(credential) = self.end_session() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime available, skipping credential revoke");
            return;
        };
        let backend = self.backend.clone();
        handle.spawn(async move {
            revoke(backend.as_ref(), &credential).await;
        });
    }

    /// Like [`logout`](Self::logout), but waits for the revoke to finish.
    /// For short-lived processes that would exit before a background task ran.
    pub async fn logout_and_revoke(&self) {
        if let Some(credential) = self.end_session() {
            revoke(self.backend.as_ref(), &credential).await;
        }
    }

    /// Terminate locally, returning the credential that was current.
    fn end_session(&self) -> Option<Credential> {
        let current = self.store.get();
        if !self.coordinator.terminate(TerminationReason::Logout) {
            debug!("Logout with no live session");
        }
        current
    }

    // ===== Authorized requests =====

    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, SessionError> {
        self.pipeline.execute(request).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, SessionError> {
        self.pipeline.get_json(url).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, SessionError> {
        self.pipeline.post_json(url, body).await
    }
}

async fn revoke(backend: &dyn AuthBackend, credential: &Credential) {
    match backend.revoke(credential).await {
        Ok(()) => debug!("Credential revoked"),
        Err(e) => warn!(error = %e, "Failed to revoke credential"),
    }
}
