//! Fakes and token builders shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};

use crate::api::{ApiError, ApiRequest, ApiResponse, AuthBackend, Dispatch, LoginRequest};
use crate::auth::{CapabilityRecord, Credential, StorageBackend};

pub(crate) const VALID_PASSWORD: &str = "correct-horse";

static TOKEN_SEQ: AtomicU64 = AtomicU64::new(0);

/// JWT-shaped token with the given payload and a dummy signature.
pub(crate) fn encode_token(payload: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{}.{}.signature", header, body)
}

/// Token for `subject` expiring `expires_in` seconds from now (negative for
/// already expired). Every call yields a distinct token.
pub(crate) fn make_token(subject: &str, expires_in: i64, authorities: &[&str]) -> String {
    let now = Utc::now().timestamp();
    encode_token(&json!({
        "sub": subject,
        "iat": now,
        "exp": now + expires_in,
        "authorities": authorities,
        "jti": TOKEN_SEQ.fetch_add(1, Ordering::Relaxed),
    }))
}

/// Backend whose every operation fails.
pub(crate) struct FailingBackend;

impl StorageBackend for FailingBackend {
    fn read(&self, _key: &str) -> anyhow::Result<Option<String>> {
        anyhow::bail!("storage unavailable")
    }
    fn write(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
        anyhow::bail!("storage unavailable")
    }
    fn remove(&self, _key: &str) -> anyhow::Result<()> {
        anyhow::bail!("storage unavailable")
    }
}

enum RefreshMode {
    Issue(i64),
    Fail(u16),
    Hang,
}

/// Identity provider fake that counts calls.
pub(crate) struct FakeAuth {
    mode: RefreshMode,
    delay: Duration,
    authorities: Vec<String>,
    capabilities: Option<Vec<CapabilityRecord>>,
    refresh_calls: AtomicUsize,
    revoke_calls: AtomicUsize,
}

impl FakeAuth {
    fn with_mode(mode: RefreshMode) -> Self {
        Self {
            mode,
            delay: Duration::ZERO,
            authorities: Vec::new(),
            capabilities: None,
            refresh_calls: AtomicUsize::new(0),
            revoke_calls: AtomicUsize::new(0),
        }
    }

    /// Refreshes succeed with tokens valid for `expires_in` seconds.
    pub(crate) fn issuing(expires_in: i64) -> Self {
        Self::with_mode(RefreshMode::Issue(expires_in))
    }

    /// Refreshes fail with the given HTTP status.
    pub(crate) fn failing(status: u16) -> Self {
        Self::with_mode(RefreshMode::Fail(status))
    }

    /// Refreshes never complete.
    pub(crate) fn hanging() -> Self {
        Self::with_mode(RefreshMode::Hang)
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn with_authorities(mut self, authorities: &[&str]) -> Self {
        self.authorities = authorities.iter().map(|s| s.to_string()).collect();
        self
    }

    pub(crate) fn with_capabilities(mut self, records: Vec<CapabilityRecord>) -> Self {
        self.capabilities = Some(records);
        self
    }

    pub(crate) fn refresh_count(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn revoke_count(&self) -> usize {
        self.revoke_calls.load(Ordering::SeqCst)
    }

    fn issue(&self, subject: &str, expires_in: i64) -> String {
        let authorities: Vec<&str> = self.authorities.iter().map(String::as_str).collect();
        make_token(subject, expires_in, &authorities)
    }
}

impl AuthBackend for FakeAuth {
    fn login<'a>(&'a self, material: &'a LoginRequest) -> BoxFuture<'a, Result<String, ApiError>> {
        async move {
            if material.password == VALID_PASSWORD {
                Ok(self.issue(&material.username, 3600))
            } else {
                Err(ApiError::Unauthorized)
            }
        }
        .boxed()
    }

    fn refresh<'a>(&'a self, current: &'a Credential) -> BoxFuture<'a, Result<String, ApiError>> {
        async move {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.mode {
                RefreshMode::Issue(expires_in) => {
                    Ok(self.issue(current.subject().unwrap_or("unknown"), expires_in))
                }
                RefreshMode::Fail(status) => Err(ApiError::from_status(status, "refresh refused")),
                RefreshMode::Hang => futures::future::pending().await,
            }
        }
        .boxed()
    }

    fn revoke<'a>(&'a self, _current: &'a Credential) -> BoxFuture<'a, Result<(), ApiError>> {
        async move {
            self.revoke_calls.fetch_add(1, Ordering::SeqCst);
            Err(ApiError::ServerError("revoke endpoint down".into()))
        }
        .boxed()
    }

    fn fetch_capabilities<'a>(
        &'a self,
        _current: &'a Credential,
    ) -> BoxFuture<'a, Result<Option<Vec<CapabilityRecord>>, ApiError>> {
        futures::future::ready(Ok(self.capabilities.clone())).boxed()
    }
}

/// Dispatcher fake replaying scripted outcomes, then answering 200.
pub(crate) struct FakeDispatch {
    script: Mutex<VecDeque<Result<ApiResponse, ApiError>>>,
    sent: Mutex<Vec<ApiRequest>>,
}

impl FakeDispatch {
    pub(crate) fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Respond with these statuses in order.
    pub(crate) fn statuses(statuses: &[u16]) -> Self {
        let fake = Self::new();
        for status in statuses {
            fake.push(Ok(ApiResponse::new(*status, r#"{"ok": true}"#)));
        }
        fake
    }

    pub(crate) fn push(&self, outcome: Result<ApiResponse, ApiError>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(outcome);
        }
    }

    pub(crate) fn sent(&self) -> Vec<ApiRequest> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Dispatch for FakeDispatch {
    fn dispatch(&self, request: ApiRequest) -> BoxFuture<'_, Result<ApiResponse, ApiError>> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(request);
        }
        let outcome = self
            .script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| Ok(ApiResponse::new(200, r#"{"ok": true}"#)));
        futures::future::ready(outcome).boxed()
    }
}
