//! The credential store: single owner of the raw credential, its claims and
//! the capability cache derived from them.
//!
//! Reads are served from memory; the durable backend is consulted once per
//! process. Writes go through to the backend and replace credential, claims
//! and capabilities under one lock, so no reader observes a mix of old and
//! new values. Storage faults degrade to an anonymous session and are logged.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};

use super::backend::{MemoryBackend, StorageBackend};
use super::capability::{CapabilityCache, CapabilityRecord};
use super::claims::{ClaimSet, Credential};

const CREDENTIAL_KEY: &str = "credential";
const CLAIMS_KEY: &str = "claims";
const CAPABILITIES_KEY: &str = "capabilities";

#[derive(Default)]
struct StoreState {
    loaded: bool,
    credential: Option<Credential>,
    capabilities: CapabilityCache,
}

pub struct CredentialStore {
    backend: Box<dyn StorageBackend>,
    state: RwLock<StoreState>,
}

impl CredentialStore {
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            backend,
            state: RwLock::new(StoreState::default()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryBackend::new()))
    }

    /// Current credential, if any.
    pub fn get(&self) -> Option<Credential> {
        self.read_loaded().credential.clone()
    }

    /// Replace the stored credential. Claims and capabilities are rebuilt
    /// from it before the lock is released.
    pub(crate) fn set(&self, credential: Credential) {
        let mut state = self.write_state();
        let capabilities = CapabilityCache::from_claims(credential.claims());
        self.persist(&credential, &capabilities);

        state.credential = Some(credential);
        state.capabilities = capabilities;
        state.loaded = true;
    }

    /// Remove the credential and everything derived from it. Idempotent.
    pub(crate) fn clear(&self) {
        let mut state = self.write_state();
        for key in [CREDENTIAL_KEY, CLAIMS_KEY, CAPABILITIES_KEY] {
            if let Err(e) = self.backend.remove(key) {
                warn!(error = %e, key, "Failed to remove stored session value");
            }
        }
        state.credential = None;
        state.capabilities.clear();
        state.loaded = true;
    }

    /// Overlay capability records from a supplementary fetch.
    ///
    /// Ignored unless `token` is still the stored credential, so a slow fetch
    /// cannot attach its records to a credential issued after it started.
    pub(crate) fn apply_capabilities(&self, token: &str, records: Vec<CapabilityRecord>) -> bool {
        let mut state = self.write_state();
        let current = state.credential.as_ref().map(Credential::token);
        if current != Some(token) {
            debug!("Discarding capability records for a replaced credential");
            return false;
        }
        state.capabilities.merge(records);
        match serde_json::to_string(&state.capabilities.records()) {
            Ok(blob) => {
                if let Err(e) = self.backend.write(CAPABILITIES_KEY, &blob) {
                    warn!(error = %e, "Failed to persist capabilities");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize capabilities"),
        }
        true
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.read_loaded().capabilities.has(name)
    }

    pub fn has_all<S: AsRef<str>>(&self, names: &[S]) -> bool {
        self.read_loaded().capabilities.has_all(names)
    }

    pub fn has_any<S: AsRef<str>>(&self, names: &[S]) -> bool {
        self.read_loaded().capabilities.has_any(names)
    }

    /// Snapshot of the capability cache.
    pub fn capabilities(&self) -> CapabilityCache {
        self.read_loaded().capabilities.clone()
    }

    // ===== Internals =====

    fn read_state(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read guard over state that has been hydrated from the backend.
    fn read_loaded(&self) -> RwLockReadGuard<'_, StoreState> {
        {
            let state = self.read_state();
            if state.loaded {
                return state;
            }
        }
        {
            let mut state = self.write_state();
            if !state.loaded {
                self.hydrate(&mut state);
            }
        }
        self.read_state()
    }

    fn hydrate(&self, state: &mut StoreState) {
        state.loaded = true;

        let token = match self.backend.read(CREDENTIAL_KEY) {
            Ok(Some(token)) if !token.is_empty() => token,
            Ok(_) => return,
            Err(e) => {
                warn!(error = %e, "Failed to read stored credential, continuing anonymous");
                return;
            }
        };

        let claims = self
            .read_json::<ClaimSet>(CLAIMS_KEY)
            .unwrap_or_else(|| Credential::new(token.as_str()).claims().clone());
        let capabilities = self
            .read_json::<Vec<CapabilityRecord>>(CAPABILITIES_KEY)
            .map(CapabilityCache::from_records)
            .unwrap_or_else(|| CapabilityCache::from_claims(&claims));

        debug!(subject = ?claims.subject, "Restored stored credential");
        state.credential = Some(Credential::from_parts(token, claims));
        state.capabilities = capabilities;
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.backend.read(key) {
            Ok(Some(blob)) => match serde_json::from_str(&blob) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(error = %e, key, "Discarding unparsable stored session value");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, key, "Failed to read stored session value");
                None
            }
        }
    }

    /// Derived values are removed before the raw credential is written and
    /// re-written after it, so an interrupted write leaves them absent (and
    /// rebuilt on load) rather than stale.
    fn persist(&self, credential: &Credential, capabilities: &CapabilityCache) {
        let result = (|| -> anyhow::Result<()> {
            self.backend.remove(CLAIMS_KEY)?;
            self.backend.remove(CAPABILITIES_KEY)?;
            self.backend.write(CREDENTIAL_KEY, credential.token())?;
            self.backend
                .write(CLAIMS_KEY, &serde_json::to_string(credential.claims())?)?;
            self.backend
                .write(CAPABILITIES_KEY, &serde_json::to_string(&capabilities.records())?)?;
            Ok(())
        })();

        if let Err(e) = result {
            warn!(error = %e, "Failed to persist credential, keeping it for this process only");
        }
    }
}
