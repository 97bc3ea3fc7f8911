//! Credential lifecycle: storage, claims, expiry and refresh.
//!
//! This module provides:
//! - `CredentialStore`: the single owner of the stored credential and its capabilities
//! - `RefreshCoordinator`: single-flight refresh shared by every caller
//! - `TerminationHook`: fan-out of session termination and lifecycle events
//!
//! Claims are decoded locally for expiry and authority checks only. Tokens are
//! never verified here; the server remains the authority.

pub mod backend;
pub mod capability;
pub mod claims;
pub mod coordinator;
pub mod credentials;
pub mod expiry;
pub mod session;

pub use backend::{FileBackend, KeyringBackend, MemoryBackend, StorageBackend};
pub use capability::{CapabilityCache, CapabilityRecord};
pub use claims::{ClaimSet, ClaimsError, Credential};
pub use coordinator::RefreshCoordinator;
pub use credentials::CredentialStore;
pub use expiry::Freshness;
pub use session::{SessionEvent, SessionState, TerminationHook, TerminationReason};
