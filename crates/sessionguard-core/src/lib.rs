//! Session and credential lifecycle management.
//!
//! A [`SessionManager`] owns one credential store, one refresh coordinator and
//! one request pipeline. Every authorized request goes through the pipeline,
//! which keeps the credential fresh and refreshes at most once per 401.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod manager;

#[cfg(test)]
mod test_support;

pub use api::{ApiClient, ApiError, ApiRequest, ApiResponse, AuthBackend, Dispatch, LoginRequest};
pub use auth::{
    CapabilityRecord, Credential, SessionEvent, SessionState, StorageBackend, TerminationReason,
};
pub use config::{SessionConfig, StorageKind};
pub use error::SessionError;
pub use manager::SessionManager;
