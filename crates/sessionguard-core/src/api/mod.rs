//! HTTP side of the session layer.
//!
//! This module provides:
//! - `ApiClient`: reqwest client for the identity provider and business calls
//! - `RequestPipeline`: attaches credentials, refreshes once on 401, retries once
//! - `Dispatch` / `AuthBackend`: the seams the pipeline and coordinator talk through
//!
//! Credentials travel as `Authorization: Bearer <token>` headers.

pub mod client;
pub mod error;
pub mod pipeline;
pub mod request;

pub use client::{ApiClient, AuthEndpoints};
pub use error::ApiError;
pub use pipeline::RequestPipeline;
pub use request::{ApiRequest, ApiResponse, AuthBackend, Dispatch, LoginRequest};
