use thiserror::Error;

use crate::api::ApiError;

/// Failures visible to callers of the session layer.
///
/// Malformed credentials and storage faults never appear here: they are
/// recovered locally (as an expired or anonymous session respectively).
#[derive(Error, Debug)]
pub enum SessionError {
    /// No usable session; the user has to sign in again.
    #[error("Session terminated - please sign in again")]
    SessionTerminated,

    #[error("Invalid username or password")]
    InvalidCredentials,

    /// A request was refused even after a refresh; carries the original failure.
    #[error("Request was not authorized: {0}")]
    AuthorizationFailure(ApiError),

    /// Failures unrelated to credentials, passed through unchanged.
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl SessionError {
    /// Whether the caller should route the user back to sign-in.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            SessionError::SessionTerminated | SessionError::AuthorizationFailure(_)
        )
    }
}
