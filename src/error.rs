//! Unified error taxonomy for backend calls.
//!
//! Every fallible operation against the hosted backend returns a
//! [`BackendError`]. Transient infrastructure failures are an explicit,
//! enumerated subset (`is_transient`) so retry decisions never depend on
//! matching substrings in error messages.

use serde::{Deserialize, Serialize};

/// Error returned by backend operations (auth calls, table reads, edge
/// functions).
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Wrong email/password combination, or the account is otherwise not
    /// signable (shown inline by callers).
    #[error("invalid login credentials")]
    InvalidCredentials,

    /// The account exists but the email address has not been verified yet.
    #[error("email not confirmed")]
    EmailNotConfirmed,

    /// One-time code is wrong, already used, or expired.
    #[error("invalid or expired one-time code")]
    OtpInvalid,

    /// Sign-up attempted with an email that already has an account.
    #[error("user already registered")]
    UserAlreadyRegistered,

    /// The backend is rate limiting this client.
    #[error("too many requests")]
    RateLimited,

    /// Expected row (profile, organization) does not exist.
    #[error("record not found")]
    NotFound,

    /// The backend reported a stale pooled connection. Retryable.
    #[error("stale database connection")]
    StaleConnection,

    /// Transport-level failure (DNS, connection reset, TLS). Retryable.
    #[error("network error: {0}")]
    Network(String),

    /// The request timed out. Retryable.
    #[error("request timed out")]
    Timeout,

    /// Backend returned an error we recognize structurally but not by code.
    #[error("backend error {code}: {message}")]
    Api { code: String, message: String },

    /// Anything unexpected on our side (serialization, invariants).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BackendError {
    /// Machine-readable code for logging and UI branching.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::EmailNotConfirmed => "email_not_confirmed",
            Self::OtpInvalid => "otp_invalid",
            Self::UserAlreadyRegistered => "user_already_registered",
            Self::RateLimited => "rate_limited",
            Self::NotFound => "not_found",
            Self::StaleConnection => "stale_connection",
            Self::Network(_) => "network_error",
            Self::Timeout => "timeout",
            Self::Api { .. } => "api_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether a retry with backoff is worthwhile. This is the only place
    /// that decides transience; callers never inspect messages.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StaleConnection | Self::Network(_) | Self::Timeout
        )
    }

    /// Credential-class errors are shown inline next to the form that
    /// produced them and never mutate session state.
    pub fn is_credential(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredentials
                | Self::EmailNotConfirmed
                | Self::OtpInvalid
                | Self::UserAlreadyRegistered
        )
    }
}

/// Cloneable error surfaced in [`crate::session::AuthState`] when a profile
/// fetch fails fatally (after retries, or a non-transient error).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileError {
    /// Machine-readable code (matches [`BackendError::kind`]).
    pub code: String,
    /// Human-readable message for the persistent error banner.
    pub message: String,
}

impl From<&BackendError> for ProfileError {
    fn from(err: &BackendError) -> Self {
        Self {
            code: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for ProfileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}
