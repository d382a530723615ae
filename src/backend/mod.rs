//! Backend collaborator contract.
//!
//! The hosted identity + data service is consumed through the
//! [`AuthBackend`] trait so the controller and monitor stay testable
//! without a network. [`http::HttpBackend`] is the production
//! implementation.

pub mod http;
#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::BackendError;
use crate::session::{Organization, Profile, Role, Session, User};

/// What happened on the backend's auth event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEventKind {
    SignedIn,
    SignedOut,
    TokenRefreshed,
}

/// An entry on the backend's auth event stream. `session` is present for
/// `SignedIn` and `TokenRefreshed`, absent for `SignedOut`.
#[derive(Debug, Clone)]
pub struct AuthEvent {
    pub kind: AuthEventKind,
    pub session: Option<Session>,
}

/// Which verification flow a one-time code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OtpType {
    Signup,
    Email,
    Sms,
}

impl OtpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OtpType::Signup => "signup",
            OtpType::Email => "email",
            OtpType::Sms => "sms",
        }
    }
}

/// Result of a sign-up request. `session` is present iff email
/// confirmation is disabled org-wide; otherwise the caller must route the
/// user to OTP entry.
#[derive(Debug, Clone)]
pub struct SignUpResult {
    pub user: User,
    pub session: Option<Session>,
}

/// Payload for the one-shot provisioning edge function invoked after the
/// first successful sign-up or verification.
#[derive(Debug, Clone, Serialize)]
pub struct NewUserSetup {
    pub user_id: Uuid,
    pub email: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<Uuid>,
}

impl NewUserSetup {
    /// New accounts always start as plain members; staff roles are granted
    /// later by an owner or manager.
    pub fn member(user_id: Uuid, email: String, organization_id: Option<Uuid>) -> Self {
        Self {
            user_id,
            email,
            role: Role::Member,
            organization_id,
        }
    }
}

/// The hosted backend: password/OTP/OAuth auth, session retrieval, an auth
/// event stream, tenant table reads, and the provisioning function.
///
/// Implementations own the credential cache; callers never see raw tokens
/// outside of [`Session`].
#[async_trait]
pub trait AuthBackend: Send + Sync + 'static {
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, BackendError>;

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        organization_id: Option<Uuid>,
    ) -> Result<SignUpResult, BackendError>;

    async fn verify_otp(
        &self,
        email: &str,
        token: &str,
        otp_type: OtpType,
    ) -> Result<Session, BackendError>;

    async fn resend_otp(&self, email: &str, otp_type: OtpType) -> Result<(), BackendError>;

    /// Redirect-based OAuth: returns the URL the shell should navigate to.
    /// No session is issued synchronously.
    async fn sign_in_with_oauth(
        &self,
        provider: &str,
        scopes: Option<&str>,
    ) -> Result<String, BackendError>;

    async fn reset_password_for_email(&self, email: &str) -> Result<(), BackendError>;

    /// Current session, refreshed transparently if the cached one expired.
    /// `Ok(None)` means signed out.
    async fn get_session(&self) -> Result<Option<Session>, BackendError>;

    async fn sign_out(&self) -> Result<(), BackendError>;

    /// Single-row read of the `profiles` table by user id.
    async fn fetch_profile(&self, user_id: Uuid) -> Result<Profile, BackendError>;

    /// Single-row read of the `organizations` table.
    async fn fetch_organization(&self, org_id: Uuid) -> Result<Organization, BackendError>;

    /// Invoke the `setup-new-user` edge function. Idempotent on the backend
    /// side.
    async fn setup_new_user(&self, setup: &NewUserSetup) -> Result<(), BackendError>;

    /// Subscribe to the auth event stream. Each subscriber gets every event
    /// from the point of subscription.
    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;
}
