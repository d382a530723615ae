//! Session data model and the lifecycle controller.
//!
//! The dependency chain is strict: User → Profile → Organization. A profile
//! is only fetched for the currently authenticated user, and an organization
//! only once that profile's organization id is known. Sign-out clears the
//! whole chain atomically.

pub mod controller;
mod state;

pub use controller::{
    ControllerHandle, RefreshOutcome, SessionController, SignUpOutcome,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProfileError;

/// Backend-issued identity. Immutable from the client's perspective except
/// through re-authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub email_verified: bool,
}

/// Credential bundle issued by the backend. Embedding the [`User`] makes
/// "a session always has an identity" structural rather than a runtime
/// invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub user: User,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Role of a member within their organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Manager,
    Staff,
    Trainer,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Manager => "manager",
            Role::Staff => "staff",
            Role::Trainer => "trainer",
            Role::Member => "member",
        }
    }

    /// Staff-side roles see the management dashboard; members see the
    /// member portal.
    pub fn is_staff(&self) -> bool {
        !matches!(self, Role::Member)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tenant-scoped application record keyed by the user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Same value as the owning [`User::id`].
    pub id: Uuid,
    pub organization_id: Uuid,
    pub location_id: Option<Uuid>,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub email: String,
    pub phone: Option<String>,
    /// Front-desk check-in barcode, if one has been issued.
    pub barcode: Option<String>,
}

impl Profile {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Tenant record with branding used by the shell UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub primary_color: String,
    pub secondary_color: Option<String>,
    pub logo_url: Option<String>,
}

/// Consolidated, immutable snapshot exposed to the rest of the application.
///
/// Only the [`SessionController`] writes this; everything else reads
/// snapshots. `loading` governs presentational blocking while the initial
/// probe or a profile fetch is outstanding.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthState {
    pub user: Option<User>,
    pub profile: Option<Profile>,
    pub organization: Option<Organization>,
    pub session: Option<Session>,
    pub loading: bool,
    pub profile_error: Option<ProfileError>,
}

impl AuthState {
    /// State before the initial session probe has resolved.
    pub fn initial() -> Self {
        Self {
            user: None,
            profile: None,
            organization: None,
            session: None,
            loading: true,
            profile_error: None,
        }
    }

    /// Fully signed-out state.
    pub fn signed_out() -> Self {
        Self {
            loading: false,
            ..Self::initial()
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn user() -> User {
        User {
            id: Uuid::new_v4(),
            email: "jordan@repclub.fit".into(),
            email_verified: true,
        }
    }

    #[test]
    fn test_session_expiry() {
        let live = Session {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            expires_at: Utc::now() + Duration::hours(1),
            user: user(),
        };
        assert!(!live.is_expired());

        let stale = Session {
            expires_at: Utc::now() - Duration::seconds(1),
            ..live
        };
        assert!(stale.is_expired());
    }

    #[test]
    fn test_role_serde_roundtrip() {
        let json = serde_json::to_string(&Role::Trainer).unwrap();
        assert_eq!(json, "\"trainer\"");
        let role: Role = serde_json::from_str("\"owner\"").unwrap();
        assert_eq!(role, Role::Owner);
    }

    #[test]
    fn test_staff_roles() {
        assert!(Role::Owner.is_staff());
        assert!(Role::Trainer.is_staff());
        assert!(!Role::Member.is_staff());
    }

    #[test]
    fn test_initial_state_is_loading_and_unauthenticated() {
        let state = AuthState::initial();
        assert!(state.loading);
        assert!(!state.is_authenticated());
        assert!(state.profile_error.is_none());

        let signed_out = AuthState::signed_out();
        assert!(!signed_out.loading);
        assert!(!signed_out.is_authenticated());
    }
}
