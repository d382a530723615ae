//! Scripted in-memory backend for controller and monitor tests.
//!
//! Responses are queued per operation; an unscripted call falls back to a
//! sensible default (profile map lookup, cached session) or an internal
//! error, so tests fail loudly when they forget to script a step.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use uuid::Uuid;

use crate::error::BackendError;
use crate::session::{Organization, Profile, Role, Session, User};

use super::{AuthBackend, AuthEvent, AuthEventKind, NewUserSetup, OtpType, SignUpResult};

type Scripted<T> = Mutex<VecDeque<Result<T, BackendError>>>;

#[derive(Default)]
pub(crate) struct MockBackend {
    pub profiles: Mutex<HashMap<Uuid, Profile>>,
    pub organizations: Mutex<HashMap<Uuid, Organization>>,

    pub sign_in_results: Scripted<Session>,
    pub sign_up_results: Scripted<SignUpResult>,
    pub verify_results: Scripted<Session>,
    pub profile_results: Scripted<Profile>,
    pub session_results: Scripted<Option<Session>>,
    pub setup_results: Scripted<()>,

    pub profile_fetch_count: AtomicUsize,
    pub sign_out_count: AtomicUsize,
    pub session_probe_count: AtomicUsize,
    pub setup_calls: Mutex<Vec<NewUserSetup>>,

    /// Gates popped one per `fetch_profile` call; a present gate blocks the
    /// fetch until the test fires it.
    pub profile_gates: Mutex<VecDeque<Arc<Notify>>>,

    pub current_session: Mutex<Option<Session>>,
    events: Mutex<Option<broadcast::Sender<AuthEvent>>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        let backend = Self::default();
        let (tx, _) = broadcast::channel(64);
        *backend.events.lock() = Some(tx);
        Arc::new(backend)
    }

    fn sender(&self) -> broadcast::Sender<AuthEvent> {
        self.events.lock().as_ref().expect("sender set in new").clone()
    }

    pub fn emit(&self, kind: AuthEventKind, session: Option<Session>) {
        let _ = self.sender().send(AuthEvent { kind, session });
    }

    /// Queue a gate for the next unserved `fetch_profile` call and return
    /// the handle the test fires to release it.
    pub fn gate_next_profile_fetch(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.profile_gates.lock().push_back(gate.clone());
        gate
    }

    pub fn script_profile(&self, result: Result<Profile, BackendError>) {
        self.profile_results.lock().push_back(result);
    }

    pub fn script_session(&self, result: Result<Option<Session>, BackendError>) {
        self.session_results.lock().push_back(result);
    }

    pub fn insert_profile(&self, profile: Profile) {
        self.profiles.lock().insert(profile.id, profile);
    }

    pub fn insert_organization(&self, org: Organization) {
        self.organizations.lock().insert(org.id, org);
    }
}

fn unscripted(op: &str) -> BackendError {
    BackendError::Internal(anyhow::anyhow!("unscripted mock call: {op}"))
}

#[async_trait]
impl AuthBackend for MockBackend {
    async fn sign_in_with_password(
        &self,
        _email: &str,
        _password: &str,
    ) -> Result<Session, BackendError> {
        let result = self
            .sign_in_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(unscripted("sign_in_with_password")));
        if let Ok(session) = &result {
            *self.current_session.lock() = Some(session.clone());
            self.emit(AuthEventKind::SignedIn, Some(session.clone()));
        }
        result
    }

    async fn sign_up(
        &self,
        _email: &str,
        _password: &str,
        _organization_id: Option<Uuid>,
    ) -> Result<SignUpResult, BackendError> {
        let result = self
            .sign_up_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(unscripted("sign_up")));
        if let Ok(SignUpResult {
            session: Some(session),
            ..
        }) = &result
        {
            *self.current_session.lock() = Some(session.clone());
            self.emit(AuthEventKind::SignedIn, Some(session.clone()));
        }
        result
    }

    async fn verify_otp(
        &self,
        _email: &str,
        _token: &str,
        _otp_type: OtpType,
    ) -> Result<Session, BackendError> {
        let result = self
            .verify_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(unscripted("verify_otp")));
        if let Ok(session) = &result {
            *self.current_session.lock() = Some(session.clone());
            self.emit(AuthEventKind::SignedIn, Some(session.clone()));
        }
        result
    }

    async fn resend_otp(&self, _email: &str, _otp_type: OtpType) -> Result<(), BackendError> {
        Ok(())
    }

    async fn sign_in_with_oauth(
        &self,
        provider: &str,
        _scopes: Option<&str>,
    ) -> Result<String, BackendError> {
        Ok(format!("https://mock.test/authorize?provider={provider}"))
    }

    async fn reset_password_for_email(&self, _email: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<Session>, BackendError> {
        self.session_probe_count.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.session_results.lock().pop_front() {
            return result;
        }
        Ok(self.current_session.lock().clone())
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        self.sign_out_count.fetch_add(1, Ordering::SeqCst);
        *self.current_session.lock() = None;
        self.emit(AuthEventKind::SignedOut, None);
        Ok(())
    }

    async fn fetch_profile(&self, user_id: Uuid) -> Result<Profile, BackendError> {
        let gate = self.profile_gates.lock().pop_front();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.profile_fetch_count.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.profile_results.lock().pop_front() {
            return result;
        }
        self.profiles
            .lock()
            .get(&user_id)
            .cloned()
            .ok_or(BackendError::NotFound)
    }

    async fn fetch_organization(&self, org_id: Uuid) -> Result<Organization, BackendError> {
        self.organizations
            .lock()
            .get(&org_id)
            .cloned()
            .ok_or(BackendError::NotFound)
    }

    async fn setup_new_user(&self, setup: &NewUserSetup) -> Result<(), BackendError> {
        self.setup_calls.lock().push(setup.clone());
        self.setup_results.lock().pop_front().unwrap_or(Ok(()))
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.sender().subscribe()
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────────

pub(crate) fn test_user(tag: u8) -> User {
    User {
        id: Uuid::from_u128(u128::from(tag)),
        email: format!("user{tag}@repclub.fit"),
        email_verified: true,
    }
}

pub(crate) fn test_session(user: &User) -> Session {
    Session {
        access_token: format!("at-{}", user.id),
        refresh_token: format!("rt-{}", user.id),
        expires_at: Utc::now() + Duration::hours(1),
        user: user.clone(),
    }
}

pub(crate) fn test_org_id() -> Uuid {
    Uuid::from_u128(0xfeed)
}

pub(crate) fn test_profile(user: &User) -> Profile {
    Profile {
        id: user.id,
        organization_id: test_org_id(),
        location_id: None,
        first_name: "Test".into(),
        last_name: format!("User{}", user.id.as_u128()),
        role: Role::Member,
        email: user.email.clone(),
        phone: None,
        barcode: None,
    }
}

pub(crate) fn test_organization() -> Organization {
    Organization {
        id: test_org_id(),
        name: "Rep Club".into(),
        slug: "rep-club".into(),
        primary_color: "#1a1a2e".into(),
        secondary_color: Some("#e94560".into()),
        logo_url: None,
    }
}
