//! Session lifecycle controller.
//!
//! Owns the four state slots (user, profile, organization, session) and is
//! their only writer. Backend auth events are bridged onto an internal
//! queue and consumed on the next scheduler tick, so nothing runs fetch
//! work inside the backend client's own callback.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{AuthBackend, AuthEvent, AuthEventKind, NewUserSetup, OtpType};
use crate::config::RetryConfig;
use crate::error::{BackendError, ProfileError};
use crate::session::state::FetchState;
use crate::session::{AuthState, User};

/// Distinguishable outcomes of a successful `sign_up` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignUpOutcome {
    /// No session yet; the caller must route the user to OTP entry.
    VerificationRequired,
    /// Email confirmation is disabled and a session was issued immediately.
    SignedIn,
}

/// What `refresh_profile` actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A fetch ran (and has completed, successfully or not).
    Refetched,
    /// A fetch for the same user was already in flight; nothing started.
    AlreadyInFlight,
    /// Nobody is signed in.
    NoUser,
}

enum ControllerMsg {
    AuthEvent(AuthEvent),
}

/// Disposer returned by [`SessionController::start`]. Dropping it (or
/// calling [`stop`](Self::stop)) ends the event loop.
pub struct ControllerHandle {
    bridge: JoinHandle<()>,
    worker: JoinHandle<()>,
}

impl ControllerHandle {
    pub fn stop(self) {
        self.bridge.abort();
        self.worker.abort();
    }
}

impl Drop for ControllerHandle {
    fn drop(&mut self) {
        self.bridge.abort();
        self.worker.abort();
    }
}

#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn AuthBackend>,
    state: ArcSwap<AuthState>,
    /// Serializes every snapshot read-modify-write. The `ArcSwap` alone
    /// only makes loads cheap; without this lock two writers could
    /// interleave load/store and one would resurrect the other's
    /// overwritten snapshot.
    state_lock: Mutex<()>,
    fetch: Mutex<FetchState>,
    changed: watch::Sender<()>,
    retry: RetryConfig,
}

impl SessionController {
    pub fn new(backend: Arc<dyn AuthBackend>, retry: RetryConfig) -> Self {
        let (changed, _) = watch::channel(());
        Self {
            inner: Arc::new(Inner {
                backend,
                state: ArcSwap::from_pointee(AuthState::initial()),
                state_lock: Mutex::new(()),
                fetch: Mutex::new(FetchState::Idle),
                changed,
                retry,
            }),
        }
    }

    /// Current consolidated snapshot.
    pub fn state(&self) -> Arc<AuthState> {
        self.inner.state.load_full()
    }

    /// Receiver that resolves whenever the snapshot changes.
    pub fn subscribe_changes(&self) -> watch::Receiver<()> {
        self.inner.changed.subscribe()
    }

    /// Subscribe to the controller's backend event stream (the monitor
    /// shares the same stream).
    pub fn subscribe_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.backend.subscribe()
    }

    /// Run the initial session probe and start consuming the backend's auth
    /// event stream. Called exactly once by the application's composition
    /// root; the returned handle is the disposer.
    pub fn start(&self) -> ControllerHandle {
        let mut events = self.inner.backend.subscribe();
        let (tx, mut rx) = mpsc::unbounded_channel::<ControllerMsg>();

        // Bridge: re-enqueue stream events so fetch work never runs inside
        // the backend client's callback path.
        let bridge = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if tx.send(ControllerMsg::AuthEvent(event)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Auth event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let inner = self.inner.clone();
        let worker = tokio::spawn(async move {
            inner.initial_probe().await;
            while let Some(ControllerMsg::AuthEvent(event)) = rx.recv().await {
                inner.handle_event(event);
            }
        });

        ControllerHandle { bridge, worker }
    }

    /// Password sign-in. On failure the prior state is untouched; on
    /// success the auth event stream populates profile and organization
    /// (this call does not fetch them itself, avoiding duplicate fetches).
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<(), BackendError> {
        match self.inner.backend.sign_in_with_password(email, password).await {
            Ok(session) => {
                info!(user_id = %session.user.id, "Signed in");
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "Sign-in failed");
                Err(e)
            }
        }
    }

    /// Account creation. When a session is issued immediately (email
    /// confirmation disabled), the new-user provisioning side effect runs
    /// here; its failure never fails the sign-up, since the user already
    /// holds a valid credential.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        organization_id: Option<Uuid>,
    ) -> Result<SignUpOutcome, BackendError> {
        let result = self
            .inner
            .backend
            .sign_up(email, password, organization_id)
            .await?;

        match result.session {
            None => {
                info!(email, "Sign-up accepted, verification email sent");
                Ok(SignUpOutcome::VerificationRequired)
            }
            Some(_) => {
                info!(user_id = %result.user.id, "Sign-up issued immediate session");
                self.inner
                    .run_new_user_setup(&result.user, organization_id)
                    .await;
                Ok(SignUpOutcome::SignedIn)
            }
        }
    }

    /// Exchange a one-time code for a session. Provisioning is invoked on
    /// success; the backend side is idempotent, so re-running it after a
    /// sign-up that already provisioned is harmless.
    pub async fn verify_otp(
        &self,
        email: &str,
        token: &str,
        otp_type: OtpType,
    ) -> Result<(), BackendError> {
        let session = self.inner.backend.verify_otp(email, token, otp_type).await?;
        info!(user_id = %session.user.id, "OTP verified");
        self.inner.run_new_user_setup(&session.user, None).await;
        Ok(())
    }

    /// Request a fresh one-time code. Resend cooldown is a UI concern.
    pub async fn resend_otp(&self, email: &str, otp_type: OtpType) -> Result<(), BackendError> {
        self.inner.backend.resend_otp(email, otp_type).await
    }

    /// Redirect-based OAuth sign-in; returns the URL to navigate to.
    pub async fn sign_in_with_oauth(
        &self,
        provider: &str,
        scopes: Option<&str>,
    ) -> Result<String, BackendError> {
        self.inner.backend.sign_in_with_oauth(provider, scopes).await
    }

    /// Invalidate the backend session and clear all state slots. The clear
    /// happens even when the backend call fails: after this resolves, no
    /// stale user/profile/organization/session is observable, and any fetch
    /// still in flight will find its user gone and discard its result.
    pub async fn sign_out(&self) -> Result<(), BackendError> {
        let result = self.inner.backend.sign_out().await;
        self.inner.clear_all();
        if let Err(e) = &result {
            warn!(error = %e, "Backend sign-out failed; local state cleared anyway");
        } else {
            info!("Signed out");
        }
        result
    }

    /// Request a password-reset email. Always reports success so callers
    /// cannot be used to enumerate accounts.
    pub async fn reset_password(&self, email: &str) {
        if let Err(e) = self.inner.backend.reset_password_for_email(email).await {
            warn!(error = %e, "Password reset request failed (not surfaced)");
        }
    }

    /// Re-run the profile fetch for the current user, e.g. after an
    /// out-of-band profile mutation. A fetch already in flight for the same
    /// user makes this a no-op.
    pub async fn refresh_profile(&self) -> RefreshOutcome {
        let Some(user_id) = self.state().user.as_ref().map(|u| u.id) else {
            return RefreshOutcome::NoUser;
        };
        if self.inner.clone().fetch_profile(user_id).await {
            RefreshOutcome::Refetched
        } else {
            RefreshOutcome::AlreadyInFlight
        }
    }
}

impl Inner {
    fn update_state(&self, mutate: impl FnOnce(&mut AuthState)) {
        let _guard = self.state_lock.lock();
        let mut next = AuthState::clone(&self.state.load());
        mutate(&mut next);
        self.state.store(Arc::new(next));
        let _ = self.changed.send(());
    }

    /// Mutate the snapshot only if `user_id` is still the active user,
    /// atomically with the check. Returns `false` when a sign-out or a
    /// different sign-in won the race; the caller's result is stale and
    /// must be discarded.
    fn update_state_for(&self, user_id: Uuid, mutate: impl FnOnce(&mut AuthState)) -> bool {
        let _guard = self.state_lock.lock();
        let current = self.state.load();
        if current.user.as_ref().map(|u| u.id) != Some(user_id) {
            return false;
        }
        let mut next = AuthState::clone(&current);
        mutate(&mut next);
        self.state.store(Arc::new(next));
        let _ = self.changed.send(());
        true
    }

    fn clear_all(&self) {
        let _guard = self.state_lock.lock();
        *self.fetch.lock() = FetchState::Idle;
        self.state.store(Arc::new(AuthState::signed_out()));
        let _ = self.changed.send(());
    }

    /// Page-load probe: an existing session is restored (profile fetched
    /// before `loading` clears); otherwise `loading` clears immediately.
    async fn initial_probe(self: &Arc<Self>) {
        match self.backend.get_session().await {
            Ok(Some(session)) => {
                debug!(user_id = %session.user.id, "Restoring existing session");
                let user = session.user.clone();
                self.update_state(|s| {
                    s.user = Some(user.clone());
                    s.session = Some(session.clone());
                });
                self.clone().fetch_profile(user.id).await;
            }
            Ok(None) => {
                self.update_state(|s| s.loading = false);
            }
            Err(e) => {
                warn!(error = %e, "Initial session probe failed");
                self.update_state(|s| s.loading = false);
            }
        }
    }

    fn handle_event(self: &Arc<Self>, event: AuthEvent) {
        match (event.kind, event.session) {
            (AuthEventKind::SignedIn | AuthEventKind::TokenRefreshed, Some(session)) => {
                let user = session.user.clone();
                // user and session always move together
                self.update_state(|s| {
                    s.user = Some(user.clone());
                    s.session = Some(session.clone());
                });
                // fetch runs on its own task so the event loop keeps
                // draining (a sign-out must not wait behind retries)
                let inner = self.clone();
                tokio::spawn(async move {
                    inner.fetch_profile(user.id).await;
                });
            }
            (AuthEventKind::SignedOut, _) => {
                debug!("Sign-out event, clearing session state");
                self.clear_all();
            }
            (kind, None) => {
                warn!(?kind, "Auth event without session, ignoring");
            }
        }
    }

    async fn run_new_user_setup(&self, user: &User, organization_id: Option<Uuid>) {
        let setup = NewUserSetup::member(user.id, user.email.clone(), organization_id);
        match self.backend.setup_new_user(&setup).await {
            Ok(()) => info!(user_id = %user.id, "New user provisioned"),
            // swallowed: the user already holds a valid credential
            Err(e) => warn!(user_id = %user.id, error = %e, "New user provisioning failed"),
        }
    }

    /// The profile-fetch protocol. Returns `false` when a fetch for the
    /// same user was already in flight (nothing started).
    async fn fetch_profile(self: Arc<Self>, user_id: Uuid) -> bool {
        if !self.fetch.lock().begin(user_id) {
            debug!(%user_id, "Profile fetch already in flight, skipping");
            return false;
        }
        // a sign-out between begin() and here leaves nothing to fetch for
        if !self.update_state_for(user_id, |s| {
            s.loading = true;
            s.profile_error = None;
        }) {
            self.fetch.lock().abandon(user_id);
            return true;
        }

        let mut attempt: u32 = 1;
        let outcome = loop {
            self.fetch.lock().record_attempt(user_id, attempt);
            match self.backend.fetch_profile(user_id).await {
                Ok(profile) => break Ok(profile),
                Err(e) if e.is_transient() && attempt <= self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        %user_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient profile fetch failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => break Err(e),
            }
        };

        // anti-race: the active user may have changed while we were away.
        // `update_state_for` applies the result atomically with that check;
        // a stale result is discarded and the newer fetch (or the sign-out)
        // owns `loading` from here.
        match outcome {
            Ok(profile) => {
                let org_id = profile.organization_id;
                let applied = self.update_state_for(user_id, |s| {
                    s.profile = Some(profile);
                    s.profile_error = None;
                });
                if !applied {
                    debug!(%user_id, "Discarding profile fetch for stale user");
                    self.fetch.lock().abandon(user_id);
                    return true;
                }
                self.fetch.lock().settle(user_id, true);
                self.fetch_organization(user_id, org_id).await;
                self.update_state_for(user_id, |s| s.loading = false);
            }
            Err(e) => {
                let applied = self.update_state_for(user_id, |s| {
                    s.profile_error = Some(ProfileError::from(&e));
                    s.loading = false;
                });
                if !applied {
                    debug!(%user_id, "Discarding failed profile fetch for stale user");
                    self.fetch.lock().abandon(user_id);
                    return true;
                }
                error!(%user_id, attempts = attempt, error = %e, "Profile fetch failed");
                self.fetch.lock().settle(user_id, false);
            }
        }
        true
    }

    /// Organization fetch is strictly after the profile and non-fatal: a
    /// failure is logged, never surfaced as a profile error.
    async fn fetch_organization(&self, user_id: Uuid, org_id: Uuid) {
        match self.backend.fetch_organization(org_id).await {
            Ok(org) => {
                // same stale-user discard rule as the profile itself
                self.update_state_for(user_id, |s| s.organization = Some(org));
            }
            Err(e) => {
                warn!(%org_id, error = %e, "Organization fetch failed (non-fatal)");
            }
        }
    }
}
