//! Session health monitor.
//!
//! Purely observational: watches the backend's auth event stream, the
//! platform bridge, and a periodic session probe, and raises typed
//! advisory notices on a channel. It never writes session state; the one
//! mutation it can cause (sign-out) is delegated to the controller through
//! the wrapped [`SessionMonitor::sign_out`].

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::backend::{AuthBackend, AuthEvent, AuthEventKind};
use crate::config::MonitorConfig;
use crate::error::BackendError;
use crate::platform::{PlatformBridge, PlatformEvent};
use crate::session::SessionController;

/// How a notice should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Destructive,
}

/// Advisory notification raised by the monitor. The presentation layer
/// subscribes and renders; nothing here blocks or retries anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorNotice {
    /// A sign-out arrived that this client did not initiate (revoked
    /// remotely, expired, or signed out from another tab).
    UnexpectedSignOut,
    /// Consecutive session probes failed; the session may drop soon.
    SessionUnstable,
    /// Connectivity lost while signed in.
    NetworkOffline,
    /// Connectivity returned and the backend still honors the session.
    ConnectionRestored,
    /// Connectivity returned but the session is no longer honored.
    SessionExpired,
    /// The auth token disappeared from shared storage (another tab signed
    /// out).
    SignedOutElsewhere,
    /// An auth token appeared in shared storage (another tab signed in).
    SignedInElsewhere,
}

impl MonitorNotice {
    pub fn severity(&self) -> Severity {
        match self {
            Self::UnexpectedSignOut | Self::SessionExpired | Self::SignedOutElsewhere => {
                Severity::Destructive
            }
            Self::SessionUnstable | Self::NetworkOffline => Severity::Warning,
            Self::ConnectionRestored | Self::SignedInElsewhere => Severity::Info,
        }
    }

    /// Default user-facing copy; the presentation layer may localize.
    pub fn message(&self) -> &'static str {
        match self {
            Self::UnexpectedSignOut => "You were signed out. Please sign in again.",
            Self::SessionUnstable => {
                "We're having trouble keeping your session active. You may be signed out soon."
            }
            Self::NetworkOffline => "You're offline. Changes won't be saved until you reconnect.",
            Self::ConnectionRestored => "Connection restored.",
            Self::SessionExpired => "Your session expired while you were offline.",
            Self::SignedOutElsewhere => "You were signed out in another tab.",
            Self::SignedInElsewhere => "You signed in from another tab.",
        }
    }
}

/// Advisory state machine. Transitions only drive notices; no transition
/// blocks or retries the underlying request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Unknown,
    Authenticated,
    UnexpectedlySignedOut,
    NetworkDegraded,
    Expired,
}

/// Disposer for the monitor's watch loop.
pub struct MonitorHandle {
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Clone)]
pub struct SessionMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    backend: Arc<dyn AuthBackend>,
    controller: SessionController,
    config: MonitorConfig,
    notices: mpsc::UnboundedSender<MonitorNotice>,
    state: Mutex<MonitorState>,
    /// Set by the wrapped sign-out and consumed by the matching SignedOut
    /// event, so user-initiated sign-outs never read as unexpected.
    intentional_sign_out: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl SessionMonitor {
    pub fn new(
        backend: Arc<dyn AuthBackend>,
        controller: SessionController,
        config: MonitorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<MonitorNotice>) {
        let (notices, rx) = mpsc::unbounded_channel();
        let monitor = Self {
            inner: Arc::new(MonitorInner {
                backend,
                controller,
                config,
                notices,
                state: Mutex::new(MonitorState::Unknown),
                intentional_sign_out: AtomicBool::new(false),
                consecutive_failures: AtomicU32::new(0),
            }),
        };
        (monitor, rx)
    }

    pub fn state(&self) -> MonitorState {
        *self.inner.state.lock()
    }

    /// Start watching. Called once by the composition root, after
    /// subscribing the platform bridge's sources.
    pub fn start(&self, platform: &PlatformBridge) -> MonitorHandle {
        let auth_events = self.inner.backend.subscribe();
        let platform_events = platform.subscribe();
        let inner = self.inner.clone();
        let task = tokio::spawn(run(inner, auth_events, platform_events));
        MonitorHandle { task }
    }

    /// Intentional sign-out: flags the sign-out as user-initiated so the
    /// unexpected-sign-out detector does not fire, then delegates to the
    /// controller (the monitor itself never mutates session state).
    pub async fn sign_out(&self) -> Result<(), BackendError> {
        self.inner
            .intentional_sign_out
            .store(true, Ordering::SeqCst);
        // the flag is consumed by the SignedOut event the backend emits,
        // which happens even when the server-side call fails
        self.inner.controller.sign_out().await
    }
}

async fn run(
    inner: Arc<MonitorInner>,
    mut auth_events: broadcast::Receiver<AuthEvent>,
    mut platform_events: broadcast::Receiver<PlatformEvent>,
) {
    let period = inner.config.probe_interval();
    info!(
        probe_interval_secs = period.as_secs(),
        failure_threshold = inner.config.failure_threshold,
        "Session monitor started"
    );
    // first probe one full period out; startup is the controller's probe
    let mut probe = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            event = auth_events.recv() => match event {
                Ok(event) => inner.handle_auth_event(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Monitor lagged on auth events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = platform_events.recv() => match event {
                Ok(event) => inner.handle_platform_event(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Monitor lagged on platform events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = probe.tick() => inner.run_health_check().await,
        }
    }
}

impl MonitorInner {
    fn notify(&self, notice: MonitorNotice) {
        debug!(?notice, severity = ?notice.severity(), "Monitor notice");
        let _ = self.notices.send(notice);
    }

    fn handle_auth_event(&self, event: AuthEvent) {
        match event.kind {
            AuthEventKind::SignedIn => {
                *self.state.lock() = MonitorState::Authenticated;
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
            AuthEventKind::TokenRefreshed => {
                // a successful refresh proves the session is healthy
                self.consecutive_failures.store(0, Ordering::SeqCst);
                *self.state.lock() = MonitorState::Authenticated;
            }
            AuthEventKind::SignedOut => {
                if self.intentional_sign_out.swap(false, Ordering::SeqCst) {
                    debug!("Intentional sign-out observed");
                    *self.state.lock() = MonitorState::Unknown;
                    return;
                }
                let mut state = self.state.lock();
                match *state {
                    MonitorState::Authenticated | MonitorState::NetworkDegraded => {
                        *state = MonitorState::UnexpectedlySignedOut;
                        drop(state);
                        warn!("Unexpected sign-out detected");
                        self.notify(MonitorNotice::UnexpectedSignOut);
                    }
                    _ => *state = MonitorState::Unknown,
                }
            }
        }
    }

    async fn handle_platform_event(&self, event: PlatformEvent) {
        match event {
            PlatformEvent::NetworkOffline => {
                let mut state = self.state.lock();
                if *state == MonitorState::Authenticated {
                    *state = MonitorState::NetworkDegraded;
                    drop(state);
                    self.notify(MonitorNotice::NetworkOffline);
                }
            }
            PlatformEvent::NetworkOnline => {
                if *self.state.lock() != MonitorState::NetworkDegraded {
                    return;
                }
                match self.probe_session().await {
                    Ok(true) => {
                        *self.state.lock() = MonitorState::Authenticated;
                        self.notify(MonitorNotice::ConnectionRestored);
                    }
                    Ok(false) => {
                        *self.state.lock() = MonitorState::Expired;
                        self.notify(MonitorNotice::SessionExpired);
                    }
                    Err(e) => {
                        // can't tell yet; stay degraded until the next signal
                        warn!(error = %e, "Post-reconnect session probe failed");
                    }
                }
            }
            PlatformEvent::TokenRemoved => {
                if self.intentional_sign_out.load(Ordering::SeqCst) {
                    return;
                }
                let mut state = self.state.lock();
                if *state == MonitorState::Authenticated {
                    *state = MonitorState::UnexpectedlySignedOut;
                    drop(state);
                    self.notify(MonitorNotice::SignedOutElsewhere);
                }
            }
            PlatformEvent::TokenStored => {
                if *self.state.lock() == MonitorState::Authenticated {
                    return;
                }
                self.notify(MonitorNotice::SignedInElsewhere);
                // re-probe so this tab picks the new session up
                if let Ok(true) = self.probe_session().await {
                    *self.state.lock() = MonitorState::Authenticated;
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                }
            }
        }
    }

    /// Periodic health check: re-probe the backend for a valid session and
    /// count consecutive failures. Advisory only; never forces a logout.
    async fn run_health_check(&self) {
        if *self.state.lock() != MonitorState::Authenticated {
            return;
        }
        match self.probe_session().await {
            Ok(true) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
            Ok(false) | Err(_) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(failures, "Session health probe failed");
                if failures == self.config.failure_threshold {
                    self.notify(MonitorNotice::SessionUnstable);
                }
            }
        }
    }

    /// Does the backend still honor the session?
    async fn probe_session(&self) -> Result<bool, BackendError> {
        let session = self.backend.get_session().await?;
        Ok(session.map(|s| !s.is_expired()).unwrap_or(false))
    }
}
