//! gymgate: client-side auth/session lifecycle layer for a multi-tenant
//! gym-management platform.
//!
//! The crate has one writer of session state, the
//! [`SessionController`](session::SessionController): it runs the
//! sign-in/sign-up/OTP/reset operations against the hosted backend,
//! keeps the User → Profile → Organization chain populated, and exposes
//! consolidated [`AuthState`](session::AuthState) snapshots. A separate
//! [`SessionMonitor`](monitor::SessionMonitor) watches the same event
//! stream plus platform events and raises advisory notices (unexpected
//! sign-out, flaky refreshes, offline transitions, cross-tab divergence)
//! without ever touching the state itself.
//!
//! Typical wiring at the application's composition root:
//!
//! ```no_run
//! use std::sync::Arc;
//! use gymgate::backend::http::HttpBackend;
//! use gymgate::config::Config;
//! use gymgate::monitor::SessionMonitor;
//! use gymgate::platform::PlatformBridge;
//! use gymgate::session::SessionController;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::load(std::path::Path::new("gymgate.toml"))?;
//! gymgate::config::init_tracing(&config.logging);
//!
//! let backend = Arc::new(HttpBackend::new(&config.backend)?);
//! let controller = SessionController::new(backend.clone(), config.retry.clone());
//! let controller_handle = controller.start();
//!
//! let platform = PlatformBridge::new();
//! let (monitor, notices) =
//!     SessionMonitor::new(backend, controller.clone(), config.monitor.clone());
//! let monitor_handle = monitor.start(&platform);
//! # let _ = (controller_handle, monitor_handle, notices);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod monitor;
pub mod platform;
pub mod session;

pub use backend::{AuthBackend, AuthEvent, AuthEventKind, NewUserSetup, OtpType, SignUpResult};
pub use config::Config;
pub use error::{BackendError, ProfileError};
pub use monitor::{MonitorNotice, MonitorState, SessionMonitor, Severity};
pub use platform::{PlatformBridge, PlatformEvent};
pub use session::{
    AuthState, ControllerHandle, Organization, Profile, RefreshOutcome, Role, Session,
    SessionController, SignUpOutcome, User,
};
