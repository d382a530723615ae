//! Host-platform event bridge.
//!
//! The embedding shell (webview, desktop wrapper, browser runtime) wires
//! its connectivity and storage callbacks into a [`PlatformBridge`]; the
//! monitor consumes the resulting events over a channel instead of
//! registering platform listeners itself.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the platform event fan-out.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Something the host platform observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformEvent {
    /// Connectivity came back.
    NetworkOnline,
    /// Connectivity was lost.
    NetworkOffline,
    /// The persisted auth-token entry appeared where none existed before
    /// (another tab signed in).
    TokenStored,
    /// The persisted auth-token entry was removed (another tab signed out,
    /// or the session was revoked).
    TokenRemoved,
}

pub struct PlatformBridge {
    events: broadcast::Sender<PlatformEvent>,
    online: AtomicBool,
}

impl Default for PlatformBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformBridge {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            events,
            online: AtomicBool::new(true),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.events.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Report connectivity. Repeated reports of the same status are
    /// deduplicated; only transitions produce events.
    pub fn notify_online(&self) {
        if !self.online.swap(true, Ordering::SeqCst) {
            debug!("Network transition: online");
            let _ = self.events.send(PlatformEvent::NetworkOnline);
        }
    }

    pub fn notify_offline(&self) {
        if self.online.swap(false, Ordering::SeqCst) {
            debug!("Network transition: offline");
            let _ = self.events.send(PlatformEvent::NetworkOffline);
        }
    }

    /// Report a cross-tab change to the persisted auth-token entry. Storage
    /// events are not deduplicated; each one reflects a distinct write.
    pub fn notify_token_stored(&self) {
        let _ = self.events.send(PlatformEvent::TokenStored);
    }

    pub fn notify_token_removed(&self) {
        let _ = self.events.send(PlatformEvent::TokenRemoved);
    }
}
