//! Explicit state machine for the profile-fetch protocol.
//!
//! Replaces ad-hoc in-flight/retry flags with named states so the guard
//! rules (one outstanding fetch per user, counter reset on user change,
//! discard on user mismatch) are individually testable.

use uuid::Uuid;

/// Where the profile fetch pipeline currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchState {
    /// Nothing fetched, nothing in flight.
    Idle,
    /// A fetch for `user_id` is outstanding. `attempt` is 1-based; values
    /// above 1 are retries after transient failures.
    Fetching { user_id: Uuid, attempt: u32 },
    /// Last fetch for `user_id` succeeded.
    Ready { user_id: Uuid },
    /// Last fetch for `user_id` failed fatally (non-transient error or
    /// retries exhausted).
    Failed { user_id: Uuid },
}

impl FetchState {
    /// Try to start a fetch for `user_id`. Returns `false` when a fetch for
    /// the same user is already in flight (the caller must not start a
    /// duplicate). Starting for a different user always succeeds and resets
    /// the attempt counter.
    pub(crate) fn begin(&mut self, user_id: Uuid) -> bool {
        if let FetchState::Fetching { user_id: active, .. } = self {
            if *active == user_id {
                return false;
            }
        }
        *self = FetchState::Fetching {
            user_id,
            attempt: 1,
        };
        true
    }

    /// Record the next attempt of an in-flight fetch.
    pub(crate) fn record_attempt(&mut self, user_id: Uuid, attempt: u32) {
        *self = FetchState::Fetching { user_id, attempt };
    }

    /// Is a fetch for this exact user currently outstanding?
    pub(crate) fn is_fetching(&self, user_id: Uuid) -> bool {
        matches!(self, FetchState::Fetching { user_id: active, .. } if *active == user_id)
    }

    /// Settle a completed fetch. Only transitions if this fetch is still the
    /// active one; a newer fetch for another user wins otherwise.
    pub(crate) fn settle(&mut self, user_id: Uuid, success: bool) {
        if self.is_fetching(user_id) {
            *self = if success {
                FetchState::Ready { user_id }
            } else {
                FetchState::Failed { user_id }
            };
        }
    }

    /// Abandon a fetch whose result was discarded (user changed mid-flight).
    pub(crate) fn abandon(&mut self, user_id: Uuid) {
        if self.is_fetching(user_id) {
            *self = FetchState::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_guards_same_user() {
        let user = Uuid::new_v4();
        let mut state = FetchState::Idle;

        assert!(state.begin(user));
        assert!(state.is_fetching(user));
        // second begin for the same user is refused
        assert!(!state.begin(user));
    }

    #[test]
    fn test_begin_new_user_resets_attempt() {
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let mut state = FetchState::Idle;

        assert!(state.begin(first));
        state.record_attempt(first, 3);

        // a different user interrupts and starts over at attempt 1
        assert!(state.begin(second));
        assert_eq!(
            state,
            FetchState::Fetching {
                user_id: second,
                attempt: 1
            }
        );
    }

    #[test]
    fn test_settle_only_applies_to_active_fetch() {
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let mut state = FetchState::Idle;

        state.begin(first);
        state.begin(second);

        // first's completion arrives late and must not clobber second
        state.settle(first, true);
        assert!(state.is_fetching(second));

        state.settle(second, false);
        assert_eq!(state, FetchState::Failed { user_id: second });
    }

    #[test]
    fn test_abandon_returns_to_idle() {
        let user = Uuid::new_v4();
        let mut state = FetchState::Idle;

        state.begin(user);
        state.abandon(user);
        assert_eq!(state, FetchState::Idle);

        // abandoning a non-active fetch is a no-op
        state.begin(user);
        state.abandon(Uuid::new_v4());
        assert!(state.is_fetching(user));
    }
}
