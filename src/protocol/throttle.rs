//! Per-connection command throttling.
//!
//! A throttler guards expensive or abusable operations behind minimum
//! intervals. Each guarded operation belongs to a *profile* (an index into the
//! throttler's profile list), and state is kept per connection per profile, so
//! one chatty command does not starve an unrelated one.
//!
//! Consecutive throttles within a profile's window are counted, which lets the
//! caller escalate (warn, then kick) against peers that keep hammering.
//!
//! Tracking is explicit: a connection must be `track`ed before it can be
//! guarded and `untrack`ed on teardown. Guarding an untracked connection is a
//! usage error, not a silent allow.

use crate::error::{ProtocolError, Result};
use crate::service::ConnectionId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Rate limits for one class of operations.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleProfile {
    /// Minimum time between allowed attempts. Zero disables throttling for
    /// this profile entirely.
    pub min_interval: Duration,
    /// Two throttled attempts further apart than this restart the consecutive
    /// count at 1.
    pub consecutive_window: Duration,
}

impl ThrottleProfile {
    pub fn new(min_interval: Duration, consecutive_window: Duration) -> Self {
        Self {
            min_interval,
            consecutive_window,
        }
    }
}

/// Whether a guarded call ran or was suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleOutcome {
    Ran,
    Throttled,
}

#[derive(Debug, Clone, Copy, Default)]
struct ProfileState {
    last_attempt: Option<Instant>,
    last_throttled: Option<Instant>,
    consecutive_count: u32,
}

enum Decision {
    Allow,
    Suppress { at: Instant, count: u32 },
}

fn decide(profile: &ThrottleProfile, state: &mut ProfileState, now: Instant) -> Decision {
    if profile.min_interval.is_zero() {
        state.last_attempt = Some(now);
        return Decision::Allow;
    }
    match state.last_attempt {
        Some(last) if now.duration_since(last) < profile.min_interval => {
            let count = match state.last_throttled {
                Some(prev) if now.duration_since(prev) <= profile.consecutive_window => {
                    state.consecutive_count + 1
                }
                _ => 1,
            };
            state.consecutive_count = count;
            state.last_throttled = Some(now);
            Decision::Suppress { at: now, count }
        }
        _ => {
            state.last_attempt = Some(now);
            Decision::Allow
        }
    }
}

/// Server-side throttler: per-connection, per-profile state.
pub struct ServerThrottler {
    profiles: Vec<ThrottleProfile>,
    tracked: Mutex<HashMap<ConnectionId, Vec<ProfileState>>>,
}

impl ServerThrottler {
    /// Builds a throttler; profile ids are indices into `profiles`.
    pub fn new(profiles: Vec<ThrottleProfile>) -> Self {
        Self {
            profiles,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    /// Starts tracking a connection, with fresh state for every profile.
    /// Tracking twice resets the state.
    pub fn track(&self, conn: ConnectionId) {
        let mut tracked = self.lock();
        tracked.insert(conn, vec![ProfileState::default(); self.profiles.len()]);
    }

    /// Drops all state for a connection.
    pub fn untrack(&self, conn: ConnectionId) {
        let mut tracked = self.lock();
        tracked.remove(&conn);
    }

    pub fn is_tracked(&self, conn: ConnectionId) -> bool {
        self.lock().contains_key(&conn)
    }

    /// Runs `action` unless the profile's interval suppresses it, in which
    /// case `on_throttled` is invoked with the throttle time and consecutive
    /// count instead.
    ///
    /// # Errors
    /// [`ProtocolError::UntrackedConnection`] when `conn` was never tracked
    /// (or already untracked); [`ProtocolError::ConfigError`] for a profile
    /// index out of range. Errors from `action` propagate unchanged.
    pub async fn run_throttled<F, Fut, T>(
        &self,
        conn: ConnectionId,
        profile: usize,
        action: F,
        on_throttled: T,
    ) -> Result<ThrottleOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
        T: FnOnce(ConnectionId, Instant, u32),
    {
        let decision = {
            let mut tracked = self.lock();
            let states = tracked
                .get_mut(&conn)
                .ok_or(ProtocolError::UntrackedConnection(conn))?;
            let settings = self.profiles.get(profile).ok_or_else(|| {
                ProtocolError::ConfigError(format!(
                    "throttle profile {profile} out of range (have {})",
                    self.profiles.len()
                ))
            })?;
            // track() sizes the state vector to the profile list.
            decide(settings, &mut states[profile], Instant::now())
        };

        match decision {
            Decision::Allow => {
                action().await?;
                Ok(ThrottleOutcome::Ran)
            }
            Decision::Suppress { at, count } => {
                warn!(conn, profile, count, "operation throttled");
                on_throttled(conn, at, count);
                Ok(ThrottleOutcome::Throttled)
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, Vec<ProfileState>>> {
        match self.tracked.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Client-side throttler: the same interval math, keyed by profile only.
///
/// A client has a single connection, so there is nothing to track; this is an
/// interval gate for outgoing commands (for example, not re-sending a "move"
/// faster than the server would accept it).
pub struct ClientThrottler {
    profiles: Vec<ThrottleProfile>,
    states: Mutex<Vec<ProfileState>>,
}

impl ClientThrottler {
    pub fn new(profiles: Vec<ThrottleProfile>) -> Self {
        let states = Mutex::new(vec![ProfileState::default(); profiles.len()]);
        Self { profiles, states }
    }

    /// Stamps an attempt for the profile; `true` means the caller may proceed.
    pub fn try_acquire(&self, profile: usize) -> Result<bool> {
        let settings = self.profiles.get(profile).ok_or_else(|| {
            ProtocolError::ConfigError(format!(
                "throttle profile {profile} out of range (have {})",
                self.profiles.len()
            ))
        })?;
        let mut states = match self.states.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(matches!(
            decide(settings, &mut states[profile], Instant::now()),
            Decision::Allow
        ))
    }

    /// Runs `action` when the profile's interval allows it.
    pub async fn run_throttled<F, Fut>(&self, profile: usize, action: F) -> Result<ThrottleOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self.try_acquire(profile)? {
            action().await?;
            Ok(ThrottleOutcome::Ran)
        } else {
            Ok(ThrottleOutcome::Throttled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn throttler(min_ms: u64, window_ms: u64) -> ServerThrottler {
        ServerThrottler::new(vec![ThrottleProfile::new(
            Duration::from_millis(min_ms),
            Duration::from_millis(window_ms),
        )])
    }

    async fn attempt(t: &ServerThrottler, conn: ConnectionId) -> (ThrottleOutcome, u32) {
        let count = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&count);
        let outcome = t
            .run_throttled(
                conn,
                0,
                || async { Ok(()) },
                move |_, _, c| seen.store(c, Ordering::SeqCst),
            )
            .await
            .unwrap();
        (outcome, count.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn zero_interval_always_allows() {
        let t = throttler(0, 1000);
        t.track(1);
        for _ in 0..5 {
            assert_eq!(attempt(&t, 1).await.0, ThrottleOutcome::Ran);
        }
    }

    #[tokio::test]
    async fn rapid_attempts_are_counted_consecutively() {
        let t = throttler(10_000, 60_000);
        t.track(1);
        assert_eq!(attempt(&t, 1).await, (ThrottleOutcome::Ran, 0));
        assert_eq!(attempt(&t, 1).await, (ThrottleOutcome::Throttled, 1));
        assert_eq!(attempt(&t, 1).await, (ThrottleOutcome::Throttled, 2));
        assert_eq!(attempt(&t, 1).await, (ThrottleOutcome::Throttled, 3));
    }

    #[tokio::test]
    async fn count_restarts_outside_the_consecutive_window() {
        // Interval long enough to still throttle the third attempt, window
        // short enough that the wait in between breaks the streak.
        let t = throttler(10_000, 10);
        t.track(1);
        assert_eq!(attempt(&t, 1).await, (ThrottleOutcome::Ran, 0));
        assert_eq!(attempt(&t, 1).await, (ThrottleOutcome::Throttled, 1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(attempt(&t, 1).await, (ThrottleOutcome::Throttled, 1));
    }

    #[tokio::test]
    async fn untracked_connection_is_a_usage_error() {
        let t = throttler(100, 1000);
        let result = t
            .run_throttled(9, 0, || async { Ok(()) }, |_, _, _| {})
            .await;
        assert!(matches!(result, Err(ProtocolError::UntrackedConnection(9))));
    }

    #[tokio::test]
    async fn untrack_discards_state() {
        let t = throttler(10_000, 60_000);
        t.track(1);
        assert_eq!(attempt(&t, 1).await.0, ThrottleOutcome::Ran);
        t.untrack(1);
        assert!(!t.is_tracked(1));
        // Re-tracking starts clean: the first attempt runs again.
        t.track(1);
        assert_eq!(attempt(&t, 1).await.0, ThrottleOutcome::Ran);
    }

    #[tokio::test]
    async fn connections_are_throttled_independently() {
        let t = throttler(10_000, 60_000);
        t.track(1);
        t.track(2);
        assert_eq!(attempt(&t, 1).await.0, ThrottleOutcome::Ran);
        assert_eq!(attempt(&t, 2).await.0, ThrottleOutcome::Ran);
        assert_eq!(attempt(&t, 1).await.0, ThrottleOutcome::Throttled);
    }

    #[tokio::test]
    async fn profile_index_out_of_range_is_a_config_error() {
        let t = throttler(100, 1000);
        t.track(1);
        let result = t
            .run_throttled(1, 5, || async { Ok(()) }, |_, _, _| {})
            .await;
        assert!(matches!(result, Err(ProtocolError::ConfigError(_))));
    }

    #[tokio::test]
    async fn client_throttler_gates_by_interval() {
        let t = ClientThrottler::new(vec![ThrottleProfile::new(
            Duration::from_millis(10),
            Duration::ZERO,
        )]);
        assert!(t.try_acquire(0).unwrap());
        assert!(!t.try_acquire(0).unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(t.try_acquire(0).unwrap());
        assert!(t.try_acquire(1).is_err());
    }
}
