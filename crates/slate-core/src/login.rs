//! Login attempt counting and timed lockout.
//!
//! The state machine is the pure function [`evaluate`]: it takes the
//! session's attempt state, the current time, the policy and whether the
//! submitted credentials matched, and returns the next state and a
//! [`Decision`]. [`LoginGuard`] is the thin layer that reads that state out
//! of a session, applies the decision and saves the session.
//!
//! Lockout expiry is lazy. A locked session becomes unlocked only when the
//! next attempt finds the window elapsed; there is no background timer.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use subtle::ConstantTimeEq;

use crate::error::SessionError;
use crate::projector::SessionContentProjector;
use crate::session::{
    AUTHENTICATED_KEY, REDIRECT_KEY, Session, SessionStore, SessionValue, USERNAME_KEY,
};

/// Session key: consecutive failed attempts.
pub const ATTEMPTS_KEY: &str = "login_attempts";
/// Session key: time of the most recent failed attempt.
pub const LAST_ATTEMPT_KEY: &str = "last_login_attempt_time";
/// Session key: queued message for a failed attempt.
pub const ERROR_KEY: &str = "login_error";
/// Session key: queued message for a lockout.
pub const LOCKOUT_KEY: &str = "login_lockout_message";

/// Default number of failures before lockout.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Default lockout window.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(60 * 60);

/// Landing page after a successful login with no saved deep link.
const DEFAULT_LANDING: &str = "/content";
const LOGIN_PATH: &str = "/login";

/// Configured credentials and lockout limits.
#[derive(Clone)]
pub struct LoginPolicy {
    username: String,
    password: String,
    max_attempts: u32,
    lock_duration: Duration,
}

impl std::fmt::Debug for LoginPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginPolicy")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("max_attempts", &self.max_attempts)
            .field("lock_duration", &self.lock_duration)
            .finish()
    }
}

impl LoginPolicy {
    /// A `max_attempts` of zero is treated as one.
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        max_attempts: u32,
        lock_duration: Duration,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            max_attempts: max_attempts.max(1),
            lock_duration,
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn lock_duration(&self) -> Duration {
        self.lock_duration
    }

    /// Whether a username has been configured at all.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }

    /// Compare a submitted pair against the configured one in constant time.
    ///
    /// Always `false` when no username is configured.
    #[must_use]
    pub fn check(&self, username: &str, password: &str) -> bool {
        let user_ok = self.username.as_bytes().ct_eq(username.as_bytes());
        let pass_ok = self.password.as_bytes().ct_eq(password.as_bytes());
        self.has_credentials() && bool::from(user_ok & pass_ok)
    }
}

/// Per-session attempt bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttemptState {
    pub attempts: u32,
    pub last_failure: Option<DateTime<Utc>>,
}

/// Outcome of one login attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The session is inside its lockout window; credentials were not
    /// consulted and no attempt was consumed.
    Locked { remaining: Duration },
    /// Credentials matched.
    Granted,
    /// Credentials did not match; more attempts remain.
    Rejected { remaining_attempts: u32 },
    /// Credentials did not match and the limit is now reached.
    LockedOut { remaining: Duration },
}

/// Advance the attempt state machine by one submission.
///
/// A session at or over the limit is locked until `lock_duration` after its
/// last failure. Once that has passed (or the failure time is unknown) the
/// counter starts again from zero before the credentials are judged.
#[must_use]
pub fn evaluate(
    state: AttemptState,
    now: DateTime<Utc>,
    policy: &LoginPolicy,
    credentials_valid: bool,
) -> (AttemptState, Decision) {
    let mut state = state;
    if state.attempts >= policy.max_attempts {
        if let Some(expiry) = state.last_failure.and_then(|last| lock_expiry(last, policy)) {
            if now < expiry {
                let remaining = (expiry - now).to_std().unwrap_or_default();
                return (state, Decision::Locked { remaining });
            }
        }
        state = AttemptState::default();
    }

    if credentials_valid {
        return (AttemptState::default(), Decision::Granted);
    }

    let attempts = state.attempts.saturating_add(1);
    let next = AttemptState {
        attempts,
        last_failure: Some(now),
    };
    let decision = if attempts >= policy.max_attempts {
        Decision::LockedOut {
            remaining: policy.lock_duration,
        }
    } else {
        Decision::Rejected {
            remaining_attempts: policy.max_attempts - attempts,
        }
    };
    (next, decision)
}

fn lock_expiry(last: DateTime<Utc>, policy: &LoginPolicy) -> Option<DateTime<Utc>> {
    let window = chrono::Duration::from_std(policy.lock_duration).ok()?;
    last.checked_add_signed(window)
}

/// Render a duration rounded to whole seconds, e.g. `59m 59s`.
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let mut secs = d.as_secs();
    if d.subsec_millis() >= 500 {
        secs = secs.saturating_add(1);
    }
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

/// Result of [`LoginGuard::attempt`]: what happened and where to send the
/// browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    pub decision: Decision,
    pub redirect: String,
}

/// Messages queued for the next render of the login page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashMessages {
    pub error: Option<String>,
    pub lockout: Option<String>,
}

impl FlashMessages {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.error.is_none() && self.lockout.is_none()
    }
}

/// Read and clear the queued login messages. The caller saves the session
/// when anything was taken.
pub fn take_flash_messages(session: &mut Session) -> FlashMessages {
    let mut take = |key: &str| match session.get(key).and_then(SessionValue::as_text) {
        Some(text) => {
            let text = text.to_owned();
            session.remove(key);
            Some(text)
        }
        None => None,
    };
    FlashMessages {
        error: take(ERROR_KEY),
        lockout: take(LOCKOUT_KEY),
    }
}

/// Applies [`evaluate`] to browser sessions.
pub struct LoginGuard {
    policy: LoginPolicy,
    sessions: Arc<dyn SessionStore>,
}

impl std::fmt::Debug for LoginGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginGuard")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl LoginGuard {
    #[must_use]
    pub fn new(policy: LoginPolicy, sessions: Arc<dyn SessionStore>) -> Self {
        Self { policy, sessions }
    }

    #[must_use]
    pub fn policy(&self) -> &LoginPolicy {
        &self.policy
    }

    /// Process a submitted credential pair now.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] only if a successful login cannot be saved.
    /// Every other session failure is logged and the attempt still
    /// completes.
    pub async fn attempt(
        &self,
        session: &mut Session,
        username: &str,
        password: &str,
    ) -> Result<LoginOutcome, SessionError> {
        self.attempt_at(session, username, password, Utc::now()).await
    }

    /// [`attempt`](Self::attempt) at a given instant.
    ///
    /// # Errors
    ///
    /// Same as [`attempt`](Self::attempt).
    pub async fn attempt_at(
        &self,
        session: &mut Session,
        username: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> Result<LoginOutcome, SessionError> {
        let state = read_state(session);
        let valid = self.policy.check(username, password);
        let (next, decision) = evaluate(state, now, &self.policy, valid);

        let redirect = match decision {
            Decision::Locked { remaining } => {
                tracing::warn!(
                    user = %username,
                    remaining = %format_duration(remaining),
                    "login refused during lockout"
                );
                "/".to_owned()
            }
            Decision::Granted => self.grant(session, username).await?,
            Decision::Rejected { remaining_attempts } => {
                write_state(session, next);
                session.remove(LOCKOUT_KEY);
                session.set(
                    ERROR_KEY,
                    format!("Invalid username or password. {remaining_attempts} attempts remaining."),
                );
                tracing::info!(user = %username, attempts = next.attempts, "failed login attempt");
                self.save_quietly(session).await;
                LOGIN_PATH.to_owned()
            }
            Decision::LockedOut { remaining } => {
                write_state(session, next);
                session.remove(ERROR_KEY);
                session.set(
                    LOCKOUT_KEY,
                    format!(
                        "Too many failed login attempts. Please try again in {}.",
                        format_duration(remaining)
                    ),
                );
                tracing::warn!(
                    user = %username,
                    attempts = next.attempts,
                    lock_secs = self.policy.lock_duration.as_secs(),
                    "login locked out"
                );
                self.save_quietly(session).await;
                LOGIN_PATH.to_owned()
            }
        };
        Ok(LoginOutcome { decision, redirect })
    }

    async fn grant(&self, session: &mut Session, username: &str) -> Result<String, SessionError> {
        for key in [ATTEMPTS_KEY, LAST_ATTEMPT_KEY, ERROR_KEY, LOCKOUT_KEY] {
            session.remove(key);
        }
        if let Err(e) = self.sessions.regenerate(session).await {
            tracing::warn!(error = %e, "session regeneration failed, keeping current id");
        }
        session.set(AUTHENTICATED_KEY, true);
        session.set(USERNAME_KEY, username);
        SessionContentProjector::discard(session);

        let saved = session
            .remove(REDIRECT_KEY)
            .and_then(|v| v.as_text().map(str::to_owned))
            .filter(|url| !url.is_empty() && url != LOGIN_PATH && url.starts_with('/'));
        self.sessions.save(session).await?;
        tracing::info!(user = %username, "login succeeded");
        Ok(saved.unwrap_or_else(|| DEFAULT_LANDING.to_owned()))
    }

    async fn save_quietly(&self, session: &Session) {
        if let Err(e) = self.sessions.save(session).await {
            tracing::warn!(error = %e, "failed to save login attempt state");
        }
    }
}

/// Read attempt state, tolerating every numeric encoding. An unreadable
/// failure time counts as no previous failure.
fn read_state(session: &Session) -> AttemptState {
    AttemptState {
        attempts: session
            .get(ATTEMPTS_KEY)
            .and_then(SessionValue::as_count)
            .unwrap_or(0),
        last_failure: session
            .get(LAST_ATTEMPT_KEY)
            .and_then(SessionValue::as_timestamp),
    }
}

fn write_state(session: &mut Session, state: AttemptState) {
    session.set(ATTEMPTS_KEY, state.attempts);
    match state.last_failure {
        Some(t) => session.set(LAST_ATTEMPT_KEY, t.to_rfc3339()),
        None => {
            session.remove(LAST_ATTEMPT_KEY);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::projector::CONTENT_KEY;
    use crate::session::{DEFAULT_SESSION_TTL, MemorySessionStore, SessionCodec};
    use chrono::{TimeDelta, TimeZone};

    fn policy() -> LoginPolicy {
        LoginPolicy::new("admin", "secret", 5, DEFAULT_LOCK_DURATION)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn check_requires_both_fields() {
        let p = policy();
        assert!(p.check("admin", "secret"));
        assert!(!p.check("admin", "nope"));
        assert!(!p.check("root", "secret"));
        assert!(!p.check("admin", "secret!"));
    }

    #[test]
    fn empty_configuration_never_matches() {
        let p = LoginPolicy::new("", "", 5, DEFAULT_LOCK_DURATION);
        assert!(!p.check("", ""));
    }

    #[test]
    fn debug_hides_password() {
        assert!(!format!("{:?}", policy()).contains("secret"));
    }

    #[test]
    fn failures_count_down_then_lock() {
        let p = policy();
        let mut state = AttemptState::default();
        for n in 1..5 {
            let (next, decision) = evaluate(state, t0(), &p, false);
            assert_eq!(decision, Decision::Rejected { remaining_attempts: 5 - n });
            state = next;
        }
        let (state, decision) = evaluate(state, t0(), &p, false);
        assert_eq!(decision, Decision::LockedOut { remaining: DEFAULT_LOCK_DURATION });
        assert_eq!(state.attempts, 5);
    }

    #[test]
    fn locked_state_ignores_correct_credentials() {
        let p = policy();
        let locked = AttemptState {
            attempts: 5,
            last_failure: Some(t0()),
        };
        let later = t0() + TimeDelta::minutes(1);
        let (state, decision) = evaluate(locked, later, &p, true);
        assert_eq!(state, locked);
        assert_eq!(
            decision,
            Decision::Locked {
                remaining: Duration::from_secs(59 * 60)
            }
        );
    }

    #[test]
    fn elapsed_lock_resets_before_judging() {
        let p = policy();
        let locked = AttemptState {
            attempts: 5,
            last_failure: Some(t0()),
        };
        let after = t0() + TimeDelta::hours(1);
        let (state, decision) = evaluate(locked, after, &p, true);
        assert_eq!(decision, Decision::Granted);
        assert_eq!(state, AttemptState::default());

        let (state, decision) = evaluate(locked, after, &p, false);
        assert_eq!(decision, Decision::Rejected { remaining_attempts: 4 });
        assert_eq!(state.attempts, 1);
    }

    #[test]
    fn unknown_failure_time_counts_as_none() {
        let p = policy();
        let state = AttemptState {
            attempts: 7,
            last_failure: None,
        };
        let (_, decision) = evaluate(state, t0(), &p, false);
        assert_eq!(decision, Decision::Rejected { remaining_attempts: 4 });
    }

    #[test]
    fn durations_render_compactly() {
        assert_eq!(format_duration(Duration::from_secs(3599)), "59m 59s");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h 0m 0s");
        assert_eq!(format_duration(Duration::from_millis(4_600)), "5s");
    }

    async fn guard_with(codec: SessionCodec) -> (LoginGuard, Arc<MemorySessionStore>) {
        let store = Arc::new(MemorySessionStore::new(DEFAULT_SESSION_TTL, codec));
        (LoginGuard::new(policy(), store.clone()), store)
    }

    #[tokio::test]
    async fn lockout_scenario_across_requests() {
        let (guard, store) = guard_with(SessionCodec::Json).await;
        let mut session = store.load(None).await.unwrap();
        store.save(&session).await.unwrap();

        for n in 1..=5 {
            session = store.load(Some(session.id())).await.unwrap();
            let out = guard.attempt_at(&mut session, "admin", "wrong", t0()).await.unwrap();
            assert_eq!(out.redirect, "/login");
            if n < 5 {
                assert!(matches!(out.decision, Decision::Rejected { .. }));
            } else {
                assert!(matches!(out.decision, Decision::LockedOut { .. }));
            }
        }

        session = store.load(Some(session.id())).await.unwrap();
        let flashes = take_flash_messages(&mut session);
        assert_eq!(
            flashes.lockout.as_deref(),
            Some("Too many failed login attempts. Please try again in 1h 0m 0s.")
        );
        assert!(flashes.error.is_none());
        store.save(&session).await.unwrap();

        let soon = t0() + TimeDelta::minutes(10);
        session = store.load(Some(session.id())).await.unwrap();
        let out = guard.attempt_at(&mut session, "admin", "secret", soon).await.unwrap();
        assert!(matches!(out.decision, Decision::Locked { .. }));
        assert_eq!(out.redirect, "/");
        assert!(!session.is_authenticated());

        let later = t0() + TimeDelta::hours(1);
        session = store.load(Some(session.id())).await.unwrap();
        let out = guard.attempt_at(&mut session, "admin", "secret", later).await.unwrap();
        assert_eq!(out.decision, Decision::Granted);
        assert!(session.is_authenticated());
        assert!(session.get(ATTEMPTS_KEY).is_none());
    }

    #[tokio::test]
    async fn success_rotates_id_and_follows_deep_link() {
        let (guard, store) = guard_with(SessionCodec::Native).await;
        let mut session = store.load(None).await.unwrap();
        session.set(REDIRECT_KEY, "/content/abc");
        session.set(CONTENT_KEY, b"{}".to_vec());
        store.save(&session).await.unwrap();
        let old_id = session.id().to_owned();

        let out = guard.attempt(&mut session, "admin", "secret").await.unwrap();
        assert_eq!(out.redirect, "/content/abc");
        assert_ne!(session.id(), old_id);
        assert!(session.get(REDIRECT_KEY).is_none());
        assert!(session.get(CONTENT_KEY).is_none());

        let stored = store.load(Some(session.id())).await.unwrap();
        assert!(stored.is_authenticated());
        assert_eq!(stored.get(USERNAME_KEY).and_then(SessionValue::as_text), Some("admin"));
    }

    #[tokio::test]
    async fn login_page_is_never_a_landing_target() {
        let (guard, store) = guard_with(SessionCodec::Native).await;
        let mut session = store.load(None).await.unwrap();
        session.set(REDIRECT_KEY, "/login");
        let out = guard.attempt(&mut session, "admin", "secret").await.unwrap();
        assert_eq!(out.redirect, "/content");
    }

    #[tokio::test]
    async fn rejected_attempt_queues_error_message() {
        let (guard, store) = guard_with(SessionCodec::Native).await;
        let mut session = store.load(None).await.unwrap();
        guard.attempt(&mut session, "admin", "bad").await.unwrap();

        let mut stored = store.load(Some(session.id())).await.unwrap();
        let flashes = take_flash_messages(&mut stored);
        assert_eq!(
            flashes.error.as_deref(),
            Some("Invalid username or password. 4 attempts remaining.")
        );
        assert!(take_flash_messages(&mut stored).is_empty());
    }

    #[tokio::test]
    async fn string_encoded_counters_are_honoured() {
        let (guard, store) = guard_with(SessionCodec::Native).await;
        let mut session = store.load(None).await.unwrap();
        session.set(ATTEMPTS_KEY, "5");
        session.set(LAST_ATTEMPT_KEY, SessionValue::Float(1e30));
        let out = guard.attempt_at(&mut session, "admin", "secret", t0()).await.unwrap();
        assert_eq!(out.decision, Decision::Granted);
    }
}
