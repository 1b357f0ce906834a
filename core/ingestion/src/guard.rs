//! Single-use CSRF tokens and failed-attempt lockout for the OMI key
//! endpoints. State is process-local and lost on restart.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jarvis_schemas::UserId;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::GuardConfig;
use crate::vault::random_bytes;

#[derive(Debug, Clone)]
struct CsrfToken {
    uid: UserId,
    expires_at: f64,
}

#[derive(Debug, Default)]
struct FailureWindow {
    attempts: Vec<f64>,
    locked_until: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_in: u64,
}

pub struct KeyGuard {
    config: GuardConfig,
    tokens: Mutex<HashMap<String, CsrfToken>>,
    failures: Mutex<HashMap<UserId, FailureWindow>>,
}

impl KeyGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            tokens: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub async fn issue_csrf(&self, uid: &UserId, now: f64) -> IssuedToken {
        let token = URL_SAFE_NO_PAD.encode(random_bytes::<32>());
        self.tokens.lock().await.insert(
            token.clone(),
            CsrfToken {
                uid: uid.clone(),
                expires_at: now + self.config.csrf_ttl_secs,
            },
        );

        IssuedToken {
            token,
            expires_in: self.config.csrf_ttl_secs as u64,
        }
    }

    /// Validate and burn a token. A token is removed even when it turns out
    /// to belong to another user or to be expired.
    pub async fn consume_csrf(&self, uid: &UserId, token: &str, now: f64) -> bool {
        match self.tokens.lock().await.remove(token) {
            Some(entry) if entry.uid == *uid && now <= entry.expires_at => true,
            Some(_) => {
                warn!("Rejected CSRF token for {}: expired or bound to another user", uid);
                false
            }
            None => false,
        }
    }

    /// `Err(retry_after_secs)` while the user is locked out
    pub async fn check_lockout(&self, uid: &UserId, now: f64) -> Result<(), u64> {
        let failures = self.failures.lock().await;
        match failures.get(uid).and_then(|w| w.locked_until) {
            Some(until) if now < until => Err(retry_after(until - now)),
            _ => Ok(()),
        }
    }

    /// Record a failed attempt. Returns the lockout duration when this
    /// attempt tripped the limit.
    pub async fn record_failure(&self, uid: &UserId, now: f64) -> Option<u64> {
        let mut failures = self.failures.lock().await;
        let window = failures.entry(uid.clone()).or_default();

        let horizon = now - self.config.failure_window_secs;
        window.attempts.retain(|&t| t > horizon);
        window.attempts.push(now);

        if window.attempts.len() >= self.config.max_failures {
            window.attempts.clear();
            window.locked_until = Some(now + self.config.lockout_secs);
            warn!("Locked OMI key updates for {} after repeated failures", uid);
            return Some(retry_after(self.config.lockout_secs));
        }
        None
    }

    pub async fn clear_failures(&self, uid: &UserId) {
        self.failures.lock().await.remove(uid);
    }

    /// Drop expired tokens and stale failure windows
    pub async fn purge_expired(&self, now: f64) -> usize {
        let mut purged = 0;

        {
            let mut tokens = self.tokens.lock().await;
            let before = tokens.len();
            tokens.retain(|_, t| t.expires_at >= now);
            purged += before - tokens.len();
        }

        let mut failures = self.failures.lock().await;
        let before = failures.len();
        let horizon = now - self.config.failure_window_secs;
        failures.retain(|_, w| {
            let locked = w.locked_until.is_some_and(|until| until > now);
            locked || w.attempts.iter().any(|&t| t > horizon)
        });
        purged += before - failures.len();

        purged
    }
}

fn retry_after(secs: f64) -> u64 {
    secs.ceil().max(1.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(id: &str) -> UserId {
        UserId(id.to_string())
    }

    #[tokio::test]
    async fn test_csrf_single_use() {
        let guard = KeyGuard::new(GuardConfig::default());
        let issued = guard.issue_csrf(&uid("u1"), 0.0).await;
        assert_eq!(issued.expires_in, 3600);

        assert!(guard.consume_csrf(&uid("u1"), &issued.token, 10.0).await);
        assert!(!guard.consume_csrf(&uid("u1"), &issued.token, 10.0).await);
    }

    #[tokio::test]
    async fn test_csrf_bound_to_user_and_ttl() {
        let guard = KeyGuard::new(GuardConfig::default());

        let other = guard.issue_csrf(&uid("u1"), 0.0).await;
        assert!(!guard.consume_csrf(&uid("u2"), &other.token, 1.0).await);
        assert!(!guard.consume_csrf(&uid("u1"), &other.token, 1.0).await);

        let stale = guard.issue_csrf(&uid("u1"), 0.0).await;
        assert!(!guard.consume_csrf(&uid("u1"), &stale.token, 3_601.0).await);

        assert!(!guard.consume_csrf(&uid("u1"), "made-up", 0.0).await);
    }

    #[tokio::test]
    async fn test_lockout_after_repeated_failures() {
        let guard = KeyGuard::new(GuardConfig::default());
        let user = uid("u1");

        for i in 0..4 {
            assert_eq!(guard.record_failure(&user, i as f64).await, None);
        }
        assert!(guard.check_lockout(&user, 4.0).await.is_ok());

        assert_eq!(guard.record_failure(&user, 5.0).await, Some(900));
        assert_eq!(guard.check_lockout(&user, 6.0).await, Err(899));
        assert!(guard.check_lockout(&user, 905.0).await.is_ok());

        // other users are unaffected
        assert!(guard.check_lockout(&uid("u2"), 6.0).await.is_ok());
    }

    #[tokio::test]
    async fn test_failures_outside_window_expire() {
        let guard = KeyGuard::new(GuardConfig::default());
        let user = uid("u1");

        for i in 0..4 {
            guard.record_failure(&user, i as f64).await;
        }
        assert_eq!(guard.record_failure(&user, 1_000.0).await, None);
    }

    #[tokio::test]
    async fn test_clear_and_purge() {
        let guard = KeyGuard::new(GuardConfig::default());
        let user = uid("u1");

        guard.record_failure(&user, 0.0).await;
        guard.clear_failures(&user).await;
        for i in 0..4 {
            assert_eq!(guard.record_failure(&user, i as f64).await, None);
        }

        guard.issue_csrf(&user, 0.0).await;
        assert_eq!(guard.purge_expired(10.0).await, 0);
        assert_eq!(guard.purge_expired(5_000.0).await, 2);
    }
}
