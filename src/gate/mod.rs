//! Access gate in front of every installer request.
//!
//! Order of checks in [`AccessGate::check_access`]:
//!
//! 1. Lockout: too many recent failures from this IP → `Blocked`
//!    (even a correct token is refused).
//! 2. No token presented → `TokenRequired`; the token is issued here if
//!    none exists yet.
//! 3. Token validation: missing record, constant-time mismatch, or a
//!    different bound IP → `TokenInvalid`. Mismatches are logged as
//!    failed attempts. An unbound token is pinned to this IP.
//! 4. Idle session past the timeout → `SessionExpired`.
//! 5. Otherwise the session's last activity is refreshed → `Granted`.

pub mod attempts;
pub mod client_ip;
pub mod session;
pub mod token;

pub use attempts::{AttemptLogRepository, FailedAttempt};
pub use client_ip::{UNKNOWN_IP, resolve_client_ip};
pub use session::{LAST_ACTIVITY_KEY, MemorySession, SessionStore};
pub use token::{TokenRecord, TokenRepository};

use anyhow::Result;
use serde::Serialize;
use std::net::IpAddr;

use crate::concurrency::StateLock;
use crate::config::GateConfig;
use crate::paths::Paths;
use crate::security::{AuditAction, AuditLog};

/// Why a presented token was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenFailure {
    /// No token has been issued.
    Missing,
    /// The token does not match.
    Invalid,
    /// The token is pinned to another IP.
    IpMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Blocked,
    TokenRequired,
    TokenInvalid(TokenFailure),
    SessionExpired,
    Granted,
}

impl GateDecision {
    /// Status string returned to the wizard.
    pub fn status(&self) -> &'static str {
        match self {
            Self::Blocked => "blocked",
            Self::TokenRequired => "token_required",
            Self::TokenInvalid(_) => "token_invalid",
            Self::SessionExpired => "expired",
            Self::Granted => "granted",
        }
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// What the gate needs to know about one request.
#[derive(Debug, Clone)]
pub struct GateRequest {
    pub token: Option<String>,
    pub client_ip: IpAddr,
    pub user_agent: String,
}

pub struct AccessGate {
    tokens: TokenRepository,
    attempts: AttemptLogRepository,
    config: GateConfig,
    audit: AuditLog,
}

impl AccessGate {
    pub fn new(paths: &Paths, config: GateConfig) -> Result<Self> {
        let lock = StateLock::new(paths.state_lock())?;
        let tokens = TokenRepository::new(paths.token_file(), lock.clone());
        let attempts = AttemptLogRepository::new(
            paths.attempts_file(),
            lock,
            config.retention_secs(),
            config.max_logged_attempts,
        );
        Ok(Self {
            tokens,
            attempts,
            config,
            audit: AuditLog::new(paths.audit_log()),
        })
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn tokens(&self) -> &TokenRepository {
        &self.tokens
    }

    pub fn attempts(&self) -> &AttemptLogRepository {
        &self.attempts
    }

    pub fn check_access(
        &self,
        request: &GateRequest,
        session: &mut dyn SessionStore,
    ) -> Result<GateDecision> {
        self.check_access_at(request, session, chrono::Utc::now().timestamp())
    }

    /// [`check_access`](Self::check_access) with an explicit clock.
    pub fn check_access_at(
        &self,
        request: &GateRequest,
        session: &mut dyn SessionStore,
        now: i64,
    ) -> Result<GateDecision> {
        let ip = request.client_ip.to_string();

        let recent = self
            .attempts
            .count_recent(&ip, self.config.lockout_secs(), now)?;
        if recent >= self.config.max_attempts {
            // Audited once, when the lockout starts (see `reject`)
            tracing::debug!(ip = %ip, failures = recent, "Installer access blocked");
            return Ok(GateDecision::Blocked);
        }

        let provided = match request.token.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => {
                let (_, issued) = self.tokens.issue_if_absent(now)?;
                if issued {
                    tracing::info!("Installer access token issued; run `install-guard token show` to read it");
                    self.audit.record(AuditAction::TokenIssued, &ip, "http", None);
                }
                return Ok(GateDecision::TokenRequired);
            }
        };

        if let Some(failure) = self.validate_token(provided, &ip, &request.user_agent, now)? {
            return Ok(GateDecision::TokenInvalid(failure));
        }

        let timeout = self.config.session_timeout_secs();
        if let Some(last) = session.get(LAST_ACTIVITY_KEY)
            && now - last > timeout
        {
            session.clear();
            tracing::info!(ip = %ip, idle_secs = now - last, "Installer session expired");
            self.audit.record(AuditAction::SessionExpired, &ip, "http", None);
            return Ok(GateDecision::SessionExpired);
        }

        session.set(LAST_ACTIVITY_KEY, now);
        Ok(GateDecision::Granted)
    }

    /// Current token for the operator, issuing one if none exists yet.
    pub fn current_token(&self) -> Result<TokenRecord> {
        let (record, issued) = self.tokens.issue_if_absent(chrono::Utc::now().timestamp())?;
        if issued {
            self.audit.record(AuditAction::TokenIssued, "", "cli", None);
        }
        Ok(record)
    }

    /// Replace the token, clear the session, and return the new record.
    ///
    /// The failed-attempt log is left alone, so a lockout survives.
    pub fn regenerate_token(&self, session: &mut dyn SessionStore) -> Result<TokenRecord> {
        let record = self.tokens.replace(chrono::Utc::now().timestamp())?;
        session.clear();
        tracing::info!("Installer access token regenerated");
        self.audit
            .record(AuditAction::TokenRegenerated, "", "cli", None);
        Ok(record)
    }

    fn validate_token(
        &self,
        provided: &str,
        ip: &str,
        user_agent: &str,
        now: i64,
    ) -> Result<Option<TokenFailure>> {
        let Some(record) = self.tokens.load()? else {
            return Ok(Some(TokenFailure::Missing));
        };

        if !record.matches(provided) {
            self.reject(ip, user_agent, now, TokenFailure::Invalid)?;
            return Ok(Some(TokenFailure::Invalid));
        }

        let bound = match record.ip {
            Some(bound) => bound,
            None => {
                let Some(updated) = self.tokens.bind_ip(ip)? else {
                    return Ok(Some(TokenFailure::Missing));
                };
                let bound = updated.ip.unwrap_or_default();
                if bound == ip {
                    tracing::info!(ip, "Installer token bound to client IP");
                    self.audit.record(AuditAction::IpBound, ip, "http", None);
                }
                bound
            }
        };

        if bound != ip {
            self.reject(ip, user_agent, now, TokenFailure::IpMismatch)?;
            return Ok(Some(TokenFailure::IpMismatch));
        }

        Ok(None)
    }

    fn reject(&self, ip: &str, user_agent: &str, now: i64, failure: TokenFailure) -> Result<()> {
        self.attempts.record(ip, user_agent, now)?;
        let detail = match failure {
            TokenFailure::Missing => "missing",
            TokenFailure::Invalid => "invalid token",
            TokenFailure::IpMismatch => "ip mismatch",
        };
        tracing::warn!(ip, reason = detail, "Installer access denied");
        self.audit
            .record(AuditAction::AccessDenied, ip, "http", Some(detail));

        let recent = self
            .attempts
            .count_recent(ip, self.config.lockout_secs(), now)?;
        if recent == self.config.max_attempts {
            tracing::warn!(ip, failures = recent, "Installer access locked out");
            self.audit.record(AuditAction::LockedOut, ip, "http", None);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const X: &str = "203.0.113.7";
    const Y: &str = "198.51.100.2";
    const NOW: i64 = 1_700_000_000;

    fn gate(root: &Path) -> AccessGate {
        let paths = Paths::under(root);
        paths.ensure_dirs().unwrap();
        AccessGate::new(&paths, GateConfig::default()).unwrap()
    }

    fn request(token: Option<&str>, ip: &str) -> GateRequest {
        GateRequest {
            token: token.map(str::to_string),
            client_ip: ip.parse().unwrap(),
            user_agent: "test-agent".to_string(),
        }
    }

    /// Trigger issuance and return the token.
    fn issue(gate: &AccessGate, session: &mut MemorySession) -> String {
        let decision = gate.check_access_at(&request(None, X), session, NOW).unwrap();
        assert_eq!(decision, GateDecision::TokenRequired);
        gate.tokens().load().unwrap().unwrap().token
    }

    #[test]
    fn first_request_issues_token() {
        let tmp = tempfile::tempdir().unwrap();
        let gate = gate(tmp.path());
        let mut session = MemorySession::new();

        assert!(gate.tokens().load().unwrap().is_none());
        let token = issue(&gate, &mut session);
        assert_eq!(token.len(), 64 + 7);

        // A second tokenless request keeps the same token
        gate.check_access_at(&request(Some("  "), X), &mut session, NOW)
            .unwrap();
        assert_eq!(gate.tokens().load().unwrap().unwrap().token, token);
    }

    #[test]
    fn correct_token_is_granted_and_binds_ip() {
        let tmp = tempfile::tempdir().unwrap();
        let gate = gate(tmp.path());
        let mut session = MemorySession::new();
        let token = issue(&gate, &mut session);

        let decision = gate
            .check_access_at(&request(Some(&token), X), &mut session, NOW)
            .unwrap();
        assert_eq!(decision, GateDecision::Granted);
        assert_eq!(gate.tokens().load().unwrap().unwrap().ip.as_deref(), Some(X));
        assert_eq!(session.get(LAST_ACTIVITY_KEY), Some(NOW));
    }

    #[test]
    fn validation_without_record_is_missing_and_not_counted() {
        let tmp = tempfile::tempdir().unwrap();
        let gate = gate(tmp.path());
        let mut session = MemorySession::new();

        let decision = gate
            .check_access_at(&request(Some("whatever"), X), &mut session, NOW)
            .unwrap();
        assert_eq!(decision, GateDecision::TokenInvalid(TokenFailure::Missing));
        assert!(gate.attempts().load().unwrap().is_empty());
    }

    #[test]
    fn wrong_token_is_invalid_and_counted() {
        let tmp = tempfile::tempdir().unwrap();
        let gate = gate(tmp.path());
        let mut session = MemorySession::new();
        issue(&gate, &mut session);

        let decision = gate
            .check_access_at(&request(Some("wrong"), X), &mut session, NOW)
            .unwrap();
        assert_eq!(decision, GateDecision::TokenInvalid(TokenFailure::Invalid));

        let logged = gate.attempts().load().unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].ip, X);
        assert_eq!(logged[0].user_agent, "test-agent");
    }

    #[test]
    fn lockout_blocks_even_correct_token_for_that_ip_only() {
        let tmp = tempfile::tempdir().unwrap();
        let gate = gate(tmp.path());
        let mut session = MemorySession::new();
        let token = issue(&gate, &mut session);

        for i in 0..5 {
            let decision = gate
                .check_access_at(&request(Some("wrong"), X), &mut session, NOW + i)
                .unwrap();
            assert_eq!(decision, GateDecision::TokenInvalid(TokenFailure::Invalid));
        }

        let blocked = gate
            .check_access_at(&request(Some(&token), X), &mut session, NOW + 10)
            .unwrap();
        assert_eq!(blocked, GateDecision::Blocked);
        assert_eq!(blocked.status(), "blocked");

        // Y is unaffected and binds the still-unbound token
        let mut other = MemorySession::new();
        let granted = gate
            .check_access_at(&request(Some(&token), Y), &mut other, NOW + 10)
            .unwrap();
        assert_eq!(granted, GateDecision::Granted);
    }

    #[test]
    fn lockout_lapses_after_window() {
        let tmp = tempfile::tempdir().unwrap();
        let gate = gate(tmp.path());
        let mut session = MemorySession::new();
        let token = issue(&gate, &mut session);

        for i in 0..5 {
            gate.check_access_at(&request(Some("wrong"), X), &mut session, NOW + i)
                .unwrap();
        }

        let later = NOW + 15 * 60 + 10;
        let decision = gate
            .check_access_at(&request(Some(&token), X), &mut session, later)
            .unwrap();
        assert_eq!(decision, GateDecision::Granted);
    }

    #[test]
    fn token_is_pinned_to_first_ip() {
        let tmp = tempfile::tempdir().unwrap();
        let gate = gate(tmp.path());
        let mut session = MemorySession::new();
        let token = issue(&gate, &mut session);

        gate.check_access_at(&request(Some(&token), X), &mut session, NOW)
            .unwrap();

        let mut other = MemorySession::new();
        let decision = gate
            .check_access_at(&request(Some(&token), Y), &mut other, NOW)
            .unwrap();
        assert_eq!(decision, GateDecision::TokenInvalid(TokenFailure::IpMismatch));
        assert_eq!(gate.attempts().load().unwrap()[0].ip, Y);
        assert_eq!(gate.tokens().load().unwrap().unwrap().ip.as_deref(), Some(X));
    }

    #[test]
    fn idle_session_expires() {
        let tmp = tempfile::tempdir().unwrap();
        let gate = gate(tmp.path());
        let mut session = MemorySession::new();
        let token = issue(&gate, &mut session);

        gate.check_access_at(&request(Some(&token), X), &mut session, NOW)
            .unwrap();

        let at_limit = NOW + 60 * 60;
        assert_eq!(
            gate.check_access_at(&request(Some(&token), X), &mut session, at_limit)
                .unwrap(),
            GateDecision::Granted
        );

        let late = at_limit + 61 * 60;
        let decision = gate
            .check_access_at(&request(Some(&token), X), &mut session, late)
            .unwrap();
        assert_eq!(decision, GateDecision::SessionExpired);
        assert_eq!(decision.status(), "expired");
        assert!(session.is_empty());
    }

    #[test]
    fn regeneration_clears_session_and_keeps_lockout() {
        let tmp = tempfile::tempdir().unwrap();
        let gate = gate(tmp.path());
        let mut session = MemorySession::new();
        let old = issue(&gate, &mut session);
        gate.check_access_at(&request(Some(&old), X), &mut session, NOW)
            .unwrap();

        for i in 0..5 {
            gate.check_access_at(&request(Some("wrong"), Y), &mut session, NOW + i)
                .unwrap();
        }

        let new = gate.regenerate_token(&mut session).unwrap();
        assert_ne!(new.token, old);
        assert_eq!(new.ip, None);
        assert!(session.is_empty());
        assert_eq!(gate.attempts().load().unwrap().len(), 5);

        let decision = gate
            .check_access_at(&request(Some(&new.token), Y), &mut session, NOW + 10)
            .unwrap();
        assert_eq!(decision, GateDecision::Blocked);
    }

    #[test]
    fn lockout_is_audited_once_per_window() {
        let tmp = tempfile::tempdir().unwrap();
        let gate = gate(tmp.path());
        let mut session = MemorySession::new();
        let token = issue(&gate, &mut session);

        for i in 0..5 {
            gate.check_access_at(&request(Some("wrong"), Y), &mut session, NOW + i)
                .unwrap();
        }
        for i in 0..50 {
            let decision = gate
                .check_access_at(&request(Some(&token), Y), &mut session, NOW + 10 + i)
                .unwrap();
            assert_eq!(decision, GateDecision::Blocked);
        }

        let audit = AuditLog::new(Paths::under(tmp.path()).audit_log());
        let entries = audit.read().unwrap();
        let locked: Vec<_> = entries
            .iter()
            .filter(|e| e.action == AuditAction::LockedOut)
            .collect();
        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0].subject, Y);
        // Blocked requests add nothing: token issue, 5 denials, 1 lockout
        assert_eq!(entries.len(), 7);
        assert_eq!(gate.attempts().load().unwrap().len(), 5);
    }

    #[test]
    fn operator_token_is_stable_until_regenerated() {
        let tmp = tempfile::tempdir().unwrap();
        let gate = gate(tmp.path());

        let first = gate.current_token().unwrap();
        let again = gate.current_token().unwrap();
        assert_eq!(first, again);

        let mut session = MemorySession::new();
        assert_eq!(issue(&gate, &mut session), first.token);
    }

    #[test]
    fn events_reach_the_audit_log() {
        let tmp = tempfile::tempdir().unwrap();
        let gate = gate(tmp.path());
        let mut session = MemorySession::new();
        let token = issue(&gate, &mut session);
        gate.check_access_at(&request(Some(&token), X), &mut session, NOW)
            .unwrap();
        gate.check_access_at(&request(Some("wrong"), Y), &mut session, NOW)
            .unwrap();

        let audit = AuditLog::new(Paths::under(tmp.path()).audit_log());
        let actions: Vec<_> = audit.read().unwrap().iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::TokenIssued,
                AuditAction::IpBound,
                AuditAction::AccessDenied
            ]
        );
        assert!(audit.verify().unwrap().is_empty());
    }
}
