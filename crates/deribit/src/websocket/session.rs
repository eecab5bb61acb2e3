//! Session and token lifecycle management.
//!
//! Every token mutation flows through [`SessionManager`]: the initial
//! client-credentials grant, scheduled refreshes, token exchange (subaccount
//! switch), token fork (named session) and logout. Each transition except
//! refresh produces a new session record whose `prev_id` points at its
//! predecessor; at most one session is active at a time.

use serde_json::{Value, json};

use crate::{
    common::{
        consts::{DEFAULT_REFRESH_THRESHOLD_SECS, REFRESH_THRESHOLD_MAX_SECS,
            REFRESH_THRESHOLD_MIN_SECS},
        credential::Credential,
        enums::DeribitSessionTransition,
    },
    websocket::messages::DeribitAuthResult,
};

/// A contiguous authenticated context identified by a token pair.
#[derive(Clone, Debug, PartialEq)]
pub struct DeribitSession {
    pub id: u64,
    pub prev_id: Option<u64>,
    pub created_at_ms: u64,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at_ms: u64,
    pub scope: String,
    pub transition: DeribitSessionTransition,
    pub subject_id: Option<u64>,
    pub session_name: Option<String>,
    pub active: bool,
}

/// Redacted session view for observers; never carries token material.
#[derive(Clone, Debug, PartialEq)]
pub struct DeribitSessionInfo {
    pub id: u64,
    pub prev_id: Option<u64>,
    pub transition: DeribitSessionTransition,
    pub scope: String,
    pub expires_at_ms: u64,
    pub subject_id: Option<u64>,
    pub session_name: Option<String>,
    pub active: bool,
}

impl From<&DeribitSession> for DeribitSessionInfo {
    fn from(session: &DeribitSession) -> Self {
        Self {
            id: session.id,
            prev_id: session.prev_id,
            transition: session.transition,
            scope: session.scope.clone(),
            expires_at_ms: session.expires_at_ms,
            subject_id: session.subject_id,
            session_name: session.session_name.clone(),
            active: session.active,
        }
    }
}

/// Validates a refresh threshold against the accepted `[1, 899]` range.
///
/// Out-of-range values are discarded in favor of the default so a bad source
/// never produces a refresh that fires after expiry.
#[must_use]
pub fn validate_refresh_threshold(threshold_secs: Option<u64>) -> u64 {
    match threshold_secs {
        Some(value)
            if (REFRESH_THRESHOLD_MIN_SECS..=REFRESH_THRESHOLD_MAX_SECS).contains(&value) =>
        {
            value
        }
        Some(value) => {
            tracing::warn!(
                target: "deribit_client",
                value,
                default = DEFAULT_REFRESH_THRESHOLD_SECS,
                "auth_refresh_threshold out of range, using default",
            );
            DEFAULT_REFRESH_THRESHOLD_SECS
        }
        None => DEFAULT_REFRESH_THRESHOLD_SECS,
    }
}

/// Owns the session chain and all token state for one connection.
#[derive(Clone, Debug)]
pub struct SessionManager {
    sessions: Vec<DeribitSession>,
    next_id: u64,
    refresh_threshold_secs: u64,
    /// Set after a failed refresh; cleared by the next outcome.
    refresh_retry_armed: bool,
}

impl SessionManager {
    /// Creates a manager with a pre-validated refresh threshold.
    #[must_use]
    pub fn new(refresh_threshold_secs: u64) -> Self {
        Self {
            sessions: Vec::new(),
            next_id: 1,
            refresh_threshold_secs,
            refresh_retry_armed: false,
        }
    }

    #[must_use]
    pub fn refresh_threshold_secs(&self) -> u64 {
        self.refresh_threshold_secs
    }

    /// The currently active session, if any.
    #[must_use]
    pub fn active(&self) -> Option<&DeribitSession> {
        self.sessions.iter().rev().find(|s| s.active)
    }

    /// Access token of the active session.
    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.active().map(|s| s.access_token.as_str())
    }

    /// Refresh token of the active session.
    #[must_use]
    pub fn refresh_token(&self) -> Option<&str> {
        self.active().map(|s| s.refresh_token.as_str())
    }

    /// Full session history, oldest first.
    #[must_use]
    pub fn history(&self) -> &[DeribitSession] {
        &self.sessions
    }

    /// Local deadline at which the refresh timer must fire.
    #[must_use]
    pub fn refresh_deadline_ms(&self) -> Option<u64> {
        self.active()
            .map(|s| s.expires_at_ms.saturating_sub(self.refresh_threshold_secs * 1_000))
    }

    /// Applies an auth result for the given transition.
    ///
    /// Refresh mutates the active session in place (same id); every other
    /// transition creates a successor record and deactivates the predecessor.
    /// A fork inherits `subject_id` from its predecessor.
    pub fn apply_auth(
        &mut self,
        result: &DeribitAuthResult,
        transition: DeribitSessionTransition,
        subject_id: Option<u64>,
        session_name: Option<String>,
        now_ms: u64,
    ) -> DeribitSessionInfo {
        self.refresh_retry_armed = false;
        let expires_at_ms = now_ms + result.expires_in * 1_000;

        if transition == DeribitSessionTransition::Refresh
            && let Some(current) = self.sessions.iter_mut().rev().find(|s| s.active)
        {
            current.access_token = result.access_token.clone();
            current.refresh_token = result.refresh_token.clone();
            current.expires_at_ms = expires_at_ms;
            current.scope = result.scope.clone();
            current.transition = DeribitSessionTransition::Refresh;
            let info = DeribitSessionInfo::from(&*current);
            tracing::debug!(
                target: "deribit_client",
                session_id = info.id,
                expires_at_ms,
                "session.refreshed",
            );
            return info;
        }

        let prev = self.sessions.iter_mut().rev().find(|s| s.active);
        let (prev_id, inherited_subject) = match prev {
            Some(prev_session) => {
                prev_session.active = false;
                (Some(prev_session.id), prev_session.subject_id)
            }
            None => (None, None),
        };

        let subject_id = match transition {
            DeribitSessionTransition::Exchange => subject_id,
            DeribitSessionTransition::Fork => inherited_subject,
            _ => None,
        };

        let session = DeribitSession {
            id: self.next_id,
            prev_id,
            created_at_ms: now_ms,
            access_token: result.access_token.clone(),
            refresh_token: result.refresh_token.clone(),
            expires_at_ms,
            scope: result.scope.clone(),
            transition,
            subject_id,
            session_name: match transition {
                DeribitSessionTransition::Fork => session_name,
                _ => None,
            },
            active: true,
        };
        self.next_id += 1;

        let info = DeribitSessionInfo::from(&session);
        self.sessions.push(session);

        if info.prev_id.is_some() {
            tracing::info!(
                target: "deribit_client",
                session_id = info.id,
                prev_id = ?info.prev_id,
                transition = %info.transition,
                subject_id = ?info.subject_id,
                session_name = ?info.session_name,
                "session.transitioned",
            );
        } else {
            tracing::info!(
                target: "deribit_client",
                session_id = info.id,
                transition = %info.transition,
                "session.created",
            );
        }
        info
    }

    /// Marks the active session invalid and clears its token material.
    pub fn invalidate(&mut self) -> Option<DeribitSessionInfo> {
        let session = self.sessions.iter_mut().rev().find(|s| s.active)?;
        session.active = false;
        session.access_token.clear();
        session.refresh_token.clear();
        let info = DeribitSessionInfo::from(&*session);
        tracing::info!(
            target: "deribit_client",
            session_id = info.id,
            "session.invalidated",
        );
        Some(info)
    }

    /// Records a failed refresh.
    ///
    /// Returns `true` when a single retry should be scheduled; the second
    /// consecutive failure returns `false` and the caller escalates to
    /// reconnect-with-auth.
    pub fn on_refresh_failure(&mut self) -> bool {
        if self.refresh_retry_armed {
            self.refresh_retry_armed = false;
            false
        } else {
            self.refresh_retry_armed = true;
            true
        }
    }

    /// Builds `public/auth` params for a client-credentials grant.
    #[must_use]
    pub fn client_credentials_params(credential: &Credential) -> Value {
        json!({
            "grant_type": "client_credentials",
            "client_id": credential.client_id.as_str(),
            "client_secret": credential.secret(),
        })
    }

    /// Builds `public/auth` params for a refresh grant from the active session.
    #[must_use]
    pub fn refresh_params(&self) -> Option<Value> {
        self.refresh_token().map(|token| {
            json!({
                "grant_type": "refresh_token",
                "refresh_token": token,
            })
        })
    }

    /// Builds `public/auth` params for a token exchange (subaccount switch).
    #[must_use]
    pub fn exchange_params(refresh_token: &str, subject_id: u64) -> Value {
        json!({
            "grant_type": "exchange_token",
            "refresh_token": refresh_token,
            "subject_id": subject_id,
        })
    }

    /// Builds `public/auth` params for a token fork (named session).
    #[must_use]
    pub fn fork_params(refresh_token: &str, session_name: &str) -> Value {
        json!({
            "grant_type": "fork_token",
            "refresh_token": refresh_token,
            "session_name": session_name,
        })
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn auth_result(tag: &str) -> DeribitAuthResult {
        DeribitAuthResult {
            access_token: format!("at-{tag}"),
            refresh_token: format!("rt-{tag}"),
            expires_in: 900,
            scope: "session:default".to_string(),
            token_type: Some("bearer".to_string()),
        }
    }

    fn manager_with_initial() -> SessionManager {
        let mut manager = SessionManager::new(180);
        manager.apply_auth(
            &auth_result("initial"),
            DeribitSessionTransition::Initial,
            None,
            None,
            1_000,
        );
        manager
    }

    #[rstest]
    #[case(None, 180)]
    #[case(Some(0), 180)]
    #[case(Some(1), 1)]
    #[case(Some(899), 899)]
    #[case(Some(900), 180)]
    #[case(Some(10_000), 180)]
    fn test_refresh_threshold_validation(#[case] input: Option<u64>, #[case] expected: u64) {
        assert_eq!(validate_refresh_threshold(input), expected);
    }

    #[rstest]
    fn test_initial_auth_creates_active_session() {
        let manager = manager_with_initial();
        let session = manager.active().unwrap();
        assert_eq!(session.id, 1);
        assert_eq!(session.prev_id, None);
        assert_eq!(session.transition, DeribitSessionTransition::Initial);
        assert_eq!(session.expires_at_ms, 1_000 + 900_000);
        assert!(session.expires_at_ms > session.created_at_ms);
        assert_eq!(manager.access_token(), Some("at-initial"));
    }

    #[rstest]
    fn test_refresh_keeps_session_identity() {
        let mut manager = manager_with_initial();
        let info = manager.apply_auth(
            &auth_result("refreshed"),
            DeribitSessionTransition::Refresh,
            None,
            None,
            500_000,
        );
        assert_eq!(info.id, 1);
        assert_eq!(manager.history().len(), 1);
        assert_eq!(manager.access_token(), Some("at-refreshed"));
        assert_eq!(manager.active().unwrap().expires_at_ms, 500_000 + 900_000);
    }

    #[rstest]
    fn test_exchange_creates_successor_with_subject() {
        let mut manager = manager_with_initial();
        let info = manager.apply_auth(
            &auth_result("exchanged"),
            DeribitSessionTransition::Exchange,
            Some(10),
            None,
            2_000,
        );
        assert_eq!(info.id, 2);
        assert_eq!(info.prev_id, Some(1));
        assert_eq!(info.subject_id, Some(10));

        let sessions = manager.history();
        assert!(!sessions[0].active);
        assert!(sessions[1].active);
    }

    #[rstest]
    fn test_fork_inherits_subject_and_sets_name() {
        let mut manager = manager_with_initial();
        manager.apply_auth(
            &auth_result("exchanged"),
            DeribitSessionTransition::Exchange,
            Some(7),
            None,
            2_000,
        );
        let info = manager.apply_auth(
            &auth_result("forked"),
            DeribitSessionTransition::Fork,
            None,
            Some("hedger".to_string()),
            3_000,
        );
        assert_eq!(info.prev_id, Some(2));
        assert_eq!(info.subject_id, Some(7));
        assert_eq!(info.session_name.as_deref(), Some("hedger"));
    }

    #[rstest]
    fn test_at_most_one_active_session() {
        let mut manager = manager_with_initial();
        for i in 0..5u64 {
            manager.apply_auth(
                &auth_result(&format!("x{i}")),
                DeribitSessionTransition::Exchange,
                Some(i),
                None,
                10_000 + i,
            );
        }
        let active_count = manager.history().iter().filter(|s| s.active).count();
        assert_eq!(active_count, 1);

        // The prev chain walks back to the initial session.
        let mut current = manager.active().unwrap();
        let mut hops = 0;
        while let Some(prev_id) = current.prev_id {
            current = manager.history().iter().find(|s| s.id == prev_id).unwrap();
            hops += 1;
            assert!(hops <= manager.history().len());
        }
        assert_eq!(current.transition, DeribitSessionTransition::Initial);
    }

    #[rstest]
    fn test_invalidate_clears_tokens() {
        let mut manager = manager_with_initial();
        let info = manager.invalidate().unwrap();
        assert!(!info.active);
        assert!(manager.active().is_none());
        assert!(manager.access_token().is_none());
        assert_eq!(manager.history()[0].access_token, "");
    }

    #[rstest]
    fn test_refresh_deadline_respects_threshold() {
        let manager = manager_with_initial();
        // expires at 901_000; threshold 180 s.
        assert_eq!(manager.refresh_deadline_ms(), Some(901_000 - 180_000));
    }

    #[rstest]
    fn test_refresh_failure_allows_single_retry() {
        let mut manager = manager_with_initial();
        assert!(manager.on_refresh_failure());
        assert!(!manager.on_refresh_failure());
        // A successful auth clears the armed state again.
        manager.apply_auth(
            &auth_result("ok"),
            DeribitSessionTransition::Refresh,
            None,
            None,
            4_000,
        );
        assert!(manager.on_refresh_failure());
    }

    #[rstest]
    fn test_grant_payloads() {
        let credential = Credential::new("cid".to_string(), "sec".to_string());
        let creds = SessionManager::client_credentials_params(&credential);
        assert_eq!(creds["grant_type"], "client_credentials");
        assert_eq!(creds["client_id"], "cid");

        let manager = manager_with_initial();
        let refresh = manager.refresh_params().unwrap();
        assert_eq!(refresh["grant_type"], "refresh_token");
        assert_eq!(refresh["refresh_token"], "rt-initial");

        let exchange = SessionManager::exchange_params("rt", 10);
        assert_eq!(exchange["grant_type"], "exchange_token");
        assert_eq!(exchange["subject_id"], 10);

        let fork = SessionManager::fork_params("rt", "alpha");
        assert_eq!(fork["grant_type"], "fork_token");
        assert_eq!(fork["session_name"], "alpha");
    }
}
