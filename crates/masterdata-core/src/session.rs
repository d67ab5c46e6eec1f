//! Portal session lifecycle.
//!
//! [`SessionVault`] is the storage layer: it reads and writes the session and
//! remember-me records and never makes decisions. [`SessionManager`] owns
//! the state machine (`LoggedOut -> LoggingIn -> Authenticated`), talks to
//! the [`Authenticator`] and sends the user back to login through the
//! [`Navigator`] when a session ends.
//!
//! A malformed stored record reads as "no session", never as an error.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::clock::{Clock, SystemClock};
use crate::config::{KeyNamespace, SessionSettings};
use crate::error::AppError;
use crate::kv::{KeyValueStore, KvError};
use crate::remote::RemoteError;
use crate::schedule::{ScheduleError, ScheduledTask};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub user_id: String,
    pub organization_name: String,
    pub organization_id: String,
    pub entity_type: String,
    pub email: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub login_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expiry_time: DateTime<Utc>,
    pub session_token: String,
}

impl SessionRecord {
    /// Expired from the expiry instant onward.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry_time
    }

    fn is_well_formed(&self) -> bool {
        !self.user_id.is_empty()
            && !self.session_token.is_empty()
            && self.expiry_time > self.login_time
    }
}

/// Pre-fills the login form. Never authenticates anything on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RememberMeRecord {
    pub identifier: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expiry_date: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
    pub remember_me: bool,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .field("remember_me", &self.remember_me)
            .finish()
    }
}

/// Identity handed back by a successful sign-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthGrant {
    pub user_id: String,
    pub organization_id: String,
    pub organization_name: String,
    pub entity_type: String,
    pub email: String,
    pub session_token: String,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthGrant, RemoteError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogoutReason {
    Expired,
    Explicit,
    Invalid,
}

pub trait Navigator: Send + Sync {
    fn redirect_to_login(&self, reason: LogoutReason);
}

/// Navigator for headless callers; only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn redirect_to_login(&self, reason: LogoutReason) {
        tracing::info!("Redirect to login ({:?})", reason);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    LoggedOut,
    LoggingIn,
    Authenticated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Valid(SessionRecord),
    Expired,
    Missing,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("a login is already in progress")]
    LoginInProgress,
    #[error("authentication failed: {0}")]
    AuthFailed(RemoteError),
    #[error("session storage error: {0}")]
    Storage(#[from] KvError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHealthStatus {
    pub organization_count: usize,
    pub has_session: bool,
    pub has_remember_me: bool,
    pub session_ttl_secs: u64,
    pub remember_me_ttl_days: u64,
    pub revalidate_interval_secs: u64,
}

/// Storage access for session-related keys.
pub struct SessionVault {
    kv: Arc<dyn KeyValueStore>,
    session_key: String,
    remember_me_key: String,
    organizations_key: String,
    settings: SessionSettings,
}

impl SessionVault {
    pub fn new(kv: Arc<dyn KeyValueStore>, namespace: &KeyNamespace, settings: SessionSettings) -> Self {
        Self {
            kv,
            session_key: namespace.session_key.clone(),
            remember_me_key: namespace.remember_me_key.clone(),
            organizations_key: namespace.organizations_key.clone(),
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Stored session, or `None` when absent, unreadable or malformed.
    #[must_use]
    pub fn load(&self) -> Option<SessionRecord> {
        let raw = match self.kv.get(&self.session_key) {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!("Could not read session: {}", e);
                return None;
            }
        };
        match serde_json::from_str::<SessionRecord>(&raw) {
            Ok(record) if record.is_well_formed() => Some(record),
            Ok(_) => {
                tracing::warn!("Stored session is incomplete, treating as logged out");
                None
            }
            Err(e) => {
                tracing::warn!("Stored session is malformed, treating as logged out: {}", e);
                None
            }
        }
    }

    pub fn store(&self, record: &SessionRecord) -> Result<(), KvError> {
        let text = serde_json::to_string(record)?;
        self.kv.set(&self.session_key, &text)
    }

    pub fn clear_session(&self) -> Result<(), KvError> {
        self.kv.remove(&self.session_key)
    }

    /// Remove the configured auth-related keys. Attempts every key and
    /// reports the first failure.
    pub fn clear_related(&self) -> Result<(), KvError> {
        let mut first_error = None;
        for key in &self.settings.related_keys {
            if let Err(e) = self.kv.remove(key) {
                tracing::warn!("Could not remove {}: {}", key, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn remember(&self, identifier: &str, now: DateTime<Utc>) -> Result<(), KvError> {
        let record = RememberMeRecord {
            identifier: identifier.to_string(),
            expiry_date: now
                .checked_add_signed(self.settings.remember_me_ttl())
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        let text = serde_json::to_string(&record)?;
        self.kv.set(&self.remember_me_key, &text)
    }

    pub fn forget(&self) -> Result<(), KvError> {
        self.kv.remove(&self.remember_me_key)
    }

    /// Identifier from a live remember-me record. Expired or malformed
    /// records are removed.
    #[must_use]
    pub fn remembered_identifier(&self, now: DateTime<Utc>) -> Option<String> {
        let raw = self.kv.get(&self.remember_me_key).ok()??;
        match serde_json::from_str::<RememberMeRecord>(&raw) {
            Ok(record) if now < record.expiry_date => Some(record.identifier),
            _ => {
                if let Err(e) = self.forget() {
                    tracing::warn!("Could not remove stale remember-me record: {}", e);
                }
                None
            }
        }
    }

    #[must_use]
    pub fn has_remember_me(&self) -> bool {
        matches!(self.kv.contains(&self.remember_me_key), Ok(true))
    }

    /// Number of registered organizations. Unreadable data counts as zero.
    #[must_use]
    pub fn organization_count(&self) -> usize {
        let Ok(Some(raw)) = self.kv.get(&self.organizations_key) else {
            return 0;
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(items)) => items.len(),
            Ok(Value::Object(map)) => map.len(),
            _ => 0,
        }
    }

    #[must_use]
    pub fn health_status(&self) -> SessionHealthStatus {
        SessionHealthStatus {
            organization_count: self.organization_count(),
            has_session: self.load().is_some(),
            has_remember_me: self.has_remember_me(),
            session_ttl_secs: self.settings.session_ttl_secs,
            remember_me_ttl_days: self.settings.remember_me_ttl_days,
            revalidate_interval_secs: self.settings.revalidate_interval_secs,
        }
    }
}

/// Returns the state to `LoggedOut` if a login attempt ends early.
struct LoginAttempt<'a>(&'a Mutex<SessionState>);

impl Drop for LoginAttempt<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        if *state == SessionState::LoggingIn {
            *state = SessionState::LoggedOut;
        }
    }
}

pub struct SessionManager {
    vault: SessionVault,
    authenticator: Arc<dyn Authenticator>,
    navigator: Arc<dyn Navigator>,
    clock: Arc<dyn Clock>,
    state: Mutex<SessionState>,
}

impl SessionManager {
    pub fn new(
        vault: SessionVault,
        authenticator: Arc<dyn Authenticator>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        let state = if vault.load().is_some() {
            SessionState::Authenticated
        } else {
            SessionState::LoggedOut
        };
        Self {
            vault,
            authenticator,
            navigator,
            clock: Arc::new(SystemClock),
            state: Mutex::new(state),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    #[must_use]
    pub fn vault(&self) -> &SessionVault {
        &self.vault
    }

    pub async fn login(&self, credentials: Credentials) -> Result<SessionRecord, SessionError> {
        let email = credentials.email.trim().to_string();
        if email.is_empty() || !email.contains('@') {
            return Err(SessionError::InvalidCredentials(
                "a valid email address is required".to_string(),
            ));
        }
        if credentials.password.is_empty() {
            return Err(SessionError::InvalidCredentials(
                "password is required".to_string(),
            ));
        }

        {
            let mut state = self.state.lock();
            if *state == SessionState::LoggingIn {
                return Err(SessionError::LoginInProgress);
            }
            *state = SessionState::LoggingIn;
        }
        let _attempt = LoginAttempt(&self.state);

        let grant = self
            .authenticator
            .sign_in(&email, &credentials.password)
            .await
            .map_err(|e| {
                tracing::warn!("Sign-in failed: {}", e);
                SessionError::AuthFailed(e)
            })?;

        let now = self.clock.now();
        let record = SessionRecord {
            user_id: grant.user_id,
            organization_name: grant.organization_name,
            organization_id: grant.organization_id,
            entity_type: grant.entity_type,
            email: grant.email,
            login_time: now,
            expiry_time: now
                .checked_add_signed(self.vault.settings().session_ttl())
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            session_token: grant.session_token,
        };
        // Remember-me first: a failure here must not leave a live session behind.
        if credentials.remember_me {
            self.vault.remember(&email, now)?;
        } else {
            self.vault.forget()?;
        }
        self.vault.store(&record)?;

        *self.state.lock() = SessionState::Authenticated;
        tracing::info!("User {} logged in", record.user_id);
        Ok(record)
    }

    /// Live session, if any. Read-only; expiry is handled by `revalidate`.
    #[must_use]
    pub fn current_session(&self) -> Option<SessionRecord> {
        let now = self.clock.now();
        self.vault.load().filter(|r| !r.is_expired_at(now))
    }

    /// Re-check the stored session against the clock and end it if expired.
    pub fn revalidate(&self) -> SessionStatus {
        let Some(record) = self.vault.load() else {
            let was_authenticated = {
                let mut state = self.state.lock();
                let was = *state == SessionState::Authenticated;
                if was {
                    *state = SessionState::LoggedOut;
                }
                was
            };
            if was_authenticated {
                tracing::warn!("Session record disappeared or became invalid");
                self.navigator.redirect_to_login(LogoutReason::Invalid);
            }
            return SessionStatus::Missing;
        };

        if record.is_expired_at(self.clock.now()) {
            tracing::info!("Session for {} expired", record.user_id);
            if let Err(e) = self.vault.clear_session() {
                tracing::warn!("Could not clear expired session: {}", e);
            }
            *self.state.lock() = SessionState::LoggedOut;
            self.navigator.redirect_to_login(LogoutReason::Expired);
            return SessionStatus::Expired;
        }

        *self.state.lock() = SessionState::Authenticated;
        SessionStatus::Valid(record)
    }

    /// Session for an action that needs one. An expired session is ended on
    /// the way, exactly as [`SessionManager::revalidate`] does.
    pub fn require_session(&self) -> Result<SessionRecord, AppError> {
        match self.revalidate() {
            SessionStatus::Valid(record) => Ok(record),
            SessionStatus::Expired | SessionStatus::Missing => Err(AppError::session_expired()),
        }
    }

    /// Revalidate on the configured interval until the session ends.
    pub fn start_revalidation(self: &Arc<Self>) -> Result<ScheduledTask, ScheduleError> {
        let manager = Arc::clone(self);
        let interval = self.vault.settings().revalidate_interval();
        ScheduledTask::every("session-revalidation", interval, move || {
            let manager = manager.clone();
            async move {
                match manager.revalidate() {
                    SessionStatus::Valid(_) => ControlFlow::Continue(()),
                    SessionStatus::Expired | SessionStatus::Missing => ControlFlow::Break(()),
                }
            }
        })
    }

    /// Clear the session and related keys, then redirect. The redirect
    /// happens even when a removal fails.
    pub fn logout(&self) -> Result<(), SessionError> {
        let session = self.vault.clear_session();
        let related = self.vault.clear_related();
        *self.state.lock() = SessionState::LoggedOut;
        self.navigator.redirect_to_login(LogoutReason::Explicit);
        tracing::info!("User logged out");
        session?;
        related?;
        Ok(())
    }

    #[must_use]
    pub fn remembered_identifier(&self) -> Option<String> {
        self.vault.remembered_identifier(self.clock.now())
    }

    #[must_use]
    pub fn get_health_status(&self) -> SessionHealthStatus {
        self.vault.health_status()
    }
}
