//! Storage health checks and auto-repair for master data
//!
//! Two entry points:
//! - [`HealthMonitor::quick_health_check`]: read-only, synchronous, cheap
//! - [`HealthMonitor::run_health_check`]: inspects every tracked key and
//!   repairs what it can. Only one full run is ever in flight.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::catalog::{Catalog, CategoryDef};
use crate::clock::{Clock, SystemClock};
use crate::config::KeyNamespace;
use crate::envelope::normalize;
use crate::error::{HealthIssue, IssueKind};
use crate::kv::{read_value, write_value, KeyValueStore, RawValue};
use crate::migration::{from_canonical_rows, MigrationGate};
use crate::mode::ModeResolver;
use crate::remote::{CanonicalStore, Order};
use crate::schedule::{ScheduleError, ScheduledTask};

/// Outcome of one full health check. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub is_healthy: bool,
    pub fixed_issues: Vec<HealthIssue>,
    pub checked_keys: Vec<String>,
    pub errors: Vec<HealthIssue>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    Idle,
    Checking,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub enum HealthRun {
    Completed(Arc<HealthCheckResult>),
    /// Another run was in flight; nothing was read or written
    AlreadyRunning,
}

impl HealthRun {
    #[must_use]
    pub fn result(&self) -> Option<&Arc<HealthCheckResult>> {
        match self {
            Self::Completed(result) => Some(result),
            Self::AlreadyRunning => None,
        }
    }
}

/// Resets the in-progress flag on every exit path.
struct CheckGuard<'a>(&'a AtomicBool);

impl<'a> CheckGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CheckGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Findings {
    fixed: Vec<HealthIssue>,
    errors: Vec<HealthIssue>,
    checked: Vec<String>,
}

pub struct HealthMonitor {
    kv: Arc<dyn KeyValueStore>,
    catalog: Arc<Catalog>,
    namespace: KeyNamespace,
    mode: ModeResolver,
    gate: MigrationGate,
    remote: Option<Arc<dyn CanonicalStore>>,
    clock: Arc<dyn Clock>,
    in_progress: AtomicBool,
    state: Mutex<MonitorState>,
    last: Mutex<Option<Arc<HealthCheckResult>>>,
}

impl HealthMonitor {
    pub fn new(kv: Arc<dyn KeyValueStore>, catalog: Arc<Catalog>, namespace: KeyNamespace) -> Self {
        Self {
            mode: ModeResolver::new(kv.clone(), &namespace),
            gate: MigrationGate::new(kv.clone(), &namespace),
            kv,
            catalog,
            namespace,
            remote: None,
            clock: Arc::new(SystemClock),
            in_progress: AtomicBool::new(false),
            state: Mutex::new(MonitorState::Idle),
            last: Mutex::new(None),
        }
    }

    /// Use the canonical store as a repair source once migration has run.
    #[must_use]
    pub fn with_remote(mut self, remote: Arc<dyn CanonicalStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn state(&self) -> MonitorState {
        *self.state.lock()
    }

    #[must_use]
    pub fn last_result(&self) -> Option<Arc<HealthCheckResult>> {
        self.last.lock().clone()
    }

    /// Cheap read-only check used by the periodic monitor.
    #[must_use]
    pub fn quick_health_check(&self) -> bool {
        if !self.mode.flag_is_sane() {
            return false;
        }
        let custom_only = self.mode.is_custom_only();
        self.catalog.iter().all(|def| {
            let key = if custom_only {
                self.namespace.custom_key(&def.name)
            } else {
                self.namespace.legacy_key(&def.name)
            };
            match read_value(self.kv.as_ref(), &key) {
                // Anything the full check would rewrite or reseed fails here too.
                Ok(RawValue::Parsed(v)) => normalize(v, def.shape).is_ok_and(|n| {
                    !n.needs_rewrite()
                        && (custom_only || !n.items.is_empty() || def.defaults.is_empty())
                }),
                // Custom keys may be absent; the fallback policy covers them.
                Ok(RawValue::Absent) => custom_only,
                Ok(RawValue::Unparsable(_)) | Err(_) => false,
            }
        })
    }

    /// Full inspection with auto-repair.
    ///
    /// Never fails: anything that could not be repaired ends up in
    /// `errors` and the result is marked unhealthy.
    pub async fn run_health_check(&self) -> HealthRun {
        let Some(_guard) = CheckGuard::acquire(&self.in_progress) else {
            tracing::debug!("Health check already running, skipping");
            return HealthRun::AlreadyRunning;
        };
        *self.state.lock() = MonitorState::Checking;

        let mut findings = Findings::default();
        self.check_mode_flag(&mut findings);

        if self.mode.is_custom_only() {
            for def in self.catalog.iter() {
                self.check_custom(def, &mut findings);
            }
        } else {
            for def in self.catalog.iter() {
                self.check_mixed(def, &mut findings).await;
            }
        }

        let result = Arc::new(HealthCheckResult {
            is_healthy: findings.errors.is_empty(),
            fixed_issues: findings.fixed,
            checked_keys: findings.checked,
            errors: findings.errors,
            timestamp: self.clock.now(),
        });

        if result.is_healthy {
            tracing::info!(
                "Health check passed ({} keys, {} fixed)",
                result.checked_keys.len(),
                result.fixed_issues.len()
            );
        } else {
            for issue in &result.errors {
                tracing::error!("Health check error: {}", issue);
            }
        }

        *self.state.lock() = if result.is_healthy {
            MonitorState::Healthy
        } else {
            MonitorState::Unhealthy
        };
        *self.last.lock() = Some(result.clone());
        HealthRun::Completed(result)
    }

    /// Run the quick check every `interval`, escalating to a full check when
    /// it fails. Full results are published on the returned channel.
    pub fn spawn_periodic(
        self: &Arc<Self>,
        interval: Duration,
    ) -> Result<(ScheduledTask, watch::Receiver<Option<Arc<HealthCheckResult>>>), ScheduleError> {
        let (tx, rx) = watch::channel(self.last_result());
        let tx = Arc::new(tx);
        let monitor = Arc::clone(self);
        let task = ScheduledTask::every("master-data-health", interval, move || {
            let monitor = monitor.clone();
            let tx = tx.clone();
            async move {
                if monitor.quick_health_check() {
                    return ControlFlow::Continue(());
                }
                tracing::warn!("Quick health check failed, running full check");
                if let HealthRun::Completed(result) = monitor.run_health_check().await {
                    if tx.send(Some(result)).is_err() {
                        return ControlFlow::Break(());
                    }
                }
                ControlFlow::Continue(())
            }
        })?;
        Ok((task, rx))
    }

    fn check_mode_flag(&self, findings: &mut Findings) {
        let key = self.mode.key().to_string();
        findings.checked.push(key.clone());
        if self.mode.flag_is_sane() {
            return;
        }
        match self.mode.reset_to_defaults() {
            Ok(()) => findings.fixed.push(HealthIssue::new(
                IssueKind::InvalidMode,
                key,
                "unknown mode flag reset to mixed",
            )),
            Err(e) => findings
                .errors
                .push(HealthIssue::new(IssueKind::Storage, key, e.to_string())),
        }
    }

    /// `custom_only`: drop corrupt entries so the fallback policy applies.
    /// Defaults are never seeded here.
    fn check_custom(&self, def: &CategoryDef, findings: &mut Findings) {
        for key in [
            self.namespace.custom_key(&def.name),
            self.namespace.legacy_key(&def.name),
        ] {
            findings.checked.push(key.clone());
            let reason = match read_value(self.kv.as_ref(), &key) {
                Ok(RawValue::Absent) => continue,
                Ok(RawValue::Parsed(v)) => match normalize(v, def.shape) {
                    Ok(n) if n.needs_rewrite() => {
                        self.write_verified(
                            &key,
                            &n.items,
                            IssueKind::Envelope,
                            "normalized to raw collection",
                            findings,
                        );
                        continue;
                    }
                    Ok(_) => continue,
                    Err(e) => e.to_string(),
                },
                Ok(RawValue::Unparsable(_)) => "not valid JSON".to_string(),
                Err(e) => {
                    findings
                        .errors
                        .push(HealthIssue::new(IssueKind::Storage, &key, e.to_string()));
                    continue;
                }
            };
            match self.kv.remove(&key) {
                Ok(()) => findings.fixed.push(HealthIssue::new(
                    IssueKind::Parse,
                    &key,
                    format!("removed malformed entry ({reason})"),
                )),
                Err(e) => findings
                    .errors
                    .push(HealthIssue::new(IssueKind::Storage, &key, e.to_string())),
            }
        }
    }

    async fn check_mixed(&self, def: &CategoryDef, findings: &mut Findings) {
        let key = self.namespace.legacy_key(&def.name);
        findings.checked.push(key.clone());

        let kind = match read_value(self.kv.as_ref(), &key) {
            Ok(RawValue::Parsed(v)) => match normalize(v, def.shape) {
                Ok(n) if !n.items.is_empty() => {
                    if n.needs_rewrite() {
                        let kind = if n.was_wrapped {
                            IssueKind::Envelope
                        } else {
                            IssueKind::Duplicate
                        };
                        self.write_verified(&key, &n.items, kind, "normalized to raw collection", findings);
                    }
                    return;
                }
                Ok(_) if def.defaults.is_empty() => return,
                Ok(_) => IssueKind::Missing,
                Err(_) => IssueKind::Parse,
            },
            Ok(RawValue::Absent) => IssueKind::Missing,
            Ok(RawValue::Unparsable(_)) => IssueKind::Parse,
            Err(e) => {
                findings
                    .errors
                    .push(HealthIssue::new(IssueKind::Storage, &key, e.to_string()));
                return;
            }
        };

        let (items, source) = self.recover(def, findings).await;
        self.write_verified(&key, &items, kind, &format!("restored from {source}"), findings);
    }

    /// Pick replacement data: alias keys, then the canonical store, then
    /// built-in defaults.
    async fn recover(&self, def: &CategoryDef, findings: &mut Findings) -> (Vec<Value>, String) {
        for alias in &def.aliases {
            if let Ok(RawValue::Parsed(v)) = read_value(self.kv.as_ref(), alias) {
                if let Ok(n) = normalize(v, def.shape) {
                    if !n.items.is_empty() {
                        return (n.items, alias.clone());
                    }
                }
            }
        }

        if let Some(remote) = self.remote.as_ref().filter(|_| self.gate.is_complete()) {
            match remote
                .select(&def.table, &[], Some(&Order::asc("display_order")))
                .await
            {
                Ok(rows) if !rows.is_empty() => {
                    return (
                        from_canonical_rows(rows, def.shape),
                        format!("canonical table {}", def.table),
                    );
                }
                Ok(_) => {}
                Err(e) => findings.errors.push(HealthIssue::new(
                    IssueKind::Remote,
                    &def.table,
                    e.to_string(),
                )),
            }
        }

        (def.defaults.clone(), "defaults".to_string())
    }

    fn write_verified(
        &self,
        key: &str,
        items: &[Value],
        kind: IssueKind,
        message: &str,
        findings: &mut Findings,
    ) {
        let expected = Value::Array(items.to_vec());
        if let Err(e) = write_value(self.kv.as_ref(), key, &expected) {
            findings
                .errors
                .push(HealthIssue::new(IssueKind::Storage, key, e.to_string()));
            return;
        }
        match read_value(self.kv.as_ref(), key) {
            Ok(RawValue::Parsed(stored)) if stored == expected => {
                tracing::info!("Repaired {}: {}", key, message);
                findings.fixed.push(HealthIssue::new(kind, key, message));
            }
            _ => {
                tracing::error!("Repair of {} did not stick", key);
                findings.errors.push(HealthIssue::new(
                    IssueKind::WriteVerification,
                    key,
                    "read-back after repair does not match",
                ));
            }
        }
    }
}
