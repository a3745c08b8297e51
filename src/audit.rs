//! src/audit.rs
//! Dziennik audytu (append-only) + watchdog zdrowia detektorów.
//!
//! Każdy werdykt, decyzja i wynik akcji dostaje monotoniczny numer
//! sekwencyjny per (guild, actor) – same znaczniki czasu nie wystarczą
//! przy współbieżnych piszących. Zapis jest best-effort: padnięty backend
//! nie ma prawa wywrócić pipeline'u, liczymy błędy i alertujemy.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::arbiter::Decision;
use crate::config::WatchdogConfig;
use crate::detect::{Severity, Verdict};
use crate::executor::ActionResult;
use crate::storage::Storage;

/* =========================================
   Alerty do adminów
   ========================================= */

/// Alert bezpieczeństwa (incydent) vs zdrowotny (awaria nas samych) –
/// spięte osobno, żeby operator odróżniał atak od zepsutego detektora.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Security,
    Health,
}

/// Fire-and-forget do kanału adminów; transport żyje u kolaboratora.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn notify_admins(
        &self,
        guild_id: Option<u64>,
        kind: AlertKind,
        severity: Severity,
        message: String,
    );
}

/// Domyślny alerter: strukturalny log. Produkcja podpina własny transport.
pub struct TracingAlerter;

#[async_trait]
impl Alerter for TracingAlerter {
    async fn notify_admins(
        &self,
        guild_id: Option<u64>,
        kind: AlertKind,
        severity: Severity,
        message: String,
    ) {
        warn!(?guild_id, ?kind, ?severity, %message, "admin alert");
    }
}

/* =========================================
   Dziennik audytu
   ========================================= */

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum AuditRecord {
    Verdict { verdict: Verdict },
    Decision { decision: Decision },
    /// Werdykt doklejony do żywej decyzji zamiast nowej akcji.
    Coalesced { decision_id: u64, verdict: Verdict },
    Outcome {
        guild_id: u64,
        actor_id: Option<u64>,
        result: ActionResult,
    },
}

pub struct AuditLog {
    storage: Arc<dyn Storage>,
    seq: DashMap<(u64, Option<u64>), u64>,
    write_errors: AtomicU64,
}

impl AuditLog {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            seq: DashMap::new(),
            write_errors: AtomicU64::new(0),
        }
    }

    fn next_seq(&self, guild_id: u64, actor_id: Option<u64>) -> u64 {
        let mut e = self.seq.entry((guild_id, actor_id)).or_insert(0);
        *e += 1;
        *e
    }

    fn key(guild_id: u64, actor_id: Option<u64>, seq: u64) -> String {
        match actor_id {
            Some(a) => format!("audit/{guild_id}/actor/{a}/{seq:012}"),
            None => format!("audit/{guild_id}/guild/{seq:012}"),
        }
    }

    async fn append(&self, guild_id: u64, actor_id: Option<u64>, record: AuditRecord) {
        let seq = self.next_seq(guild_id, actor_id);
        let key = Self::key(guild_id, actor_id, seq);
        let value = match serde_json::to_value(&record) {
            Ok(v) => v,
            Err(e) => {
                warn!(error=?e, %key, "audit record serialization failed");
                self.write_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if let Err(e) = self.storage.put(&key, value).await {
            // best-effort: padnięty backend nie zatrzymuje mitygacji
            warn!(error=?e, %key, "audit append failed");
            self.write_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn record_verdict(&self, verdict: &Verdict) {
        self.append(
            verdict.guild_id,
            verdict.actor_id,
            AuditRecord::Verdict {
                verdict: verdict.clone(),
            },
        )
        .await;
    }

    pub async fn record_decision(&self, decision: &Decision) {
        self.append(
            decision.guild_id,
            decision.actor_id,
            AuditRecord::Decision {
                decision: decision.clone(),
            },
        )
        .await;
    }

    pub async fn record_coalesced(&self, decision_id: u64, verdict: &Verdict) {
        self.append(
            verdict.guild_id,
            verdict.actor_id,
            AuditRecord::Coalesced {
                decision_id,
                verdict: verdict.clone(),
            },
        )
        .await;
    }

    pub async fn record_result(&self, decision: &Decision, result: &ActionResult) {
        self.append(
            decision.guild_id,
            decision.actor_id,
            AuditRecord::Outcome {
                guild_id: decision.guild_id,
                actor_id: decision.actor_id,
                result: result.clone(),
            },
        )
        .await;
    }

    /// Pełna ścieżka audytowa gildii w porządku przyczynowym per aktor.
    pub async fn records_for(&self, guild_id: u64) -> Vec<AuditRecord> {
        let rows = match self
            .storage
            .scan_prefix(&format!("audit/{guild_id}/"))
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error=?e, guild_id, "audit scan failed");
                return Vec::new();
            }
        };
        rows.into_iter()
            .filter_map(|(key, v)| match serde_json::from_value::<AuditRecord>(v) {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!(error=?e, %key, "skipping corrupt audit record");
                    None
                }
            })
            .collect()
    }

    pub async fn coalesced_count(&self, guild_id: u64) -> usize {
        self.records_for(guild_id)
            .await
            .iter()
            .filter(|r| matches!(r, AuditRecord::Coalesced { .. }))
            .count()
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }
}

/* =========================================
   Watchdog
   ========================================= */

const ERROR_RATE_WINDOW: Duration = Duration::from_secs(300);
/// "Eventy płyną" = coś przyszło w ciągu ostatnich 5 minut.
const EVENTS_FLOWING_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct DetectorHealth {
    registered: Instant,
    verdicts: u64,
    errors_total: u64,
    recent_errors: VecDeque<Instant>,
    last_verdict: Option<Instant>,
    last_alert: Option<Instant>,
}

impl DetectorHealth {
    fn new(now: Instant) -> Self {
        Self {
            registered: now,
            verdicts: 0,
            errors_total: 0,
            recent_errors: VecDeque::new(),
            last_verdict: None,
            last_alert: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectorStatus {
    pub name: String,
    pub verdicts: u64,
    pub errors: u64,
    pub last_verdict_age_secs: Option<u64>,
    pub healthy: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub uptime_secs: u64,
    pub events_seen: u64,
    pub audit_write_errors: u64,
    pub detectors: Vec<DetectorStatus>,
}

/// Śledzi zdrowie detektorów: rolling error-rate i czas ostatniego werdyktu.
/// Detektor milczący przy płynących eventach albo sypiący błędami dostaje
/// alert ZDROWOTNY – osobny od alertów bezpieczeństwa.
pub struct Watchdog {
    cfg: WatchdogConfig,
    alerter: Arc<dyn Alerter>,
    started: Instant,
    events_seen: AtomicU64,
    /// Milisekundy od startu do ostatniego eventu (0 = nic nie przyszło).
    last_event_ms: AtomicU64,
    detectors: DashMap<String, DetectorHealth>,
    audit_errors_seen: AtomicU64,
}

impl Watchdog {
    pub fn new(cfg: WatchdogConfig, alerter: Arc<dyn Alerter>) -> Self {
        Self {
            cfg,
            alerter,
            started: Instant::now(),
            events_seen: AtomicU64::new(0),
            last_event_ms: AtomicU64::new(0),
            detectors: DashMap::new(),
            audit_errors_seen: AtomicU64::new(0),
        }
    }

    pub fn register(&self, name: &str) {
        self.detectors
            .entry(name.to_string())
            .or_insert_with(|| DetectorHealth::new(Instant::now()));
    }

    pub fn note_event(&self) {
        self.events_seen.fetch_add(1, Ordering::Relaxed);
        self.last_event_ms.store(
            self.started.elapsed().as_millis() as u64,
            Ordering::Relaxed,
        );
    }

    pub fn note_verdict(&self, name: &str) {
        let now = Instant::now();
        let mut h = self
            .detectors
            .entry(name.to_string())
            .or_insert_with(|| DetectorHealth::new(now));
        h.verdicts += 1;
        h.last_verdict = Some(now);
    }

    pub fn note_error(&self, name: &str) {
        let now = Instant::now();
        let mut h = self
            .detectors
            .entry(name.to_string())
            .or_insert_with(|| DetectorHealth::new(now));
        h.errors_total += 1;
        h.recent_errors.push_back(now);
        while let Some(front) = h.recent_errors.front() {
            if now.duration_since(*front) > ERROR_RATE_WINDOW {
                h.recent_errors.pop_front();
            } else {
                break;
            }
        }
    }

    /// Okresowy przegląd; task startuje w bootstrapie silnika.
    pub fn spawn_health_task(this: &Arc<Self>, audit: Arc<AuditLog>) {
        let weak = Arc::downgrade(this);
        let interval_secs = this.cfg.check_interval_secs.max(1);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                if let Some(strong) = weak.upgrade() {
                    strong.health_check(&audit).await;
                } else {
                    break;
                }
            }
        });
    }

    pub async fn health_check(&self, audit: &AuditLog) {
        let now = Instant::now();
        let events_flowing = self.events_seen.load(Ordering::Relaxed) > 0 && {
            let last_ms = self.last_event_ms.load(Ordering::Relaxed);
            self.started.elapsed().saturating_sub(Duration::from_millis(last_ms))
                < EVENTS_FLOWING_WINDOW
        };

        let mut alerts: Vec<String> = Vec::new();
        for mut entry in self.detectors.iter_mut() {
            let name = entry.key().clone();
            let h = entry.value_mut();

            let in_cooldown = h
                .last_alert
                .map(|t| {
                    now.duration_since(t)
                        < Duration::from_secs(self.cfg.alert_cooldown_secs)
                })
                .unwrap_or(false);
            if in_cooldown {
                continue;
            }

            let burst = h.recent_errors.len() as u32 >= self.cfg.error_burst;
            let silent_since = h.last_verdict.unwrap_or(h.registered);
            let silent = events_flowing
                && now.duration_since(silent_since)
                    > Duration::from_secs(self.cfg.silent_after_secs);

            if burst {
                h.last_alert = Some(now);
                alerts.push(format!(
                    "detector `{name}` error burst: {} errors in the last 5 min",
                    h.recent_errors.len()
                ));
            } else if silent {
                h.last_alert = Some(now);
                alerts.push(format!(
                    "detector `{name}` has produced no verdicts for an unusually long span while events are flowing"
                ));
            }
        }

        // osobna ścieżka: sypiące zapisy audytu
        let audit_errors = audit.write_errors();
        let seen = self.audit_errors_seen.swap(audit_errors, Ordering::Relaxed);
        if audit_errors > seen {
            alerts.push(format!(
                "audit backend dropped {} writes since last check",
                audit_errors - seen
            ));
        }

        for msg in alerts {
            self.alerter
                .notify_admins(None, AlertKind::Health, Severity::High, msg)
                .await;
        }
    }

    pub fn status_report(&self, audit: &AuditLog) -> StatusReport {
        let now = Instant::now();
        let detectors = self
            .detectors
            .iter()
            .map(|e| {
                let h = e.value();
                DetectorStatus {
                    name: e.key().clone(),
                    verdicts: h.verdicts,
                    errors: h.errors_total,
                    last_verdict_age_secs: h
                        .last_verdict
                        .map(|t| now.duration_since(t).as_secs()),
                    healthy: (h.recent_errors.len() as u32) < self.cfg.error_burst,
                }
            })
            .collect();
        StatusReport {
            uptime_secs: now.duration_since(self.started).as_secs(),
            events_seen: self.events_seen.load(Ordering::Relaxed),
            audit_write_errors: audit.write_errors(),
            detectors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, StorageError};
    use serde_json::Value;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingAlerter {
        alerts: Mutex<Vec<(AlertKind, String)>>,
    }

    #[async_trait]
    impl Alerter for RecordingAlerter {
        async fn notify_admins(
            &self,
            _guild_id: Option<u64>,
            kind: AlertKind,
            _severity: Severity,
            message: String,
        ) {
            self.alerts.lock().await.push((kind, message));
        }
    }

    fn verdict(guild: u64, actor: Option<u64>) -> Verdict {
        use crate::detect::{Action, Evidence};
        Verdict {
            detector: "spam".into(),
            guild_id: guild,
            actor_id: actor,
            severity: Severity::Medium,
            action: Action::Mute,
            reason: "r".into(),
            evidence: Evidence::default(),
            ts: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn audit_sequence_is_monotonic_per_actor() {
        let audit = AuditLog::new(Arc::new(MemoryStorage::default()));
        for _ in 0..3 {
            audit.record_verdict(&verdict(1, Some(7))).await;
        }
        audit.record_verdict(&verdict(1, None)).await;

        let records = audit.records_for(1).await;
        assert_eq!(records.len(), 4);
        // scan po prefiksie oddaje porządek zapisu per aktor
        let actor_records: Vec<_> = records
            .iter()
            .filter(|r| matches!(r, AuditRecord::Verdict { verdict } if verdict.actor_id == Some(7)))
            .collect();
        assert_eq!(actor_records.len(), 3);
    }

    #[tokio::test]
    async fn failing_storage_counts_errors_but_does_not_panic() {
        struct DeadStorage;
        #[async_trait]
        impl Storage for DeadStorage {
            async fn get(&self, _key: &str) -> Result<Option<Value>, StorageError> {
                Err(StorageError::Unavailable("down".into()))
            }
            async fn put(&self, _key: &str, _value: Value) -> Result<(), StorageError> {
                Err(StorageError::Unavailable("down".into()))
            }
            async fn scan_prefix(
                &self,
                _prefix: &str,
            ) -> Result<Vec<(String, Value)>, StorageError> {
                Err(StorageError::Unavailable("down".into()))
            }
            async fn delete(&self, _key: &str) -> Result<(), StorageError> {
                Err(StorageError::Unavailable("down".into()))
            }
        }

        let audit = AuditLog::new(Arc::new(DeadStorage));
        audit.record_verdict(&verdict(1, Some(7))).await;
        assert_eq!(audit.write_errors(), 1);
        assert!(audit.records_for(1).await.is_empty());
    }

    #[tokio::test]
    async fn silent_detector_raises_health_alert() {
        let alerter = Arc::new(RecordingAlerter::default());
        let cfg = WatchdogConfig {
            check_interval_secs: 1,
            silent_after_secs: 0, // natychmiastowa "cisza" na potrzeby testu
            error_burst: 100,
            alert_cooldown_secs: 300,
        };
        let wd = Watchdog::new(cfg, alerter.clone());
        wd.register("raid");
        wd.note_event();
        let audit = AuditLog::new(Arc::new(MemoryStorage::default()));

        wd.health_check(&audit).await;
        let alerts = alerter.alerts.lock().await;
        assert!(
            alerts
                .iter()
                .any(|(k, m)| *k == AlertKind::Health && m.contains("raid"))
        );
    }

    #[tokio::test]
    async fn error_burst_raises_health_alert_once_per_cooldown() {
        let alerter = Arc::new(RecordingAlerter::default());
        let cfg = WatchdogConfig {
            check_interval_secs: 1,
            silent_after_secs: 6 * 3600,
            error_burst: 3,
            alert_cooldown_secs: 300,
        };
        let wd = Watchdog::new(cfg, alerter.clone());
        wd.register("content_risk");
        for _ in 0..5 {
            wd.note_error("content_risk");
        }
        let audit = AuditLog::new(Arc::new(MemoryStorage::default()));

        wd.health_check(&audit).await;
        wd.health_check(&audit).await; // cooldown tłumi drugi alert
        let alerts = alerter.alerts.lock().await;
        let bursts = alerts
            .iter()
            .filter(|(_, m)| m.contains("error burst"))
            .count();
        assert_eq!(bursts, 1);
    }

    #[tokio::test]
    async fn healthy_detector_stays_quiet() {
        let alerter = Arc::new(RecordingAlerter::default());
        let wd = Watchdog::new(WatchdogConfig::default(), alerter.clone());
        wd.register("spam");
        wd.note_event();
        wd.note_verdict("spam");
        let audit = AuditLog::new(Arc::new(MemoryStorage::default()));

        wd.health_check(&audit).await;
        assert!(alerter.alerts.lock().await.is_empty());
    }

    #[tokio::test]
    async fn status_report_summarizes_counters() {
        let alerter = Arc::new(RecordingAlerter::default());
        let wd = Watchdog::new(WatchdogConfig::default(), alerter);
        wd.register("spam");
        wd.note_event();
        wd.note_event();
        wd.note_verdict("spam");
        wd.note_error("spam");
        let audit = AuditLog::new(Arc::new(MemoryStorage::default()));

        let report = wd.status_report(&audit);
        assert_eq!(report.events_seen, 2);
        let spam = report.detectors.iter().find(|d| d.name == "spam").unwrap();
        assert_eq!(spam.verdicts, 1);
        assert_eq!(spam.errors, 1);
        assert!(spam.healthy);
    }
}
