//! src/arbiter.rs
//! Arbiter: zbiera współbieżne werdykty dla tej samej pary (guild, actor),
//! wybiera jedną mitygację i pilnuje, żeby na klucz deduplikacji żyła
//! najwyżej jedna decyzja naraz.
//!
//! Okno korelacji domyka się po czasie albo po komplecie detektorów –
//! co pierwsze. Werdykty przychodzące w trakcie aktywnego cool-downu nie
//! giną: doklejamy je do dowodów żywej decyzji (koalescencja).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::config::{ArbiterConfig, CooldownPolicy, Policies};
use crate::detect::{Action, Severity, Verdict};

/* =========================================
   Decyzja i klucz deduplikacji
   ========================================= */

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    pub guild_id: u64,
    pub actor_id: Option<u64>,
    pub class: Action,
}

/// Rozstrzygnięta mitygacja. Niemutowalna; trafia do audytu i do egzekutora.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: u64,
    pub guild_id: u64,
    pub actor_id: Option<u64>,
    pub action: Action,
    pub severity: Severity,
    /// Werdykty składowe w kolejności napływu.
    pub verdicts: Vec<Verdict>,
    pub dedup_key: DedupKey,
    pub ts: DateTime<Utc>,
}

/// Ujście decyzji – w produkcji ActionExecutor, w testach rejestrator.
#[async_trait]
pub trait DecisionSink: Send + Sync {
    async fn dispatch(&self, decision: Decision);
}

/* =========================================
   Rejestr aktywnych decyzji (cool-down)
   ========================================= */

#[derive(Debug)]
struct ActiveEntry {
    decision_id: u64,
    severity: Severity,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct DecisionRegistry {
    active: DashMap<DedupKey, ActiveEntry>,
}

pub(crate) enum Claim {
    /// Klucz zajęty przez co najmniej równie poważną decyzję.
    Coalesce { into: u64 },
    /// Klucz przyznany; `superseded` = wyparta, wciąż aktywna decyzja.
    Granted { superseded: Option<u64> },
}

impl DecisionRegistry {
    /// Czy decyzja wciąż jest właścicielem swojego klucza? Egzekutor pyta
    /// przed każdą próbą – wyparcie anuluje oczekujące retry.
    pub fn is_current(&self, key: &DedupKey, decision_id: u64) -> bool {
        match self.active.get(key) {
            Some(e) => e.decision_id == decision_id,
            None => true, // wpis mógł wygasnąć i zostać sprzątnięty
        }
    }

    pub(crate) fn claim(
        &self,
        key: &DedupKey,
        severity: Severity,
        cooldown: Duration,
        id: u64,
    ) -> Claim {
        let now = Instant::now();
        match self.active.entry(key.clone()) {
            Entry::Occupied(mut e) => {
                let cur = e.get();
                let expired = cur.expires_at <= now;
                if !expired && cur.severity >= severity {
                    // monotoniczność: słabsza decyzja nigdy nie wypiera mocniejszej
                    return Claim::Coalesce {
                        into: cur.decision_id,
                    };
                }
                let superseded = (!expired).then(|| cur.decision_id);
                e.insert(ActiveEntry {
                    decision_id: id,
                    severity,
                    expires_at: now + cooldown,
                });
                Claim::Granted { superseded }
            }
            Entry::Vacant(e) => {
                e.insert(ActiveEntry {
                    decision_id: id,
                    severity,
                    expires_at: now + cooldown,
                });
                Claim::Granted { superseded: None }
            }
        }
    }

    fn prune(&self) {
        let now = Instant::now();
        self.active.retain(|_, e| e.expires_at > now);
    }
}

/* =========================================
   Arbiter
   ========================================= */

type CorrKey = (u64, Option<u64>);

#[derive(Debug, Default)]
struct PendingBucket {
    verdicts: Vec<Verdict>,
    flushed: bool,
}

pub struct Arbiter {
    cfg: ArbiterConfig,
    policies: Arc<Policies>,
    registry: Arc<DecisionRegistry>,
    sink: Arc<dyn DecisionSink>,
    audit: Arc<AuditLog>,
    pending: DashMap<CorrKey, Arc<Mutex<PendingBucket>>>,
    next_id: AtomicU64,
}

impl Arbiter {
    pub fn new(
        cfg: ArbiterConfig,
        policies: Arc<Policies>,
        registry: Arc<DecisionRegistry>,
        sink: Arc<dyn DecisionSink>,
        audit: Arc<AuditLog>,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            cfg,
            policies,
            registry,
            sink,
            audit,
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
        });
        Self::spawn_prune_task(&this);
        this
    }

    fn spawn_prune_task(this: &Arc<Self>) {
        let weak = Arc::downgrade(this);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                if let Some(strong) = weak.upgrade() {
                    strong.registry.prune();
                } else {
                    break;
                }
            }
        });
    }

    pub fn registry(&self) -> Arc<DecisionRegistry> {
        self.registry.clone()
    }

    /// Przyjmij werdykt do okna korelacji. Domknięcie okna (czas albo
    /// komplet detektorów) buduje decyzję i oddaje ją do ujścia.
    pub async fn submit(self: &Arc<Self>, verdict: Verdict) {
        let key: CorrKey = (verdict.guild_id, verdict.actor_id);
        let mut carried = Some(verdict);
        loop {
            let bucket = match self.pending.entry(key) {
                Entry::Occupied(e) => e.get().clone(),
                Entry::Vacant(e) => {
                    let b = Arc::new(Mutex::new(PendingBucket::default()));
                    e.insert(b.clone());
                    // timer domyka okno, jeśli komplet nie przyjdzie
                    let this = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(this.cfg.correlation_ms)).await;
                        this.close_window(key).await;
                    });
                    b
                }
            };

            let full = {
                let mut guard = bucket.lock().await;
                if guard.flushed {
                    // przegrany wyścig z timerem – wiadro już domknięte,
                    // zakładamy świeże
                    drop(guard);
                    self.pending
                        .remove_if(&key, |_, b| Arc::ptr_eq(b, &bucket));
                    continue;
                }
                guard.verdicts.push(carried.take().expect("verdict carried"));
                guard.verdicts.len() >= self.cfg.expected_detectors
            };
            if full {
                self.close_window(key).await;
            }
            return;
        }
    }

    async fn close_window(&self, key: CorrKey) {
        let Some((_, bucket)) = self.pending.remove(&key) else {
            return;
        };
        let verdicts = {
            let mut guard = bucket.lock().await;
            if guard.flushed {
                return;
            }
            guard.flushed = true;
            std::mem::take(&mut guard.verdicts)
        };
        if !verdicts.is_empty() {
            self.resolve(verdicts).await;
        }
    }

    /// Scal werdykty z jednego okna w decyzję, przejdź przez rejestr
    /// deduplikacji i (jeśli klucz przyznany) oddaj do ujścia.
    async fn resolve(&self, verdicts: Vec<Verdict>) {
        // najpoważniejszy werdykt; remis rozstrzyga stały porządek akcji
        let top = verdicts
            .iter()
            .max_by_key(|v| (v.severity, v.action.priority()))
            .cloned()
            .expect("resolve on empty window");

        let dedup_key = DedupKey {
            guild_id: top.guild_id,
            actor_id: top.actor_id,
            class: top.action,
        };
        let cooldown = cooldown_for(
            top.severity,
            &self.policies.for_guild(top.guild_id).cooldown,
        );
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        match self.registry.claim(&dedup_key, top.severity, cooldown, id) {
            Claim::Coalesce { into } => {
                info!(
                    guild_id = top.guild_id,
                    decision_id = into,
                    verdicts = verdicts.len(),
                    "decision active for key, coalescing evidence"
                );
                for v in &verdicts {
                    self.audit.record_coalesced(into, v).await;
                }
            }
            Claim::Granted { superseded } => {
                if let Some(old) = superseded {
                    warn!(
                        guild_id = top.guild_id,
                        old_decision = old,
                        new_decision = id,
                        "more severe decision supersedes active one"
                    );
                }
                let decision = Decision {
                    id,
                    guild_id: top.guild_id,
                    actor_id: top.actor_id,
                    action: top.action,
                    severity: top.severity,
                    verdicts,
                    dedup_key,
                    ts: Utc::now(),
                };
                self.audit.record_decision(&decision).await;
                self.sink.dispatch(decision).await;
            }
        }
    }
}

pub fn cooldown_for(severity: Severity, c: &CooldownPolicy) -> Duration {
    Duration::from_secs(match severity {
        Severity::Low => c.low_secs,
        Severity::Medium => c.medium_secs,
        Severity::High => c.high_secs,
        Severity::Critical => c.critical_secs,
    })
}
