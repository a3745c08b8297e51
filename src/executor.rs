//! src/executor.rs
//! ActionExecutor: jedyne miejsce, które mutuje platformę. Wywołania idą
//! przez wspólny limiter tempa; błędy przejściowe dostają backoff
//! z jitterem, błędy trwałe – natychmiastowy `Failed` i alert.
//!
//! Gwarancje: idempotencja per decyzja (drugie `apply` = no-op), FIFO per
//! (guild, actor), backoff jednego aktora nigdy nie blokuje innych.

use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::arbiter::{Decision, DecisionRegistry, DecisionSink};
use crate::audit::{AlertKind, Alerter, AuditLog};
use crate::config::ExecutorConfig;
use crate::detect::{Action, Severity};

/* =========================================
   Seam do platformy
   ========================================= */

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("platform request timed out")]
    Timeout,
    #[error("platform unavailable: {0}")]
    Unavailable(String),
    #[error("missing permission: {0}")]
    PermissionDenied(String),
    #[error("target not found: {0}")]
    NotFound(String),
}

impl PlatformError {
    /// Przejściowy = warto ponowić; trwały = alert i koniec.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PlatformError::RateLimited { .. }
                | PlatformError::Timeout
                | PlatformError::Unavailable(_)
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            PlatformError::RateLimited { retry_after_ms } => {
                Some(Duration::from_millis(*retry_after_ms))
            }
            _ => None,
        }
    }
}

/// Jedyne wyjście mutujące platformę. Specyfika API (uprawnienia, limity)
/// żyje po stronie klienta i wraca tu jako typowany [PlatformError].
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn execute_moderation_action(
        &self,
        guild_id: u64,
        actor_id: Option<u64>,
        action: Action,
        reason: &str,
    ) -> Result<(), PlatformError>;
}

/* =========================================
   Wynik zastosowania decyzji
   ========================================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyApplied,
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RateLimited,
    Timeout,
    Unavailable,
    PermissionDenied,
    NotFound,
}

impl From<&PlatformError> for FailureKind {
    fn from(e: &PlatformError) -> Self {
        match e {
            PlatformError::RateLimited { .. } => FailureKind::RateLimited,
            PlatformError::Timeout => FailureKind::Timeout,
            PlatformError::Unavailable(_) => FailureKind::Unavailable,
            PlatformError::PermissionDenied(_) => FailureKind::PermissionDenied,
            PlatformError::NotFound(_) => FailureKind::NotFound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    Applied,
    Skipped { reason: SkipReason },
    Failed { kind: FailureKind },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionResult {
    pub decision_id: u64,
    pub outcome: Outcome,
    /// Ile prób poszło na platformę.
    pub attempts: u32,
    pub applied_at: DateTime<Utc>,
}

/* =========================================
   Kolejka per aktor (FIFO)
   ========================================= */

#[derive(Debug, Default)]
struct ScopeQueue {
    items: Mutex<VecDeque<Decision>>,
    running: AtomicBool,
}

/* =========================================
   ActionExecutor
   ========================================= */

const BACKOFF_CAP: Duration = Duration::from_secs(30);

pub struct ActionExecutor {
    cfg: ExecutorConfig,
    platform: Arc<dyn PlatformClient>,
    registry: Arc<DecisionRegistry>,
    audit: Arc<AuditLog>,
    alerter: Arc<dyn Alerter>,
    pace: DefaultDirectRateLimiter,
    queues: DashMap<(u64, Option<u64>), Arc<ScopeQueue>>,
    /// Zastosowane decyzje (id -> kiedy) – strażnik idempotencji.
    applied: DashMap<u64, Instant>,
}

impl ActionExecutor {
    pub fn new(
        cfg: ExecutorConfig,
        platform: Arc<dyn PlatformClient>,
        registry: Arc<DecisionRegistry>,
        audit: Arc<AuditLog>,
        alerter: Arc<dyn Alerter>,
    ) -> Arc<Self> {
        let per_sec = NonZeroU32::new(cfg.pace_per_sec).unwrap_or(NonZeroU32::MIN);
        let this = Arc::new(Self {
            cfg,
            platform,
            registry,
            audit,
            alerter,
            pace: RateLimiter::direct(Quota::per_second(per_sec)),
            queues: DashMap::new(),
            applied: DashMap::new(),
        });
        Self::spawn_prune_task(&this);
        this
    }

    fn spawn_prune_task(this: &Arc<Self>) {
        let weak = Arc::downgrade(this);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                if let Some(strong) = weak.upgrade() {
                    // strażnik idempotencji może puścić wpisy starsze niż
                    // najdłuższy możliwy cool-down
                    let ttl = Duration::from_secs(2 * 3600);
                    let now = Instant::now();
                    strong
                        .applied
                        .retain(|_, t| now.duration_since(*t) <= ttl);
                } else {
                    break;
                }
            }
        });
    }

    /// Zastosuj decyzję. Pełny kontrakt: idempotencja, pacing, backoff dla
    /// błędów przejściowych, natychmiastowy fail dla trwałych; każdy wynik
    /// ląduje w audycie zanim wróci do wołającego.
    pub async fn apply(&self, decision: Decision) -> ActionResult {
        // strażnik idempotencji: insert jest atomowy, przegrany dostaje no-op
        if self
            .applied
            .insert(decision.id, Instant::now())
            .is_some()
        {
            let result = ActionResult {
                decision_id: decision.id,
                outcome: Outcome::Skipped {
                    reason: SkipReason::AlreadyApplied,
                },
                attempts: 0,
                applied_at: Utc::now(),
            };
            self.finish(&decision, result.clone()).await;
            return result;
        }

        let reason = decision
            .verdicts
            .iter()
            .map(|v| v.reason.as_str())
            .collect::<Vec<_>>()
            .join(" | ");

        let mut attempts = 0u32;
        let outcome = loop {
            // wyparcie przez poważniejszą decyzję anuluje oczekujące próby
            if !self.registry.is_current(&decision.dedup_key, decision.id) {
                break Outcome::Skipped {
                    reason: SkipReason::Superseded,
                };
            }

            self.pace.until_ready().await;
            attempts += 1;
            match self
                .platform
                .execute_moderation_action(
                    decision.guild_id,
                    decision.actor_id,
                    decision.action,
                    &reason,
                )
                .await
            {
                Ok(()) => break Outcome::Applied,
                Err(e) if e.is_transient() && attempts < self.cfg.max_attempts => {
                    let delay = self.backoff_delay(attempts, e.retry_after());
                    warn!(
                        decision_id = decision.id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient platform error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if !e.is_transient() {
                        // nieodwracalne – operator musi to zobaczyć
                        self.alerter
                            .notify_admins(
                                Some(decision.guild_id),
                                AlertKind::Security,
                                decision.severity,
                                format!(
                                    "moderation action {:?} failed permanently: {e}",
                                    decision.action
                                ),
                            )
                            .await;
                    }
                    break Outcome::Failed {
                        kind: FailureKind::from(&e),
                    };
                }
            }
        };

        let result = ActionResult {
            decision_id: decision.id,
            outcome,
            attempts,
            applied_at: Utc::now(),
        };
        self.finish(&decision, result.clone()).await;
        result
    }

    /// Audyt + ewentualny alert – wspólne zejście każdej ścieżki `apply`.
    async fn finish(&self, decision: &Decision, result: ActionResult) {
        match &result.outcome {
            Outcome::Applied => info!(
                decision_id = decision.id,
                guild_id = decision.guild_id,
                action = ?decision.action,
                attempts = result.attempts,
                "moderation action applied"
            ),
            other => warn!(
                decision_id = decision.id,
                guild_id = decision.guild_id,
                outcome = ?other,
                attempts = result.attempts,
                "moderation action not applied"
            ),
        }

        // Failed/Skipped powyżej progu powagi idą też do adminów
        // (trwałe błędy alertowały już w pętli).
        let escalate = matches!(result.outcome, Outcome::Failed { kind }
                if matches!(kind, FailureKind::RateLimited | FailureKind::Timeout | FailureKind::Unavailable))
            || matches!(result.outcome, Outcome::Skipped { .. });
        if escalate && decision.severity >= Severity::High {
            self.alerter
                .notify_admins(
                    Some(decision.guild_id),
                    AlertKind::Security,
                    decision.severity,
                    format!(
                        "decision {} ({:?}) ended as {:?}",
                        decision.id, decision.action, result.outcome
                    ),
                )
                .await;
        }

        self.audit.record_result(decision, &result).await;
    }

    fn backoff_delay(&self, attempt: u32, platform_hint: Option<Duration>) -> Duration {
        let base = self.cfg.backoff_base_ms.max(1);
        let exp = base.saturating_mul(1u64 << (attempt - 1).min(16));
        let jitter = rand::rng().random_range(0..=base / 2);
        let computed = Duration::from_millis(exp + jitter).min(BACKOFF_CAP);
        match platform_hint {
            Some(hint) if hint > computed => hint.min(BACKOFF_CAP),
            _ => computed,
        }
    }

    fn queue(&self, key: (u64, Option<u64>)) -> Arc<ScopeQueue> {
        self.queues
            .entry(key)
            .or_insert_with(|| Arc::new(ScopeQueue::default()))
            .clone()
    }

    async fn drain(self: Arc<Self>, q: Arc<ScopeQueue>) {
        loop {
            let next = q.items.lock().await.pop_front();
            match next {
                Some(decision) => {
                    let _ = self.apply(decision).await;
                }
                None => {
                    q.running.store(false, Ordering::Release);
                    if q.items.lock().await.is_empty() {
                        break;
                    }
                    // ktoś dorzucił między pop a store – spróbuj wrócić do pracy
                    if q
                        .running
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        break; // inny worker już przejął kolejkę
                    }
                }
            }
        }
    }
}

#[async_trait]
impl DecisionSink for Arc<ActionExecutor> {
    /// Wstaw do kolejki FIFO aktora i dopilnuj, żeby ktoś ją mielił.
    /// Kolejność wstawień = kolejność rozstrzygnięć arbitra.
    async fn dispatch(&self, decision: Decision) {
        let key = (decision.guild_id, decision.actor_id);
        let q = self.queue(key);
        q.items.lock().await.push_back(decision);
        if q
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let exec = self.clone();
            tokio::spawn(exec.drain(q));
        }
    }
}
