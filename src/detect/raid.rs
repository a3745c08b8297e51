//! Anty-rajd: tempo joinów liczone per GILDIA, nie per aktor.
//! Eskalacja do Critical, gdy świeże konta wyglądają na fabrykę botów –
//! heurystyka jest wymienna ([JoinRiskScorer]), silnik zna tylko kontrakt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::config::GuildPolicy;
use crate::event::{Event, EventKind};
use crate::state::{ActorStore, JoinerProfile, Metric, Scope};

use super::{Action, Detector, Evidence, Severity, Verdict};

#[async_trait]
pub trait JoinRiskScorer: Send + Sync {
    /// `true` = konto wygląda na założone pod rajd.
    async fn suspicious(&self, joiner: &JoinerProfile) -> anyhow::Result<bool>;
}

/// Domyślna heurystyka: konto młodsze niż próg albo domyślny avatar.
pub struct AccountAgeScorer {
    pub min_age_hours: i64,
}

impl Default for AccountAgeScorer {
    fn default() -> Self {
        Self { min_age_hours: 24 }
    }
}

#[async_trait]
impl JoinRiskScorer for AccountAgeScorer {
    async fn suspicious(&self, joiner: &JoinerProfile) -> anyhow::Result<bool> {
        if joiner.default_avatar {
            return Ok(true);
        }
        Ok(match joiner.account_created {
            Some(created) => {
                Utc::now().signed_duration_since(created)
                    < chrono::Duration::hours(self.min_age_hours)
            }
            None => false,
        })
    }
}

pub struct RaidDetector {
    scorer: Arc<dyn JoinRiskScorer>,
}

impl RaidDetector {
    pub fn new(scorer: Arc<dyn JoinRiskScorer>) -> Self {
        Self { scorer }
    }
}

impl Default for RaidDetector {
    fn default() -> Self {
        Self::new(Arc::new(AccountAgeScorer::default()))
    }
}

#[async_trait]
impl Detector for RaidDetector {
    fn name(&self) -> &'static str {
        "raid"
    }

    async fn inspect(
        &self,
        ev: &Event,
        store: &ActorStore,
        policy: &GuildPolicy,
    ) -> anyhow::Result<Option<Verdict>> {
        if !matches!(ev.kind, EventKind::Join { .. }) {
            return Ok(None);
        }
        let p = &policy.raid;
        let window = Duration::from_secs(p.window_secs);
        let scope = Scope::Guild(ev.guild_id);

        let joins = store
            .count_in_window_at(scope, Metric::Joins, window, ev.at)
            .await;
        if joins < p.join_threshold {
            return Ok(None);
        }

        let joiners = store
            .recent_joiners_at(ev.guild_id, window, ev.at)
            .await;

        // Błąd scorera nie zdejmuje całego werdyktu – konto liczy się wtedy
        // jako niepodejrzane (nieznany stan zawsze poniżej progu).
        let mut flagged = 0u32;
        for j in &joiners {
            match self.scorer.suspicious(j).await {
                Ok(true) => flagged += 1,
                Ok(false) => {}
                Err(e) => debug!(error=?e, user_id = j.user_id, "join risk scorer failed"),
            }
        }
        let ratio = if joiners.is_empty() {
            0.0
        } else {
            flagged as f32 / joiners.len() as f32
        };
        let severity = if !joiners.is_empty() && ratio >= p.suspicious_ratio {
            Severity::Critical
        } else {
            Severity::High
        };

        Ok(Some(Verdict {
            detector: self.name().into(),
            guild_id: ev.guild_id,
            actor_id: None, // werdykt na całą gildię
            severity,
            action: Action::LockdownChannel,
            reason: format!(
                "join burst: {joins}/{}s (suspicious {flagged}/{})",
                p.window_secs,
                joiners.len()
            ),
            evidence: Evidence {
                notes: vec![
                    format!("joins={joins}"),
                    format!("suspicious_ratio={ratio:.2}"),
                ],
                joiners: joiners.iter().map(|j| j.user_id).collect(),
                ..Default::default()
            },
            ts: Utc::now(),
        }))
    }
}
