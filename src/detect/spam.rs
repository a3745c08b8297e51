//! Anty-spam: częstotliwość wiadomości, powtarzalna treść, spam wzmianek.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::GuildPolicy;
use crate::event::{Event, EventKind};
use crate::state::{ActorStore, Metric, MessageFp, Scope};

use super::{Detector, Evidence, Severity, Verdict};

pub struct SpamDetector;

#[async_trait]
impl Detector for SpamDetector {
    fn name(&self) -> &'static str {
        "spam"
    }

    async fn inspect(
        &self,
        ev: &Event,
        store: &ActorStore,
        policy: &GuildPolicy,
    ) -> anyhow::Result<Option<Verdict>> {
        let EventKind::Message { mentions, .. } = &ev.kind else {
            return Ok(None);
        };
        let p = &policy.spam;
        let scope = Scope::Actor(ev.guild_id, ev.actor_id);
        let window = Duration::from_secs(p.window_secs);

        let count = store
            .count_in_window_at(scope, Metric::Messages, window, ev.at)
            .await;
        let dup = store.duplicate_stats_at(scope, window, ev.at).await;

        // Zbieramy wszystkie przyczyny; przy kilku naraz zostaje jeden
        // werdykt z najwyższą powagą i pełną listą powodów.
        let mut severity: Option<Severity> = None;
        let mut causes: Vec<String> = Vec::new();

        if count >= p.burst_high {
            severity = Some(Severity::High);
            causes.push(format!("burst={count}/{}s", p.window_secs));
        } else if count >= p.burst_medium {
            severity = Some(Severity::Medium);
            causes.push(format!("burst={count}/{}s", p.window_secs));
        }

        if dup.total >= p.duplicate_min_samples && dup.ratio() >= p.duplicate_ratio {
            severity = Some(bump(severity, Severity::High));
            causes.push(format!(
                "duplicate_ratio={:.2} ({}x sig={:016x})",
                dup.ratio(),
                dup.top_count,
                dup.top_sig
            ));
        }

        if *mentions >= p.mention_threshold {
            severity = Some(bump(severity, Severity::Medium));
            causes.push(format!("mentions={mentions}"));
        }

        let Some(severity) = severity else {
            return Ok(None);
        };

        let matched: Vec<_> = store
            .recent_messages_at(scope, window, ev.at)
            .await
            .iter()
            .map(MessageFp::evidence)
            .collect();

        Ok(Some(Verdict {
            detector: self.name().into(),
            guild_id: ev.guild_id,
            actor_id: Some(ev.actor_id),
            severity,
            action: p.punishment,
            reason: causes.join("; "),
            evidence: Evidence {
                notes: causes.clone(),
                messages: matched,
                ..Default::default()
            },
            ts: Utc::now(),
        }))
    }
}

fn bump(current: Option<Severity>, at_least: Severity) -> Severity {
    current.map_or(at_least, |s| s.max(at_least))
}
