//! Ryzyko treści: detektor zna tylko mapowanie score→powaga i zbiór dowodów.
//! Sam scoring jest wstrzykiwany ([ContentScorer]) – produkcja podpina model
//! lub zewnętrzne API, testy dostają tani scoring leksykalny.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::GuildPolicy;
use crate::event::{Event, EventKind};
use crate::state::{ActorStore, MessageFp};

use super::{Action, Detector, Evidence, Severity, Verdict};

#[async_trait]
pub trait ContentScorer: Send + Sync {
    /// Ryzyko tekstu w przedziale [0,1].
    async fn score(&self, text: &str) -> anyhow::Result<f32>;
}

/// Tani scoring leksykalny: przynęty na nitro/invite, linki, niska
/// różnorodność znaków. Zero modelu – wystarcza jako default i do testów.
pub struct LexicalScorer;

static RE_MENTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[@#][^>]+>").unwrap());
static RE_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://\S+").unwrap());

const LURE_KEYWORDS: &[&str] = &["free nitro", "nitro gift", "discord.gg", "airdrop", "steam gift"];

/// Czyszczenie treści przed scoringiem: wzmianki i URL-e wylatują,
/// whitespace się zlepia.
pub fn sanitize(text: &str) -> String {
    let no_mentions = RE_MENTION.replace_all(text, "");
    let no_urls = RE_URL.replace_all(&no_mentions, "");
    no_urls.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl ContentScorer for LexicalScorer {
    async fn score(&self, text: &str) -> anyhow::Result<f32> {
        let had_link = RE_URL.is_match(text);
        let clean = sanitize(text).to_lowercase();
        if clean.is_empty() && !had_link {
            return Ok(0.0);
        }

        let mut score = 0.0f32;
        for kw in LURE_KEYWORDS {
            if clean.contains(kw) || text.to_lowercase().contains(kw) {
                score += 0.45;
            }
        }
        if had_link {
            score += 0.25;
        }
        // niska różnorodność znaków w dłuższym tekście (ciągi powtórek)
        if clean.len() > 50 {
            let unique = clean
                .chars()
                .collect::<std::collections::HashSet<_>>()
                .len();
            if (unique as f32) / (clean.chars().count() as f32) < 0.5 {
                score += 0.30;
            }
        }
        if clean.contains("@everyone") || clean.contains("@here") {
            score += 0.15;
        }
        Ok(score.min(1.0))
    }
}

pub struct ContentRiskDetector {
    scorer: Arc<dyn ContentScorer>,
}

impl ContentRiskDetector {
    pub fn new(scorer: Arc<dyn ContentScorer>) -> Self {
        Self { scorer }
    }
}

impl Default for ContentRiskDetector {
    fn default() -> Self {
        Self::new(Arc::new(LexicalScorer))
    }
}

#[async_trait]
impl Detector for ContentRiskDetector {
    fn name(&self) -> &'static str {
        "content_risk"
    }

    async fn inspect(
        &self,
        ev: &Event,
        _store: &ActorStore,
        policy: &GuildPolicy,
    ) -> anyhow::Result<Option<Verdict>> {
        let EventKind::Message {
            message_id,
            content,
            mentions,
        } = &ev.kind
        else {
            return Ok(None);
        };
        if content.trim().is_empty() {
            return Ok(None);
        }

        // Błąd scorera idzie w górę – silnik izoluje go do tego detektora
        // i dolicza do zdrowia w watchdogu.
        let score = self
            .scorer
            .score(content)
            .await
            .context("content scorer failed")?;

        let p = &policy.content;
        let (severity, action) = if score >= p.high_band {
            (Severity::Medium, Action::Mute)
        } else if score >= p.low_band {
            (Severity::Low, Action::Warn)
        } else {
            return Ok(None);
        };

        let fp = MessageFp::from_content(*message_id, content, *mentions, ev.at, ev.ts);
        Ok(Some(Verdict {
            detector: self.name().into(),
            guild_id: ev.guild_id,
            actor_id: Some(ev.actor_id),
            severity,
            action,
            reason: format!("content risk score {score:.2}"),
            evidence: Evidence {
                notes: vec![format!("score={score:.2}")],
                messages: vec![fp.evidence()],
                ..Default::default()
            },
            ts: Utc::now(),
        }))
    }
}
