//! Detektory: niezależne moduły, każdy konsumuje [Event], czyta ActorStore
//! i produkuje najwyżej jeden [Verdict]. Nie rozmawiają ze sobą i nie dzielą
//! stanu poza magazynem okien.

pub mod content;
pub mod nuke;
pub mod raid;
pub mod spam;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::GuildPolicy;
use crate::event::Event;
use crate::state::{ActorStore, EvidenceBundle, MessageEvidence};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Sugerowana mitygacja.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Warn,
    Mute,
    Kick,
    Ban,
    LockdownChannel,
    RevertAction,
}

impl Action {
    /// Stały porządek rozstrzygania remisów w arbitrze – odwracanie szkód
    /// przed blokadą wejść, blokada przed karami indywidualnymi.
    pub fn priority(self) -> u8 {
        match self {
            Action::RevertAction => 6,
            Action::LockdownChannel => 5,
            Action::Ban => 4,
            Action::Kick => 3,
            Action::Mute => 2,
            Action::Warn => 1,
        }
    }
}

/// Materiał dowodowy werdyktu – małe, serializowalne migawki,
/// nigdy referencje do żywego stanu.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Evidence {
    pub notes: Vec<String>,
    pub messages: Vec<MessageEvidence>,
    pub joiners: Vec<u64>,
    pub bundle: Option<EvidenceBundle>,
}

/// Samodzielny osąd jednego detektora. Niemutowalny po utworzeniu.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub detector: String,
    pub guild_id: u64,
    /// `None` = werdykt na całą gildię (rajd).
    pub actor_id: Option<u64>,
    pub severity: Severity,
    pub action: Action,
    pub reason: String,
    pub evidence: Evidence,
    pub ts: DateTime<Utc>,
}

#[async_trait]
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Zero albo jeden werdykt dla zdarzenia. Błąd izoluje się do tego
    /// detektora – silnik liczy go do zdrowia, reszta pipeline'u jedzie dalej.
    async fn inspect(
        &self,
        ev: &Event,
        store: &ActorStore,
        policy: &GuildPolicy,
    ) -> anyhow::Result<Option<Verdict>>;
}
