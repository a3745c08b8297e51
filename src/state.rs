//! src/state.rs
//! ActorStore – przesuwne okna per (scope, metryka) + bufory odcisków
//! wiadomości i świeżych joinów. Jedyny stan współdzielony przez detektory.
//!
//! Arena to `moka::sync::Cache` z time-to-idle: aktor nieaktywny dłużej niż
//! `idle_evict_hours` wypada w całości, co domyka górne ograniczenie pamięci.
//! Każde okno ma własny `Mutex` – brak globalnego locka, gildie się nie
//! serializują nawzajem.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use unicode_normalization::UnicodeNormalization;

use crate::config::StoreConfig;

/* =========================================
   Klucze areny
   ========================================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Messages,
    Joins,
    Destructive,
}

impl Metric {
    /// Horyzont okna danej metryki – dalej wstecz nikt nie pyta,
    /// więc dalej wstecz nic nie trzymamy.
    fn horizon(self) -> Duration {
        match self {
            Metric::Messages => Duration::from_secs(600),
            Metric::Joins => Duration::from_secs(600),
            Metric::Destructive => Duration::from_secs(60),
        }
    }
}

/// Zakres okna: per aktor albo per cała gildia (rajd liczy joiny gildii).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Actor(u64, u64),
    Guild(u64),
}

impl Scope {
    pub fn guild_id(&self) -> u64 {
        match self {
            Scope::Actor(g, _) | Scope::Guild(g) => *g,
        }
    }

    pub fn actor_id(&self) -> Option<u64> {
        match self {
            Scope::Actor(_, a) => Some(*a),
            Scope::Guild(_) => None,
        }
    }
}

/* =========================================
   Okno przesuwne
   ========================================= */

#[derive(Debug)]
struct Window {
    samples: VecDeque<(Instant, u32)>,
    cap: usize,
}

impl Window {
    fn new(cap: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(64),
            cap,
        }
    }

    fn record(&mut self, at: Instant, weight: u32, horizon: Duration) {
        // znaczniki w oknie muszą być niemalejące; spóźniony zapis doklejamy
        // z czasem ostatniej próbki zamiast psuć porządek
        let at = match self.samples.back() {
            Some(&(last, _)) if at < last => last,
            _ => at,
        };
        self.samples.push_back((at, weight));
        if self.samples.len() > self.cap {
            // bezpiecznik przeciw floodowi; normalną eksmisją jest horyzont
            self.samples.pop_front();
        }
        prune_older_than(&mut self.samples, horizon, at);
    }

    fn count_since(&self, within: Duration, now: Instant) -> u32 {
        self.samples
            .iter()
            .rev()
            .take_while(|(at, _)| now.duration_since(*at) <= within)
            .map(|(_, w)| *w)
            .sum()
    }
}

fn prune_older_than(q: &mut VecDeque<(Instant, u32)>, window: Duration, now: Instant) {
    while let Some(&(front, _)) = q.front() {
        if now.duration_since(front) > window {
            q.pop_front();
        } else {
            break;
        }
    }
}

/* =========================================
   Odciski wiadomości i profile joinów
   ========================================= */

/// Odcisk pojedynczej wiadomości: podpis FNV-1a znormalizowanej treści
/// plus kilka tanich sygnałów. Trzymamy zamiast pełnej treści.
#[derive(Debug, Clone)]
pub struct MessageFp {
    pub message_id: u64,
    pub sig: u64,
    pub len: usize,
    pub mentions: u32,
    pub has_link: bool,
    pub entropy: f32,
    pub at: Instant,
    pub ts: DateTime<Utc>,
}

impl MessageFp {
    pub fn from_content(
        message_id: u64,
        content: &str,
        mentions: u32,
        at: Instant,
        ts: DateTime<Utc>,
    ) -> Self {
        static LINK_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r#"https?://[^\s<>()]+"#).unwrap());
        let norm = normalize_content_for_sig(content);
        Self {
            message_id,
            sig: fnv1a64(norm.as_bytes()),
            len: content.len(),
            mentions,
            has_link: LINK_RE.is_match(content),
            entropy: shannon_entropy(content),
            at,
            ts,
        }
    }

    pub fn evidence(&self) -> MessageEvidence {
        MessageEvidence {
            message_id: self.message_id,
            sig: self.sig,
            mentions: self.mentions,
            has_link: self.has_link,
            ts: self.ts,
        }
    }
}

/// Serializowalna forma odcisku – trafia do dowodów werdyktu.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageEvidence {
    pub message_id: u64,
    pub sig: u64,
    pub mentions: u32,
    pub has_link: bool,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct JoinerProfile {
    pub user_id: u64,
    pub at: Instant,
    pub account_created: Option<DateTime<Utc>>,
    pub default_avatar: bool,
}

/// Zliczenie duplikatów w oknie: ile wiadomości i jaki podpis dominuje.
#[derive(Debug, Clone, Copy, Default)]
pub struct DuplicateStats {
    pub total: u32,
    pub top_count: u32,
    pub top_sig: u64,
}

impl DuplicateStats {
    pub fn ratio(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.top_count as f32 / self.total as f32
        }
    }
}

/// Paczka dowodowa dołączana do werdyktów.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EvidenceBundle {
    pub message_count: u32,
    pub destructive_count: u32,
    pub recent_messages: Vec<MessageEvidence>,
}

/* =========================================
   ActorStore
   ========================================= */

const MESSAGE_RING_HORIZON: Duration = Duration::from_secs(1800);
const JOINER_RING_CAP: usize = 256;

#[derive(Debug)]
pub struct ActorStore {
    cfg: StoreConfig,
    windows: Cache<(Scope, Metric), Arc<Mutex<Window>>>,
    messages: Cache<Scope, Arc<Mutex<VecDeque<MessageFp>>>>,
    joiners: Cache<u64, Arc<Mutex<VecDeque<JoinerProfile>>>>,
}

impl ActorStore {
    pub fn new(cfg: StoreConfig) -> Self {
        let idle = Duration::from_secs(cfg.idle_evict_hours * 3600);
        Self {
            cfg,
            windows: Cache::builder()
                .max_capacity(500_000)
                .time_to_idle(idle)
                .build(),
            messages: Cache::builder()
                .max_capacity(100_000)
                .time_to_idle(idle)
                .build(),
            joiners: Cache::builder()
                .max_capacity(50_000)
                .time_to_idle(idle)
                .build(),
        }
    }

    fn window(&self, scope: Scope, metric: Metric) -> Arc<Mutex<Window>> {
        let cap = self.cfg.window_cap;
        self.windows
            .entry((scope, metric))
            .or_insert_with(|| Arc::new(Mutex::new(Window::new(cap))))
            .into_value()
    }

    pub async fn record(&self, scope: Scope, metric: Metric, weight: u32) {
        self.record_at(scope, metric, Instant::now(), weight).await;
    }

    /// Wariant z jawnym czasem – testy wstrzykują syntetyczne sekwencje.
    pub async fn record_at(&self, scope: Scope, metric: Metric, at: Instant, weight: u32) {
        let w = self.window(scope, metric);
        let mut guard = w.lock().await;
        guard.record(at, weight, metric.horizon());
    }

    /// Ważona liczba próbek z ostatnich `within`, na chwilę wywołania.
    pub async fn count_in_window(&self, scope: Scope, metric: Metric, within: Duration) -> u32 {
        self.count_in_window_at(scope, metric, within, Instant::now())
            .await
    }

    pub async fn count_in_window_at(
        &self,
        scope: Scope,
        metric: Metric,
        within: Duration,
        now: Instant,
    ) -> u32 {
        match self.windows.get(&(scope, metric)) {
            Some(w) => w.lock().await.count_since(within, now),
            None => 0,
        }
    }

    pub async fn note_message(&self, scope: Scope, fp: MessageFp) {
        let ring_cap = self.cfg.message_ring;
        let buf = self
            .messages
            .entry(scope)
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::with_capacity(32))))
            .into_value();
        let mut guard = buf.lock().await;
        if guard.len() >= ring_cap {
            guard.pop_front();
        }
        guard.push_back(fp);
        prune_fps(&mut guard, MESSAGE_RING_HORIZON);
    }

    pub async fn recent_messages(&self, scope: Scope, within: Duration) -> Vec<MessageFp> {
        self.recent_messages_at(scope, within, Instant::now()).await
    }

    pub async fn recent_messages_at(
        &self,
        scope: Scope,
        within: Duration,
        now: Instant,
    ) -> Vec<MessageFp> {
        match self.messages.get(&scope) {
            Some(buf) => {
                let guard = buf.lock().await;
                guard
                    .iter()
                    .filter(|m| now.duration_since(m.at) <= within)
                    .cloned()
                    .collect()
            }
            None => Vec::new(),
        }
    }

    /// Statystyka duplikatów treści w oknie (dominujący podpis vs całość).
    pub async fn duplicate_stats(&self, scope: Scope, within: Duration) -> DuplicateStats {
        self.duplicate_stats_at(scope, within, Instant::now()).await
    }

    pub async fn duplicate_stats_at(
        &self,
        scope: Scope,
        within: Duration,
        now: Instant,
    ) -> DuplicateStats {
        let msgs = self.recent_messages_at(scope, within, now).await;
        let mut by_sig: HashMap<u64, u32> = HashMap::new();
        for m in &msgs {
            *by_sig.entry(m.sig).or_insert(0) += 1;
        }
        let (top_sig, top_count) = by_sig
            .into_iter()
            .max_by_key(|(_, c)| *c)
            .unwrap_or((0, 0));
        DuplicateStats {
            total: msgs.len() as u32,
            top_count,
            top_sig,
        }
    }

    pub async fn note_joiner(&self, guild_id: u64, profile: JoinerProfile) {
        let buf = self
            .joiners
            .entry(guild_id)
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::with_capacity(64))))
            .into_value();
        let mut guard = buf.lock().await;
        if guard.len() >= JOINER_RING_CAP {
            guard.pop_front();
        }
        guard.push_back(profile);
    }

    pub async fn recent_joiners(&self, guild_id: u64, within: Duration) -> Vec<JoinerProfile> {
        self.recent_joiners_at(guild_id, within, Instant::now())
            .await
    }

    pub async fn recent_joiners_at(
        &self,
        guild_id: u64,
        within: Duration,
        now: Instant,
    ) -> Vec<JoinerProfile> {
        match self.joiners.get(&guild_id) {
            Some(buf) => {
                let guard = buf.lock().await;
                guard
                    .iter()
                    .filter(|j| now.duration_since(j.at) <= within)
                    .cloned()
                    .collect()
            }
            None => Vec::new(),
        }
    }

    /// Migawka stanu aktora do paczki dowodowej werdyktu.
    pub async fn snapshot(&self, guild_id: u64, actor_id: u64) -> EvidenceBundle {
        let scope = Scope::Actor(guild_id, actor_id);
        let now = Instant::now();
        let minute = Duration::from_secs(60);
        EvidenceBundle {
            message_count: self
                .count_in_window_at(scope, Metric::Messages, minute, now)
                .await,
            destructive_count: self
                .count_in_window_at(scope, Metric::Destructive, minute, now)
                .await,
            recent_messages: self
                .recent_messages_at(scope, minute, now)
                .await
                .iter()
                .map(MessageFp::evidence)
                .collect(),
        }
    }
}

/* =========================================
   Normalizacja treści i tanie sygnały
   ========================================= */

fn prune_fps(q: &mut VecDeque<MessageFp>, window: Duration) {
    let now = Instant::now();
    while let Some(front) = q.front() {
        if now.duration_since(front.at) > window {
            q.pop_front();
        } else {
            break;
        }
    }
}

/// Składanie treści do podpisu: NFKC + lowercase + tylko alfanumeryki
/// i spacje – "FREE  nitro!!" i "free nitro" dostają ten sam sig.
pub fn normalize_content_for_sig(s: &str) -> String {
    let s = s.nfkc().collect::<String>().to_lowercase();
    s.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn fnv1a64(bytes: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x00000100000001B3;
    let mut hash = FNV_OFFSET;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

pub fn shannon_entropy(s: &str) -> f32 {
    let mut freq: HashMap<char, usize> = HashMap::new();
    let mut len = 0usize;
    for ch in s.chars() {
        len += 1;
        *freq.entry(ch).or_insert(0) += 1;
    }
    if len == 0 {
        return 0.0;
    }
    let len_f = len as f32;
    let mut entropy = 0.0f32;
    for &count in freq.values() {
        let p = count as f32 / len_f;
        entropy -= p * p.log2();
    }
    entropy
}
