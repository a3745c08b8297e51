use anyhow::Result;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub env: String,
    pub app: App,
    pub logging: Logging,
    pub store: StoreConfig,
    pub arbiter: ArbiterConfig,
    pub executor: ExecutorConfig,
    pub watchdog: WatchdogConfig,
    pub policy: GuildPolicy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct App {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Logging {
    pub json: Option<bool>,
    pub level: Option<String>,
}

/// Limity pamięciowe magazynu okien (ActorStore).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Po ilu godzinach bezczynności aktor wylatuje z areny w całości.
    pub idle_evict_hours: u64,
    /// Twardy limit próbek w pojedynczym oknie.
    pub window_cap: usize,
    /// Ile ostatnich wiadomości pamiętamy per aktor (dowody + duplikaty).
    pub message_ring: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            idle_evict_hours: 24,
            window_cap: 4096,
            message_ring: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArbiterConfig {
    /// Okno korelacji werdyktów dla tej samej pary (guild, actor).
    pub correlation_ms: u64,
    /// Ilu detektorów się spodziewamy – komplet werdyktów zamyka okno wcześniej.
    pub expected_detectors: usize,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            correlation_ms: 2_000,
            expected_detectors: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    /// Tempo wywołań platformy (calls/s) – wspólne dla wszystkich gildii.
    pub pace_per_sec: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff_base_ms: 500,
            pace_per_sec: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatchdogConfig {
    /// Co ile sekund przegląd zdrowia detektorów.
    pub check_interval_secs: u64,
    /// Detektor milczący dłużej (przy płynących eventach) = podejrzenie awarii.
    pub silent_after_secs: u64,
    /// Tyle błędów w oknie 5 min wywołuje alert zdrowotny.
    pub error_burst: u32,
    /// Minimalna przerwa między alertami zdrowotnymi dla jednego detektora.
    pub alert_cooldown_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            silent_after_secs: 6 * 3600,
            error_burst: 10,
            alert_cooldown_secs: 300,
        }
    }
}

/* =========================================
   Polityka per-guild (progi detektorów)
   ========================================= */

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GuildPolicy {
    pub spam: SpamPolicy,
    pub raid: RaidPolicy,
    pub nuke: NukePolicy,
    pub content: ContentPolicy,
    pub cooldown: CooldownPolicy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpamPolicy {
    /// Wiadomości w oknie dające werdykt Medium.
    pub burst_medium: u32,
    /// Wiadomości w oknie dające werdykt High.
    pub burst_high: u32,
    pub window_secs: u64,
    /// Udział niemal identycznych wiadomości w oknie (0..1) dający High.
    pub duplicate_ratio: f32,
    /// Poniżej tylu próbek nie liczymy ratio (za mało danych).
    pub duplicate_min_samples: u32,
    pub mention_threshold: u32,
    /// Sugerowana kara (oryginalnie: mute/kick/ban, domyślnie mute).
    pub punishment: crate::detect::Action,
}

impl Default for SpamPolicy {
    fn default() -> Self {
        Self {
            burst_medium: 5,
            burst_high: 10,
            window_secs: 10,
            duplicate_ratio: 0.6,
            duplicate_min_samples: 4,
            mention_threshold: 5,
            punishment: crate::detect::Action::Mute,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RaidPolicy {
    /// Joinów w oknie uznawanych za rajd.
    pub join_threshold: u32,
    pub window_secs: u64,
    /// Taki odsetek podejrzanych kont wśród świeżych joinów podbija do Critical.
    pub suspicious_ratio: f32,
}

impl Default for RaidPolicy {
    fn default() -> Self {
        Self {
            join_threshold: 10,
            window_secs: 60,
            suspicious_ratio: 0.6,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NukePolicy {
    /// Akcje destrukcyjne w krótkim oknie; odpalamy już na drugiej.
    pub burst: u32,
    pub window_secs: u64,
}

impl Default for NukePolicy {
    fn default() -> Self {
        Self {
            burst: 2,
            window_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContentPolicy {
    /// score >= low_band → Low, score >= high_band → Medium.
    pub low_band: f32,
    pub high_band: f32,
}

impl Default for ContentPolicy {
    fn default() -> Self {
        Self {
            low_band: 0.60,
            high_band: 0.85,
        }
    }
}

/// Cool-down decyzji zależny od powagi – Critical celowo długi, żeby
/// sprzątanie po incydencie nie odpalało detektorów w kółko.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CooldownPolicy {
    pub low_secs: u64,
    pub medium_secs: u64,
    pub high_secs: u64,
    pub critical_secs: u64,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            low_secs: 60,
            medium_secs: 120,
            high_secs: 300,
            critical_secs: 900,
        }
    }
}

/// Progi per-guild z gorącą podmianą: default z Settings + nadpisania
/// wrzucane w locie przez zewnętrzny loader konfiguracji (bez restartu).
#[derive(Debug)]
pub struct Policies {
    default: GuildPolicy,
    overrides: DashMap<u64, GuildPolicy>,
}

impl Policies {
    pub fn new(default: GuildPolicy) -> Self {
        Self {
            default,
            overrides: DashMap::new(),
        }
    }

    pub fn for_guild(&self, guild_id: u64) -> GuildPolicy {
        self.overrides
            .get(&guild_id)
            .map(|e| e.clone())
            .unwrap_or_else(|| self.default.clone())
    }

    /// Podmień politykę gildii atomowo (hot-reload).
    pub fn apply(&self, guild_id: u64, policy: GuildPolicy) {
        self.overrides.insert(guild_id, policy);
    }

    /// Wróć do domyślnych dla gildii.
    pub fn clear(&self, guild_id: u64) {
        self.overrides.remove(&guild_id);
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        // Które środowisko?
        let env = std::env::var("TSN_ENV").unwrap_or_else(|_| "development".to_string());

        // Załaduj .env.<env> i .env (jeśli są)
        let _ = dotenvy::from_filename(format!(".env.{}", env));
        let _ = dotenvy::dotenv();

        // Domyślne wartości
        #[derive(Deserialize, Serialize)]
        struct Defaults {
            env: String,
            app: App,
            logging: Logging,
            store: StoreConfig,
            arbiter: ArbiterConfig,
            executor: ExecutorConfig,
            watchdog: WatchdogConfig,
            policy: GuildPolicy,
        }

        let defaults = Defaults {
            env: env.clone(),
            app: App {
                name: "Tigris Sentinel".into(),
            },
            logging: Logging {
                json: Some(false),
                level: Some("info".into()),
            },
            store: StoreConfig::default(),
            arbiter: ArbiterConfig::default(),
            executor: ExecutorConfig::default(),
            watchdog: WatchdogConfig::default(),
            policy: GuildPolicy::default(),
        };

        // Warstwy: domyślne -> plik TOML -> zmienne środowiskowe TSN_*
        let figment = Figment::from(Serialized::defaults(defaults))
            .merge(Toml::file(format!("config/{}.toml", env)))
            // TSN_POLICY_SPAM_BURSTHIGH => policy.spam.burst_high itd.
            .merge(Env::prefixed("TSN_").split("_"));

        let mut s: Settings = figment.extract()?;
        s.env = env;

        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_win_and_clear_restores_default() {
        let policies = Policies::new(GuildPolicy::default());
        assert_eq!(policies.for_guild(7).spam.burst_high, 10);

        let mut custom = GuildPolicy::default();
        custom.spam.burst_high = 3;
        policies.apply(7, custom);
        assert_eq!(policies.for_guild(7).spam.burst_high, 3);
        // inne gildie bez zmian
        assert_eq!(policies.for_guild(8).spam.burst_high, 10);

        policies.clear(7);
        assert_eq!(policies.for_guild(7).spam.burst_high, 10);
    }
}
