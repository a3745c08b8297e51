//! src/engine.rs
//! Sentinel – spięcie całego rdzenia: normalizacja, złożenie eventu do okien,
//! równoległy fan-out na detektory, arbitraż i egzekucja.
//!
//! Każdy event to niezależna jednostka pracy; detektory tego samego eventu
//! biegną współbieżnie, a serializacja odbywa się wyłącznie per klucz
//! w ActorStore. Błąd jednego detektora nie zatrzymuje pozostałych.

use std::sync::Arc;

use anyhow::Result;
use futures_util::future::join_all;
use tracing::warn;

use crate::arbiter::{Arbiter, DecisionRegistry, DecisionSink};
use crate::audit::{Alerter, AuditLog, StatusReport, Watchdog};
use crate::config::{Policies, Settings};
use crate::detect::{
    Detector,
    content::{ContentRiskDetector, ContentScorer},
    nuke::NukeDetector,
    raid::{JoinRiskScorer, RaidDetector},
    spam::SpamDetector,
};
use crate::event::{self, Event, EventKind, RawEvent};
use crate::executor::{ActionExecutor, PlatformClient};
use crate::logging;
use crate::snapshot::SnapshotVault;
use crate::state::{ActorStore, JoinerProfile, MessageFp, Metric, Scope};
use crate::storage::Storage;

pub struct Sentinel {
    pub settings: Settings,
    policies: Arc<Policies>,
    store: Arc<ActorStore>,
    detectors: Vec<Arc<dyn Detector>>,
    arbiter: Arc<Arbiter>,
    executor: Arc<ActionExecutor>,
    audit: Arc<AuditLog>,
    watchdog: Arc<Watchdog>,
    vault: Arc<SnapshotVault>,
}

impl Sentinel {
    /// Bootstrap rdzenia: logi, magazyny, detektory z domyślnymi scorerami.
    pub fn bootstrap(
        settings: Settings,
        platform: Arc<dyn PlatformClient>,
        storage: Arc<dyn Storage>,
        alerter: Arc<dyn Alerter>,
    ) -> Arc<Self> {
        logging::init(&settings);
        Self::bootstrap_with(
            settings,
            platform,
            storage,
            alerter,
            Arc::new(crate::detect::content::LexicalScorer),
            Arc::new(crate::detect::raid::AccountAgeScorer::default()),
        )
    }

    /// Wariant z wstrzykniętymi scorerami (produkcyjny model treści,
    /// własna heurystyka kont rajdowych).
    pub fn bootstrap_with(
        settings: Settings,
        platform: Arc<dyn PlatformClient>,
        storage: Arc<dyn Storage>,
        alerter: Arc<dyn Alerter>,
        content_scorer: Arc<dyn ContentScorer>,
        join_scorer: Arc<dyn JoinRiskScorer>,
    ) -> Arc<Self> {
        let policies = Arc::new(Policies::new(settings.policy.clone()));
        let store = Arc::new(ActorStore::new(settings.store.clone()));
        let audit = Arc::new(AuditLog::new(storage.clone()));
        let vault = Arc::new(SnapshotVault::new(storage));
        let watchdog = Arc::new(Watchdog::new(settings.watchdog.clone(), alerter.clone()));
        Watchdog::spawn_health_task(&watchdog, audit.clone());

        let registry = Arc::new(DecisionRegistry::default());
        let executor = ActionExecutor::new(
            settings.executor.clone(),
            platform,
            registry.clone(),
            audit.clone(),
            alerter,
        );
        let sink: Arc<dyn DecisionSink> = Arc::new(executor.clone());
        let arbiter = Arbiter::new(
            settings.arbiter.clone(),
            policies.clone(),
            registry,
            sink,
            audit.clone(),
        );

        let detectors: Vec<Arc<dyn Detector>> = vec![
            Arc::new(SpamDetector),
            Arc::new(RaidDetector::new(join_scorer)),
            Arc::new(NukeDetector),
            Arc::new(ContentRiskDetector::new(content_scorer)),
        ];
        for d in &detectors {
            watchdog.register(d.name());
        }

        Arc::new(Self {
            settings,
            policies,
            store,
            detectors,
            arbiter,
            executor,
            audit,
            watchdog,
            vault,
        })
    }

    /* ---------- wejście ---------- */

    /// Jedyne wejście z platformy: przyjmij surowy event i odpal niezależną
    /// jednostkę pracy. Nieznane eventy tylko logujemy.
    pub fn ingest(self: &Arc<Self>, raw: RawEvent) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.process(&raw).await {
                warn!(error=?e, kind = %raw.kind, "event rejected by normalizer");
            }
        });
    }

    /// Synchroniczny (awaitowalny) wariant `ingest` – pełny pipeline
    /// jednego eventu; decyzje i tak schodzą asynchronicznie.
    pub async fn process(&self, raw: &RawEvent) -> Result<()> {
        let Some(ev) = event::normalize(raw)? else {
            return Ok(()); // celowo ignorowane (boty)
        };
        self.handle(ev).await;
        Ok(())
    }

    async fn handle(&self, ev: Event) {
        self.watchdog.note_event();
        self.fold(&ev).await;

        let policy = self.policies.for_guild(ev.guild_id);
        let results = join_all(
            self.detectors
                .iter()
                .map(|d| d.inspect(&ev, &self.store, &policy)),
        )
        .await;

        for (detector, result) in self.detectors.iter().zip(results) {
            match result {
                Ok(Some(verdict)) => {
                    self.audit.record_verdict(&verdict).await;
                    self.watchdog.note_verdict(detector.name());
                    self.arbiter.submit(verdict).await;
                }
                Ok(None) => {}
                Err(e) => {
                    // izolacja: liczymy do zdrowia, reszta detektorów jedzie
                    warn!(error=?e, detector = detector.name(), "detector failed");
                    self.watchdog.note_error(detector.name());
                }
            }
        }
    }

    /// Złożenie eventu do okien – dzieje się PRZED fan-outem, więc detektory
    /// widzą event, który właśnie przyszedł.
    async fn fold(&self, ev: &Event) {
        match &ev.kind {
            EventKind::Message {
                message_id,
                content,
                mentions,
            } => {
                let scope = Scope::Actor(ev.guild_id, ev.actor_id);
                self.store.record_at(scope, Metric::Messages, ev.at, 1).await;
                self.store
                    .note_message(
                        scope,
                        MessageFp::from_content(*message_id, content, *mentions, ev.at, ev.ts),
                    )
                    .await;
            }
            EventKind::Join {
                account_created,
                default_avatar,
                ..
            } => {
                self.store
                    .record_at(Scope::Guild(ev.guild_id), Metric::Joins, ev.at, 1)
                    .await;
                self.store
                    .note_joiner(
                        ev.guild_id,
                        JoinerProfile {
                            user_id: ev.actor_id,
                            at: ev.at,
                            account_created: *account_created,
                            default_avatar: *default_avatar,
                        },
                    )
                    .await;
            }
            EventKind::ChannelDelete { .. }
            | EventKind::RoleDelete { .. }
            | EventKind::BanCreate { .. } => {
                self.store
                    .record_at(
                        Scope::Actor(ev.guild_id, ev.actor_id),
                        Metric::Destructive,
                        ev.at,
                        1,
                    )
                    .await;
            }
            EventKind::MassAction { targets } => {
                self.store
                    .record_at(
                        Scope::Actor(ev.guild_id, ev.actor_id),
                        Metric::Destructive,
                        ev.at,
                        (*targets).max(1),
                    )
                    .await;
            }
        }
    }

    /* ---------- uchwyty dla kolaboratorów ---------- */

    pub fn policies(&self) -> Arc<Policies> {
        self.policies.clone()
    }

    pub fn audit(&self) -> Arc<AuditLog> {
        self.audit.clone()
    }

    pub fn executor(&self) -> Arc<ActionExecutor> {
        self.executor.clone()
    }

    /// Sejf migawek: kolaborator odkłada tu strukturę gildii i po decyzji
    /// `RevertAction` liczy z najnowszej wersji plan przywracania.
    pub fn vault(&self) -> Arc<SnapshotVault> {
        self.vault.clone()
    }

    pub fn status_report(&self) -> StatusReport {
        self.watchdog.status_report(&self.audit)
    }
}
