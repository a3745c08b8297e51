//! End-to-end: surowe eventy platformy -> normalizacja -> detektory ->
//! arbiter -> egzekutor, z atrapą platformy i pamięciowym audytem.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use tigris_sentinel::audit::{AlertKind, Alerter, AuditRecord};
use tigris_sentinel::config::{
    App, ArbiterConfig, ExecutorConfig, GuildPolicy, Logging, Settings, StoreConfig,
    WatchdogConfig,
};
use tigris_sentinel::detect::{Action, Severity};
use tigris_sentinel::executor::{PlatformClient, PlatformError};
use tigris_sentinel::snapshot::{ChannelSnapshot, GuildSnapshot, RestoreStep, restore_plan};
use tigris_sentinel::{MemoryStorage, RawEvent, Sentinel};

/* ===================== atrapy kolaboratorów ===================== */

#[derive(Default)]
struct RecordingPlatform {
    calls: Mutex<Vec<(u64, Option<u64>, Action)>>,
}

#[async_trait]
impl PlatformClient for RecordingPlatform {
    async fn execute_moderation_action(
        &self,
        guild_id: u64,
        actor_id: Option<u64>,
        action: Action,
        _reason: &str,
    ) -> Result<(), PlatformError> {
        self.calls.lock().await.push((guild_id, actor_id, action));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingAlerter {
    alerts: Mutex<Vec<(AlertKind, Severity, String)>>,
}

#[async_trait]
impl Alerter for RecordingAlerter {
    async fn notify_admins(
        &self,
        _guild_id: Option<u64>,
        kind: AlertKind,
        severity: Severity,
        message: String,
    ) {
        self.alerts.lock().await.push((kind, severity, message));
    }
}

fn test_settings(policy: GuildPolicy) -> Settings {
    Settings {
        env: "test".into(),
        app: App {
            name: "test".into(),
        },
        logging: Logging {
            json: Some(false),
            level: Some("warn".into()),
        },
        store: StoreConfig::default(),
        arbiter: ArbiterConfig {
            correlation_ms: 200,
            expected_detectors: 32, // okno domyka timer, nie komplet
        },
        executor: ExecutorConfig {
            max_attempts: 2,
            backoff_base_ms: 5,
            pace_per_sec: 1000,
        },
        watchdog: WatchdogConfig::default(),
        policy,
    }
}

fn sentinel(policy: GuildPolicy) -> (Arc<Sentinel>, Arc<RecordingPlatform>, Arc<RecordingAlerter>) {
    let platform = Arc::new(RecordingPlatform::default());
    let alerter = Arc::new(RecordingAlerter::default());
    let s = Sentinel::bootstrap(
        test_settings(policy),
        platform.clone(),
        Arc::new(MemoryStorage::default()),
        alerter.clone(),
    );
    (s, platform, alerter)
}

/* ===================== fabryki eventów ===================== */

fn message(guild: u64, author: u64, id: u64, content: &str) -> RawEvent {
    RawEvent {
        kind: "MESSAGE_CREATE".into(),
        guild_id: Some(guild),
        payload: json!({
            "id": id.to_string(),
            "author": {"id": author.to_string()},
            "content": content,
            "mentions": []
        }),
        ts_ms: None,
    }
}

/// Stare konto (snowflake z 2015) z ustawionym avatarem.
fn ordinary_join(guild: u64, seq: u64) -> RawEvent {
    let user_id = (seq + 1) << 22;
    RawEvent {
        kind: "GUILD_MEMBER_ADD".into(),
        guild_id: Some(guild),
        payload: json!({
            "user": {"id": user_id.to_string(), "avatar": "a1b2c3"}
        }),
        ts_ms: None,
    }
}

fn channel_delete(guild: u64, actor: u64, channel: u64) -> RawEvent {
    RawEvent {
        kind: "CHANNEL_DELETE".into(),
        guild_id: Some(guild),
        payload: json!({"id": channel.to_string(), "actor_id": actor.to_string()}),
        ts_ms: None,
    }
}

fn decisions_in(records: &[AuditRecord]) -> Vec<&tigris_sentinel::arbiter::Decision> {
    records
        .iter()
        .filter_map(|r| match r {
            AuditRecord::Decision { decision } => Some(decision),
            _ => None,
        })
        .collect()
}

/* ===================== scenariusze ===================== */

#[tokio::test]
async fn join_wave_locks_down_once_and_coalesces_stragglers() {
    let mut policy = GuildPolicy::default();
    policy.raid.join_threshold = 20;
    policy.raid.window_secs = 60;
    let (s, platform, _) = sentinel(policy);

    for i in 0..50u64 {
        s.process(&ordinary_join(1, i)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    // dokładnie jedna decyzja lockdownu trafiła na platformę
    let calls = platform.calls.lock().await.clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], (1, None, Action::LockdownChannel));

    let records = s.audit().records_for(1).await;
    let decisions = decisions_in(&records);
    assert_eq!(decisions.len(), 1);
    // joiny 20..=50 dały 31 werdyktów: wszystkie w jednej decyzji
    // albo doklejone do niej – żaden nie przepadł po cichu
    let coalesced_before = s.audit().coalesced_count(1).await;
    assert_eq!(decisions[0].verdicts.len() + coalesced_before, 31);

    // 51. join w tym samym cool-downie: żadnej drugiej decyzji,
    // ale dowód ląduje przy istniejącej
    s.process(&ordinary_join(1, 50)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(platform.calls.lock().await.len(), 1);
    let records = s.audit().records_for(1).await;
    assert_eq!(decisions_in(&records).len(), 1);
    assert_eq!(s.audit().coalesced_count(1).await, coalesced_before + 1);
}

#[tokio::test]
async fn message_flood_ends_as_single_mute_decision() {
    let (s, platform, _) = sentinel(GuildPolicy::default()); // burst_high=10/10s

    for i in 0..12u64 {
        s.process(&message(2, 777, i + 1, &format!("kupujcie {i}")))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    let calls = platform.calls.lock().await.clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], (2, Some(777), Action::Mute));

    let records = s.audit().records_for(2).await;
    let decisions = decisions_in(&records);
    assert_eq!(decisions.len(), 1);
    let d = decisions[0];
    assert_eq!(d.severity, Severity::High);
    // werdykt, który odpalił na dziesiątej wiadomości, niesie dowody 1..10
    let first_high = d
        .verdicts
        .iter()
        .find(|v| v.severity == Severity::High)
        .expect("wśród składowych jest werdykt High");
    assert_eq!(first_high.evidence.messages.len(), 10);
    assert_eq!(first_high.evidence.messages[0].message_id, 1);
    assert_eq!(first_high.evidence.messages[9].message_id, 10);
}

#[tokio::test]
async fn second_channel_delete_triggers_revert() {
    let (s, platform, _) = sentinel(GuildPolicy::default()); // nuke burst=2/10s

    s.process(&channel_delete(3, 9, 100)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;
    // pierwsza akcja: cisza
    assert!(platform.calls.lock().await.is_empty());

    s.process(&channel_delete(3, 9, 101)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let calls = platform.calls.lock().await.clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], (3, Some(9), Action::RevertAction));

    let records = s.audit().records_for(3).await;
    let decisions = decisions_in(&records);
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].severity, Severity::Critical);
}

#[tokio::test]
async fn revert_decision_pairs_with_restore_plan_from_vault() {
    let (s, platform, _) = sentinel(GuildPolicy::default());

    // kolaborator odkłada migawkę zdrowej struktury zanim cokolwiek się dzieje
    let text_channel = |id: u64, name: &str| ChannelSnapshot {
        id,
        name: name.into(),
        kind: "text".into(),
        position: 0,
        parent_id: None,
    };
    let healthy = GuildSnapshot {
        taken_at: chrono::Utc::now(),
        roles: vec![],
        channels: vec![text_channel(100, "ogólny"), text_channel(101, "memy")],
    };
    s.vault().store(6, &healthy).await.unwrap();

    s.process(&channel_delete(6, 9, 100)).await.unwrap();
    s.process(&channel_delete(6, 9, 101)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let calls = platform.calls.lock().await.clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], (6, Some(9), Action::RevertAction));

    // po stronie kolaboratora: stan po ataku vs najnowsza migawka z sejfu
    let after_attack = GuildSnapshot {
        taken_at: chrono::Utc::now(),
        roles: vec![],
        channels: vec![],
    };
    let desired = s.vault().latest(6).await.expect("migawka sprzed ataku");
    let plan = restore_plan(&after_attack, &desired);
    assert_eq!(
        plan,
        vec![
            RestoreStep::CreateChannel {
                channel: text_channel(100, "ogólny")
            },
            RestoreStep::CreateChannel {
                channel: text_channel(101, "memy")
            },
        ]
    );
}

#[tokio::test]
async fn unknown_event_is_rejected_not_swallowed() {
    let (s, platform, _) = sentinel(GuildPolicy::default());
    let raw = RawEvent {
        kind: "PRESENCE_UPDATE".into(),
        guild_id: Some(4),
        payload: json!({}),
        ts_ms: None,
    };
    assert!(s.process(&raw).await.is_err());
    assert!(platform.calls.lock().await.is_empty());
}

#[tokio::test]
async fn bot_messages_flow_through_without_detection() {
    let (s, platform, _) = sentinel(GuildPolicy::default());
    for i in 0..20u64 {
        let raw = RawEvent {
            kind: "MESSAGE_CREATE".into(),
            guild_id: Some(5),
            payload: json!({
                "id": i.to_string(),
                "author": {"id": "42", "bot": true},
                "content": "status ping"
            }),
            ts_ms: None,
        };
        s.process(&raw).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(platform.calls.lock().await.is_empty());
}
