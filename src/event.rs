//! src/event.rs
//! Wewnętrzna algebra zdarzeń + normalizacja surowych eventów platformy.
//!
//! Klient gateway (poza tym crate) dostarcza [RawEvent] w kształcie zbliżonym
//! do payloadów Discorda; my mapujemy to na małe, zamknięte [EventKind].
//! Uwaga: eventy CHANNEL_DELETE / GUILD_ROLE_DELETE / GUILD_BAN_ADD /
//! MESSAGE_DELETE_BULK muszą być wzbogacone o `actor_id` (sprawcę z audit
//! logu) po stronie klienta – sam gateway go nie niesie.

use std::time::Instant;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Surowy event z platformy, tak jak oddaje go klient gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawEvent {
    /// Nazwa typu eventu, np. "MESSAGE_CREATE".
    pub kind: String,
    pub guild_id: Option<u64>,
    /// Payload specyficzny dla typu (kształt jak w API platformy).
    pub payload: Value,
    /// Znacznik czasu platformy (ms epoch), jeśli go dała.
    pub ts_ms: Option<i64>,
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("unrecognized platform event: {0}")]
    Unrecognized(String),
    #[error("event outside guild context: {0}")]
    NoGuild(String),
    #[error("missing field `{0}` in {1} payload")]
    MissingField(&'static str, &'static str),
}

/// Znormalizowane zdarzenie. Niemutowalne; po złożeniu do okien jest porzucane.
#[derive(Debug, Clone)]
pub struct Event {
    pub guild_id: u64,
    /// Sprawca: autor wiadomości, dołączający, wykonawca akcji destrukcyjnej.
    pub actor_id: u64,
    pub kind: EventKind,
    /// Monotoniczny czas przyjęcia – to nim żyją okna przesuwne.
    pub at: Instant,
    /// Czas ścienny do audytu.
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    Message {
        message_id: u64,
        content: String,
        mentions: u32,
    },
    Join {
        account_created: Option<DateTime<Utc>>,
        default_avatar: bool,
        invite_code: Option<String>,
    },
    ChannelDelete {
        channel_id: u64,
    },
    RoleDelete {
        role_id: u64,
    },
    BanCreate {
        target_id: u64,
    },
    /// Zbiorcza akcja (bulk delete itp.) – waga w oknach = liczba celów.
    MassAction {
        targets: u32,
    },
}

impl EventKind {
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::Message { .. } => "message",
            EventKind::Join { .. } => "join",
            EventKind::ChannelDelete { .. } => "channel_delete",
            EventKind::RoleDelete { .. } => "role_delete",
            EventKind::BanCreate { .. } => "ban_create",
            EventKind::MassAction { .. } => "mass_action",
        }
    }

    /// Czy event liczy się do okna akcji destrukcyjnych.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            EventKind::ChannelDelete { .. }
                | EventKind::RoleDelete { .. }
                | EventKind::BanCreate { .. }
                | EventKind::MassAction { .. }
        )
    }
}

/// Epoka snowflake'ów platformy (2015-01-01 UTC, ms) – wiek konta liczymy
/// z samego ID, bez dodatkowego round-tripu do API.
const SNOWFLAKE_EPOCH_MS: i64 = 1_420_070_400_000;

pub fn snowflake_created_at(id: u64) -> Option<DateTime<Utc>> {
    let ts_ms = (id >> 22) as i64 + SNOWFLAKE_EPOCH_MS;
    Utc.timestamp_millis_opt(ts_ms).single()
}

/// Czysta funkcja: surowy event -> [Event].
/// `Ok(None)` dla eventów celowo ignorowanych (wiadomości botów).
pub fn normalize(raw: &RawEvent) -> Result<Option<Event>, NormalizeError> {
    let at = Instant::now();
    let ts = raw
        .ts_ms
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);

    let guild_id = raw
        .guild_id
        .ok_or_else(|| NormalizeError::NoGuild(raw.kind.clone()))?;

    let (actor_id, kind) = match raw.kind.as_str() {
        "MESSAGE_CREATE" => {
            let author = &raw.payload["author"];
            if author["bot"].as_bool().unwrap_or(false) {
                return Ok(None);
            }
            let author_id = snowflake(&author["id"])
                .ok_or(NormalizeError::MissingField("author.id", "MESSAGE_CREATE"))?;
            let message_id = snowflake(&raw.payload["id"])
                .ok_or(NormalizeError::MissingField("id", "MESSAGE_CREATE"))?;
            let content = raw.payload["content"].as_str().unwrap_or("").to_string();
            let mentions = raw.payload["mentions"]
                .as_array()
                .map(|a| a.len() as u32)
                .unwrap_or(0);
            (
                author_id,
                EventKind::Message {
                    message_id,
                    content,
                    mentions,
                },
            )
        }
        "GUILD_MEMBER_ADD" => {
            let user = &raw.payload["user"];
            if user["bot"].as_bool().unwrap_or(false) {
                return Ok(None);
            }
            let user_id = snowflake(&user["id"])
                .ok_or(NormalizeError::MissingField("user.id", "GUILD_MEMBER_ADD"))?;
            let default_avatar = user["avatar"].is_null();
            let invite_code = raw.payload["invite_code"].as_str().map(str::to_string);
            (
                user_id,
                EventKind::Join {
                    account_created: snowflake_created_at(user_id),
                    default_avatar,
                    invite_code,
                },
            )
        }
        "CHANNEL_DELETE" => {
            let actor = snowflake(&raw.payload["actor_id"])
                .ok_or(NormalizeError::MissingField("actor_id", "CHANNEL_DELETE"))?;
            let channel_id = snowflake(&raw.payload["id"])
                .ok_or(NormalizeError::MissingField("id", "CHANNEL_DELETE"))?;
            (actor, EventKind::ChannelDelete { channel_id })
        }
        "GUILD_ROLE_DELETE" => {
            let actor = snowflake(&raw.payload["actor_id"])
                .ok_or(NormalizeError::MissingField("actor_id", "GUILD_ROLE_DELETE"))?;
            let role_id = snowflake(&raw.payload["role_id"])
                .ok_or(NormalizeError::MissingField("role_id", "GUILD_ROLE_DELETE"))?;
            (actor, EventKind::RoleDelete { role_id })
        }
        "GUILD_BAN_ADD" => {
            let actor = snowflake(&raw.payload["actor_id"])
                .ok_or(NormalizeError::MissingField("actor_id", "GUILD_BAN_ADD"))?;
            let target_id = snowflake(&raw.payload["user"]["id"])
                .ok_or(NormalizeError::MissingField("user.id", "GUILD_BAN_ADD"))?;
            (actor, EventKind::BanCreate { target_id })
        }
        "MESSAGE_DELETE_BULK" => {
            let actor = snowflake(&raw.payload["actor_id"]).ok_or(NormalizeError::MissingField(
                "actor_id",
                "MESSAGE_DELETE_BULK",
            ))?;
            let targets = raw.payload["ids"]
                .as_array()
                .map(|a| a.len() as u32)
                .unwrap_or(1)
                .max(1);
            (actor, EventKind::MassAction { targets })
        }
        other => return Err(NormalizeError::Unrecognized(other.to_string())),
    };

    Ok(Some(Event {
        guild_id,
        actor_id,
        kind,
        at,
        ts,
    }))
}

/// ID platformy przychodzą raz jako stringi, raz jako liczby.
fn snowflake(v: &Value) -> Option<u64> {
    match v {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(kind: &str, guild: Option<u64>, payload: Value) -> RawEvent {
        RawEvent {
            kind: kind.into(),
            guild_id: guild,
            payload,
            ts_ms: None,
        }
    }

    #[test]
    fn message_create_maps_author_and_mentions() {
        let ev = normalize(&raw(
            "MESSAGE_CREATE",
            Some(1),
            json!({
                "id": "111",
                "author": {"id": "222"},
                "content": "hej",
                "mentions": [{"id": "1"}, {"id": "2"}]
            }),
        ))
        .unwrap()
        .unwrap();
        assert_eq!(ev.guild_id, 1);
        assert_eq!(ev.actor_id, 222);
        match ev.kind {
            EventKind::Message {
                message_id,
                mentions,
                ..
            } => {
                assert_eq!(message_id, 111);
                assert_eq!(mentions, 2);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn bot_messages_are_dropped() {
        let out = normalize(&raw(
            "MESSAGE_CREATE",
            Some(1),
            json!({"id": "1", "author": {"id": "2", "bot": true}, "content": "x"}),
        ))
        .unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let err = normalize(&raw("TYPING_START", Some(1), json!({}))).unwrap_err();
        assert!(matches!(err, NormalizeError::Unrecognized(_)));
    }

    #[test]
    fn channel_delete_requires_audit_actor() {
        let err = normalize(&raw("CHANNEL_DELETE", Some(1), json!({"id": "5"}))).unwrap_err();
        assert!(matches!(
            err,
            NormalizeError::MissingField("actor_id", "CHANNEL_DELETE")
        ));
    }

    #[test]
    fn join_derives_account_age_from_snowflake() {
        // ID z 2015 roku -> konto stare
        let old_id: u64 = 1 << 22;
        let ev = normalize(&raw(
            "GUILD_MEMBER_ADD",
            Some(1),
            json!({"user": {"id": old_id.to_string(), "avatar": null}}),
        ))
        .unwrap()
        .unwrap();
        match ev.kind {
            EventKind::Join {
                account_created,
                default_avatar,
                ..
            } => {
                assert!(default_avatar);
                let created = account_created.unwrap();
                assert_eq!(created.timestamp_millis(), SNOWFLAKE_EPOCH_MS + 1);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn bulk_delete_counts_targets() {
        let ev = normalize(&raw(
            "MESSAGE_DELETE_BULK",
            Some(3),
            json!({"actor_id": "9", "ids": ["1", "2", "3"]}),
        ))
        .unwrap()
        .unwrap();
        match ev.kind {
            EventKind::MassAction { targets } => assert_eq!(targets, 3),
            other => panic!("unexpected kind: {other:?}"),
        }
    }
}
