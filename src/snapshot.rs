//! src/snapshot.rs
//! Sejf migawek struktury gildii + czysty plan przywracania.
//!
//! Rdzeń nie dotyka platformy poza `execute_moderation_action`, więc revert
//! jest tu danymi, nie wywołaniami: kolaborator odkłada co jakiś czas migawkę
//! ról/kanałów, a po decyzji `RevertAction` pobiera najnowszą i liczy
//! [restore_plan] – listę kroków do odegrania po swojej stronie seamu.
//! Wersje żyją w magazynie pod `backup/{guild}/{ts}`, stare wypadają.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::storage::{Storage, StorageError};

/// Ile wersji migawki trzymamy per gildia.
const KEEP_VERSIONS: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoleSnapshot {
    pub id: u64,
    pub name: String,
    pub position: i64,
    pub permissions: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelSnapshot {
    pub id: u64,
    pub name: String,
    pub kind: String,
    pub position: i64,
    pub parent_id: Option<u64>,
}

/// Uproszczona migawka stanu gildii – tyle, ile trzeba do odkręcenia nuke'a.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuildSnapshot {
    pub taken_at: DateTime<Utc>,
    pub roles: Vec<RoleSnapshot>,
    pub channels: Vec<ChannelSnapshot>,
}

/// Jeden krok planu przywracania. Wykonawcą jest kolaborator platformy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum RestoreStep {
    CreateRole { role: RoleSnapshot },
    UpdateRole { role: RoleSnapshot },
    DeleteRole { role_id: u64 },
    CreateChannel { channel: ChannelSnapshot },
    UpdateChannel { channel: ChannelSnapshot },
    DeleteChannel { channel_id: u64 },
}

/// Różnica `current` -> `desired` jako lista kroków: najpierw korekty
/// i kasowanie nadmiaru, potem odtworzenie braków.
pub fn restore_plan(current: &GuildSnapshot, desired: &GuildSnapshot) -> Vec<RestoreStep> {
    let mut steps = Vec::new();

    for r in &current.roles {
        match desired.roles.iter().find(|dr| dr.id == r.id) {
            Some(want) => {
                if r != want {
                    steps.push(RestoreStep::UpdateRole { role: want.clone() });
                }
            }
            None => steps.push(RestoreStep::DeleteRole { role_id: r.id }),
        }
    }
    for role in &desired.roles {
        if !current.roles.iter().any(|r| r.id == role.id) {
            steps.push(RestoreStep::CreateRole { role: role.clone() });
        }
    }

    for c in &current.channels {
        match desired.channels.iter().find(|dc| dc.id == c.id) {
            Some(want) => {
                if c != want {
                    steps.push(RestoreStep::UpdateChannel {
                        channel: want.clone(),
                    });
                }
            }
            None => steps.push(RestoreStep::DeleteChannel { channel_id: c.id }),
        }
    }
    for channel in &desired.channels {
        if !current.channels.iter().any(|c| c.id == channel.id) {
            steps.push(RestoreStep::CreateChannel {
                channel: channel.clone(),
            });
        }
    }

    steps
}

/// Wersjonowany magazyn migawek nad wąskim seamem [Storage].
pub struct SnapshotVault {
    storage: Arc<dyn Storage>,
}

impl SnapshotVault {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    fn prefix(guild_id: u64) -> String {
        format!("backup/{guild_id}/")
    }

    fn key(guild_id: u64, taken_at: DateTime<Utc>) -> String {
        // ms epoch z zerami – scan po prefiksie oddaje wersje chronologicznie
        format!("backup/{guild_id}/{:013}", taken_at.timestamp_millis())
    }

    /// Odłóż wersję migawki i utnij historię do [KEEP_VERSIONS].
    /// Błąd idzie w górę – kolaborator musi wiedzieć, że backup nie wszedł.
    pub async fn store(&self, guild_id: u64, snap: &GuildSnapshot) -> Result<(), StorageError> {
        let value = serde_json::to_value(snap)
            .map_err(|e| StorageError::Corrupt(format!("snapshot encode: {e}")))?;
        self.storage
            .put(&Self::key(guild_id, snap.taken_at), value)
            .await?;

        let rows = self.storage.scan_prefix(&Self::prefix(guild_id)).await?;
        if rows.len() > KEEP_VERSIONS {
            for (key, _) in &rows[..rows.len() - KEEP_VERSIONS] {
                self.storage.delete(key).await?;
            }
        }
        Ok(())
    }

    /// Najświeższa wersja; padnięty magazyn = brak migawki, nigdy panika.
    pub async fn latest(&self, guild_id: u64) -> Option<GuildSnapshot> {
        let rows = match self.storage.scan_prefix(&Self::prefix(guild_id)).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error=?e, guild_id, "snapshot scan failed");
                return None;
            }
        };
        let (key, value) = rows.into_iter().last()?;
        match serde_json::from_value(value) {
            Ok(snap) => Some(snap),
            Err(e) => {
                warn!(error=?e, %key, "skipping corrupt snapshot");
                None
            }
        }
    }

    pub async fn versions(&self, guild_id: u64) -> usize {
        match self.storage.scan_prefix(&Self::prefix(guild_id)).await {
            Ok(rows) => rows.len(),
            Err(_) => 0,
        }
    }
}
