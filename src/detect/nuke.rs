//! Anty-nuke: tempo akcji destrukcyjnych per AKTOR. Szkody są frontloaded,
//! więc odpalamy już na drugiej akcji w krótkim oknie – nie czekamy,
//! aż okno się wypełni.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::GuildPolicy;
use crate::event::Event;
use crate::state::{ActorStore, Metric, Scope};

use super::{Action, Detector, Evidence, Severity, Verdict};

pub struct NukeDetector;

#[async_trait]
impl Detector for NukeDetector {
    fn name(&self) -> &'static str {
        "nuke"
    }

    async fn inspect(
        &self,
        ev: &Event,
        store: &ActorStore,
        policy: &GuildPolicy,
    ) -> anyhow::Result<Option<Verdict>> {
        if !ev.kind.is_destructive() {
            return Ok(None);
        }
        let p = &policy.nuke;
        let scope = Scope::Actor(ev.guild_id, ev.actor_id);
        let window = Duration::from_secs(p.window_secs);

        let count = store
            .count_in_window_at(scope, Metric::Destructive, window, ev.at)
            .await;
        if count < p.burst {
            return Ok(None);
        }

        let bundle = store.snapshot(ev.guild_id, ev.actor_id).await;
        Ok(Some(Verdict {
            detector: self.name().into(),
            guild_id: ev.guild_id,
            actor_id: Some(ev.actor_id),
            severity: Severity::Critical,
            action: Action::RevertAction,
            reason: format!(
                "destructive burst: {count}/{}s ({}); strip roles and revert",
                p.window_secs,
                ev.kind.label()
            ),
            evidence: Evidence {
                notes: vec![format!("destructive={count}")],
                bundle: Some(bundle),
                ..Default::default()
            },
            ts: Utc::now(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::event::EventKind;
    use std::time::Instant;

    fn delete_event(guild: u64, actor: u64, id: u64, at: Instant) -> Event {
        Event {
            guild_id: guild,
            actor_id: actor,
            kind: EventKind::ChannelDelete { channel_id: id },
            at,
            ts: Utc::now(),
        }
    }

    async fn fold(store: &ActorStore, ev: &Event) {
        let weight = match ev.kind {
            EventKind::MassAction { targets } => targets,
            _ => 1,
        };
        store
            .record_at(
                Scope::Actor(ev.guild_id, ev.actor_id),
                Metric::Destructive,
                ev.at,
                weight,
            )
            .await;
    }

    #[tokio::test]
    async fn fires_on_second_action_not_first() {
        let store = ActorStore::new(StoreConfig::default());
        let policy = GuildPolicy::default(); // burst=2 / 10s
        let det = NukeDetector;
        let start = Instant::now();

        let first = delete_event(1, 66, 10, start);
        fold(&store, &first).await;
        assert!(det.inspect(&first, &store, &policy).await.unwrap().is_none());

        let second = delete_event(1, 66, 11, start + Duration::from_secs(3));
        fold(&store, &second).await;
        let v = det
            .inspect(&second, &store, &policy)
            .await
            .unwrap()
            .expect("druga akcja w oknie musi odpalić");
        assert_eq!(v.severity, Severity::Critical);
        assert_eq!(v.action, Action::RevertAction);
    }

    #[tokio::test]
    async fn slow_deletes_outside_window_do_not_fire() {
        let store = ActorStore::new(StoreConfig::default());
        let policy = GuildPolicy::default();
        let det = NukeDetector;
        let start = Instant::now();

        let first = delete_event(1, 66, 10, start);
        fold(&store, &first).await;
        let second = delete_event(1, 66, 11, start + Duration::from_secs(30));
        fold(&store, &second).await;
        assert!(det.inspect(&second, &store, &policy).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mass_action_weight_counts_as_burst() {
        let store = ActorStore::new(StoreConfig::default());
        let policy = GuildPolicy::default();
        let det = NukeDetector;
        let ev = Event {
            guild_id: 1,
            actor_id: 66,
            kind: EventKind::MassAction { targets: 40 },
            at: Instant::now(),
            ts: Utc::now(),
        };
        fold(&store, &ev).await;
        // jedna akcja zbiorcza na 40 celów = natychmiastowy Critical
        let v = det.inspect(&ev, &store, &policy).await.unwrap().unwrap();
        assert_eq!(v.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn two_different_actors_do_not_pool() {
        let store = ActorStore::new(StoreConfig::default());
        let policy = GuildPolicy::default();
        let det = NukeDetector;
        let start = Instant::now();

        let a = delete_event(1, 66, 10, start);
        fold(&store, &a).await;
        let b = delete_event(1, 77, 11, start + Duration::from_secs(1));
        fold(&store, &b).await;
        assert!(det.inspect(&b, &store, &policy).await.unwrap().is_none());
    }
}
