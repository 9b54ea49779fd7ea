//! Mutation idle gate: wait until a subtree stops mutating.
//!
//! The gate arms an idle timer of `idleMs` and resets it on every mutation
//! batch. An optional `maxWindowMs` bounds the whole wait; expiry fails with
//! `idle-window-exceeded` carrying the live snapshot. Backends without
//! mutation observation degrade to the plain timers: the gate still
//! honors the idle window, it just cannot reset on mutation.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::dom::{
    DomBackend, MutationBatch, MutationKind, MutationSubscription, ObserveOptions, ObserveTarget,
};
use crate::error::{WaitError, WaitErrorKind};
use crate::runtime::{Clock, SchedulerEnv, Sleeper};
use crate::telemetry::{TelemetryBus, WaitEvent};
use crate::wait::WaitPredicateSnapshot;

/// Most frequent attribute/node names retained in the statistics maps.
pub const STATISTICS_DETAIL_CAP: usize = 20;

fn default_heartbeat_ms() -> u64 {
    1_000
}

/// Idle gate configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdleOptions {
    /// Quiet period required before the gate opens.
    pub idle_ms: u64,
    /// Hard bound on the whole wait.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_window_ms: Option<u64>,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Collect per-attribute and per-node detail maps.
    #[serde(default)]
    pub capture_statistics: bool,
}

impl IdleOptions {
    pub fn new(idle_ms: u64) -> Self {
        Self {
            idle_ms,
            max_window_ms: None,
            heartbeat_ms: default_heartbeat_ms(),
            capture_statistics: false,
        }
    }

    pub fn with_max_window_ms(mut self, max_window_ms: u64) -> Self {
        self.max_window_ms = Some(max_window_ms);
        self
    }

    pub fn with_heartbeat_ms(mut self, heartbeat_ms: u64) -> Self {
        self.heartbeat_ms = heartbeat_ms;
        self
    }

    pub fn with_statistics(mut self) -> Self {
        self.capture_statistics = true;
        self
    }
}

/// Live mutation counters of one gate invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdleSnapshot {
    pub total_mutations: u64,
    pub attributes: u64,
    pub child_list: u64,
    pub character_data: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_mutation_at_ms: Option<u64>,
}

/// Capped detail maps, collected when `captureStatistics` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdleStatistics {
    pub attribute_names: BTreeMap<String, u64>,
    pub target_names: BTreeMap<String, u64>,
}

/// Successful gate result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdleOutcome {
    pub snapshot: IdleSnapshot,
    pub statistics: IdleStatistics,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Count a name into a capped map. When the map is full, a newcomer
/// displaces the least-frequent entry (ties broken by name order), so the
/// most-mutated names survive.
fn bump_capped(map: &mut BTreeMap<String, u64>, key: &str) {
    if let Some(count) = map.get_mut(key) {
        *count += 1;
        return;
    }
    if map.len() >= STATISTICS_DETAIL_CAP {
        let evict = map
            .iter()
            .min_by_key(|(_, count)| **count)
            .map(|(name, _)| name.clone());
        if let Some(evict) = evict {
            map.remove(&evict);
        }
    }
    map.insert(key.to_string(), 1);
}

fn apply_batch(
    batch: &MutationBatch,
    now_ms: u64,
    snapshot: &mut IdleSnapshot,
    statistics: &mut IdleStatistics,
    capture_statistics: bool,
) {
    for record in batch {
        snapshot.total_mutations += 1;
        match record.kind {
            MutationKind::Attributes => {
                snapshot.attributes += 1;
                if capture_statistics {
                    if let Some(attribute) = &record.attribute_name {
                        bump_capped(&mut statistics.attribute_names, attribute);
                    }
                }
            }
            MutationKind::ChildList => snapshot.child_list += 1,
            MutationKind::CharacterData => snapshot.character_data += 1,
        }
        if capture_statistics {
            bump_capped(&mut statistics.target_names, &record.target_name);
        }
    }
    if !batch.is_empty() {
        snapshot.last_mutation_at_ms = Some(now_ms);
    }
}

async fn cancelled_or_never(signal: Option<&CancellationToken>) {
    match signal {
        Some(signal) => signal.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Drive the idle gate over the given subtree until it settles, the max
/// window expires, or the signal fires.
pub async fn run_idle_gate(
    dom: &std::sync::Arc<dyn DomBackend>,
    env: &SchedulerEnv,
    options: &IdleOptions,
    target: &ObserveTarget,
    observe: Option<&ObserveOptions>,
    signal: Option<&CancellationToken>,
    telemetry: Option<&TelemetryBus>,
) -> Result<IdleOutcome, WaitError> {
    let started_at = env.clock.wall_now();
    let started_ms = env.clock.now_ms();

    if options.idle_ms == 0 {
        return Ok(IdleOutcome {
            snapshot: IdleSnapshot::default(),
            statistics: IdleStatistics::default(),
            started_at,
            finished_at: started_at,
            duration_ms: 0,
        });
    }

    let default_observe = ObserveOptions::all();
    let observe_options = observe.unwrap_or(&default_observe);
    let mut subscription: Option<MutationSubscription> = dom
        .observe(target, observe_options)
        .map_err(|err| {
            WaitError::new(
                WaitErrorKind::Unknown,
                format!("idle gate could not attach observer: {err}"),
            )
        })?;

    let heartbeat_ms = options.heartbeat_ms.max(1);
    let window_deadline = options.max_window_ms.map(|window| started_ms + window);
    let mut snapshot = IdleSnapshot::default();
    let mut statistics = IdleStatistics::default();
    let mut last_mutation_ms = started_ms;
    let mut last_heartbeat_ms = started_ms;

    loop {
        if signal.map(CancellationToken::is_cancelled).unwrap_or(false) {
            release(&mut subscription);
            let mut err = WaitError::cancelled(None);
            err.elapsed_ms = env.clock.now_ms().saturating_sub(started_ms);
            return Err(err);
        }

        let now = env.clock.now_ms();
        let elapsed = now.saturating_sub(started_ms);
        let idle_deadline = last_mutation_ms + options.idle_ms;

        if now >= idle_deadline {
            release(&mut subscription);
            let finished_at = env.clock.wall_now();
            return Ok(IdleOutcome {
                snapshot,
                statistics,
                started_at,
                finished_at,
                duration_ms: elapsed,
            });
        }

        if let Some(deadline) = window_deadline {
            if now >= deadline {
                release(&mut subscription);
                let mut err = WaitError::new(
                    WaitErrorKind::IdleWindowExceeded {
                        snapshot: snapshot.clone(),
                        statistics: statistics.clone(),
                    },
                    format!(
                        "subtree did not settle within maxWindowMs={}ms ({} mutation(s) observed)",
                        options.max_window_ms.unwrap_or_default(),
                        snapshot.total_mutations
                    ),
                );
                err.elapsed_ms = elapsed;
                err.predicate_snapshot = Some(WaitPredicateSnapshot {
                    idle: Some(snapshot),
                    ..WaitPredicateSnapshot::default()
                });
                return Err(err);
            }
        }

        if now.saturating_sub(last_heartbeat_ms) >= heartbeat_ms {
            last_heartbeat_ms = now;
            if let Some(bus) = telemetry {
                bus.emit_wait(WaitEvent::IdleHeartbeat {
                    snapshot: snapshot.clone(),
                    started_at,
                    timestamp: env.clock.wall_now(),
                    elapsed_ms: elapsed,
                    idle_remaining_ms: idle_deadline.saturating_sub(now),
                    window_remaining_ms: window_deadline
                        .map(|deadline| deadline.saturating_sub(now)),
                });
            }
        }

        let mut wake = idle_deadline.min(last_heartbeat_ms + heartbeat_ms);
        if let Some(deadline) = window_deadline {
            wake = wake.min(deadline);
        }
        let sleep_ms = wake.saturating_sub(now).max(1);

        let mut feed_closed = false;
        match subscription.as_mut() {
            Some(live) => {
                tokio::select! {
                    biased;
                    _ = cancelled_or_never(signal) => {}
                    batch = live.next_batch() => {
                        match batch {
                            Some(records) => {
                                let stamp = env.clock.now_ms();
                                apply_batch(
                                    &records,
                                    stamp,
                                    &mut snapshot,
                                    &mut statistics,
                                    options.capture_statistics,
                                );
                                last_mutation_ms = stamp;
                            }
                            // feed dropped: keep honoring the timers
                            None => feed_closed = true,
                        }
                    }
                    _ = env.sleeper.sleep(Duration::from_millis(sleep_ms)) => {}
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = cancelled_or_never(signal) => {}
                    _ = env.sleeper.sleep(Duration::from_millis(sleep_ms)) => {}
                }
            }
        }
        if feed_closed {
            subscription = None;
        }
    }
}

fn release(subscription: &mut Option<MutationSubscription>) {
    if let Some(live) = subscription.take() {
        live.disconnect();
    }
}
