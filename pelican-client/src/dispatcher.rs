// SPDX-License-Identifier: MIT OR Apache-2.0

//! Outbox dispatcher actor.
//!
//! Drains the durable outbox against the Action API. Flushes are triggered
//! after every enqueue, by explicit `flush` calls and by a periodic interval;
//! overlapping triggers are safe because an in-memory in-flight set guards
//! each item. The actor is the single place that classifies delivery
//! outcomes: confirmed and already-applied items are removed, terminal
//! rejections are removed and surfaced, transient failures stay queued with
//! an exponential per-item backoff.
//!
//! Losing the in-flight set (process death) is harmless: the queue itself is
//! durable and every queued action carries an idempotency key, so a re-send
//! after restart is a replay, not a duplicate effect.
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use pelican_core::{ActionKind, IdempotencyKey, NewOutboxItem, OutboxItem, now_unix};
use pelican_store::{OutboxStore, StoreError};

use crate::api::{ActionApi, ApiError};
use crate::config::DispatcherConfig;

/// Largest exponent applied to the backoff base.
const BACKOFF_MAX_EXPONENT: u32 = 16;

/// User-visible outcome of a queued action.
#[derive(Clone, Debug)]
pub enum DispatchEvent {
    /// The server confirmed the action; `result` is its reply body.
    Delivered {
        id: u64,
        kind: ActionKind,
        result: Value,
    },

    /// The server rejected the action terminally; the item was dropped and
    /// will not be retried.
    Rejected {
        id: u64,
        kind: ActionKind,
        error: String,
    },
}

enum ToDispatcher {
    Flush,
}

struct Delivery {
    item: OutboxItem,
    outcome: Result<Value, ApiError>,
}

/// Handle to a running dispatcher actor.
///
/// Cheap to clone; all clones feed the same actor and the same owner's
/// outbox.
#[derive(Debug)]
pub struct Dispatcher<S> {
    store: S,
    owner_id: String,
    inbox_tx: mpsc::Sender<ToDispatcher>,
    events_tx: broadcast::Sender<DispatchEvent>,
}

impl<S> Clone for Dispatcher<S>
where
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            owner_id: self.owner_id.clone(),
            inbox_tx: self.inbox_tx.clone(),
            events_tx: self.events_tx.clone(),
        }
    }
}

impl<S> Dispatcher<S>
where
    S: OutboxStore + Clone + Send + Sync + 'static,
{
    /// Spawn the dispatcher actor for one owner's outbox.
    ///
    /// The actor runs until `shutdown` is cancelled. A flush of any backlog
    /// left over from a previous process run happens immediately.
    pub fn spawn<A>(
        store: S,
        api: A,
        owner_id: impl Into<String>,
        config: DispatcherConfig,
        shutdown: CancellationToken,
    ) -> Self
    where
        A: ActionApi + Clone + Send + Sync + 'static,
    {
        let owner_id = owner_id.into();
        let (inbox_tx, inbox_rx) = mpsc::channel(64);
        let (events_tx, _) = broadcast::channel(64);

        let actor = DispatcherActor {
            store: store.clone(),
            api,
            owner_id: owner_id.clone(),
            config,
            events_tx: events_tx.clone(),
            in_flight: HashSet::new(),
            backoff_until: HashMap::new(),
        };
        tokio::task::spawn(actor.run(inbox_rx, shutdown));

        Self {
            store,
            owner_id,
            inbox_tx,
            events_tx,
        }
    }

    /// Durably queue a new action and nudge the actor to flush.
    ///
    /// The write to the outbox completes before this method returns, so a
    /// crash immediately afterwards loses nothing. Returns `None` when an
    /// item with the same idempotency key is already queued.
    pub async fn enqueue(
        &self,
        kind: ActionKind,
        payload: Value,
    ) -> Result<Option<OutboxItem>, StoreError> {
        let new = NewOutboxItem {
            kind,
            payload,
            idempotency_key: IdempotencyKey::new(),
            owner_id: self.owner_id.clone(),
            created_at: now_unix(),
        };
        let queued = self.store.enqueue(new).await?;

        // Best effort; a full inbox means a flush is already scheduled.
        let _ = self.inbox_tx.try_send(ToDispatcher::Flush);

        Ok(queued)
    }

    /// Trigger a flush of all pending items.
    pub async fn flush(&self) {
        let _ = self.inbox_tx.send(ToDispatcher::Flush).await;
    }

    /// Subscribe to delivery outcomes.
    pub fn events(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events_tx.subscribe()
    }

    /// Owner whose outbox this dispatcher drains.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }
}

struct DispatcherActor<S, A> {
    store: S,
    api: A,
    owner_id: String,
    config: DispatcherConfig,
    events_tx: broadcast::Sender<DispatchEvent>,
    /// Items currently being sent. The only exclusion mechanism between
    /// overlapping flushes.
    in_flight: HashSet<u64>,
    /// Per-item earliest next attempt, set after transient failures.
    backoff_until: HashMap<u64, Instant>,
}

impl<S, A> DispatcherActor<S, A>
where
    S: OutboxStore + Clone + Send + Sync + 'static,
    A: ActionApi + Clone + Send + Sync + 'static,
{
    async fn run(
        mut self,
        mut inbox_rx: mpsc::Receiver<ToDispatcher>,
        shutdown: CancellationToken,
    ) {
        // Kept alive for the whole loop so `done_rx` never closes.
        let (done_tx, mut done_rx) = mpsc::channel::<Delivery>(64);
        let mut flush_tick = interval(self.config.flush_interval);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("dispatcher for {} shutting down", self.owner_id);
                    break;
                }
                Some(delivery) = done_rx.recv() => {
                    self.on_delivery(delivery).await;
                }
                message = inbox_rx.recv() => {
                    match message {
                        Some(ToDispatcher::Flush) => self.flush(&done_tx).await,
                        None => break,
                    }
                }
                _ = flush_tick.tick() => {
                    self.flush(&done_tx).await;
                }
            }
        }
    }

    /// Send every pending item that is neither in flight nor backing off.
    async fn flush(&mut self, done_tx: &mpsc::Sender<Delivery>) {
        let pending = match self.store.pending(&self.owner_id).await {
            Ok(pending) => pending,
            Err(err) => {
                error!("failed to list pending outbox items: {err}");
                return;
            }
        };

        let now = Instant::now();
        for item in pending {
            if self.in_flight.contains(&item.id) {
                continue;
            }
            if let Some(until) = self.backoff_until.get(&item.id) {
                if *until > now {
                    continue;
                }
            }

            self.in_flight.insert(item.id);
            let api = self.api.clone();
            let done_tx = done_tx.clone();
            tokio::task::spawn(async move {
                let outcome = send_item(&api, &item).await;
                let _ = done_tx.send(Delivery { item, outcome }).await;
            });
        }
    }

    async fn on_delivery(&mut self, delivery: Delivery) {
        let item = delivery.item;
        self.in_flight.remove(&item.id);

        match delivery.outcome {
            Ok(result) => {
                self.backoff_until.remove(&item.id);
                if self.remove(&item).await {
                    debug!("delivered {} item {}", item.kind.as_str(), item.id);
                    let _ = self.events_tx.send(DispatchEvent::Delivered {
                        id: item.id,
                        kind: item.kind,
                        result,
                    });
                }
            }
            // The key was already applied; the effect exists, so the queued
            // item is done.
            Err(ApiError::Conflict(message)) => {
                self.backoff_until.remove(&item.id);
                if self.remove(&item).await {
                    warn!(
                        "{} item {} was already applied: {message}",
                        item.kind.as_str(),
                        item.id
                    );
                }
            }
            Err(err @ (ApiError::Validation(_) | ApiError::NotFound(_))) => {
                self.backoff_until.remove(&item.id);
                if self.remove(&item).await {
                    warn!("{} item {} rejected: {err}", item.kind.as_str(), item.id);
                    let _ = self.events_tx.send(DispatchEvent::Rejected {
                        id: item.id,
                        kind: item.kind,
                        error: err.to_string(),
                    });
                }
            }
            Err(ApiError::Transient(message)) => {
                if let Err(err) = self.store.mark_attempt(item.id, &message).await {
                    error!("failed to record delivery attempt: {err}");
                }
                let delay = backoff_delay(&self.config, item.attempts + 1);
                self.backoff_until.insert(item.id, Instant::now() + delay);
                debug!(
                    "{} item {} stays queued (attempt {}, retry in {delay:?}): {message}",
                    item.kind.as_str(),
                    item.id,
                    item.attempts + 1,
                );
            }
        }
    }

    async fn remove(&self, item: &OutboxItem) -> bool {
        match self.store.remove(item.id, &self.owner_id).await {
            Ok(removed) => removed,
            Err(err) => {
                error!("failed to remove outbox item {}: {err}", item.id);
                false
            }
        }
    }
}

/// Route one queued item to its Action API endpoint.
async fn send_item<A: ActionApi>(api: &A, item: &OutboxItem) -> Result<Value, ApiError> {
    let key = item.idempotency_key;
    match item.kind {
        ActionKind::Ack => {
            let broadcast_id = payload_str(&item.payload, "broadcastId")?;
            api.ack(broadcast_id, &item.payload, key).await
        }
        ActionKind::ClockRecord => api.clock_record(&item.payload, key).await,
        ActionKind::AttendanceCheck => api.attendance_check(&item.payload, key).await,
        ActionKind::SessionOpen => api.open_session(&item.payload, Some(key)).await,
        ActionKind::SessionClose => {
            let session_id = payload_str(&item.payload, "sessId")?;
            api.close_session(session_id).await
        }
    }
}

fn payload_str<'a>(payload: &'a Value, field: &str) -> Result<&'a str, ApiError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::Validation(format!("outbox payload is missing {field}")))
}

fn backoff_delay(config: &DispatcherConfig, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(BACKOFF_MAX_EXPONENT);
    let delay = config.backoff_base.saturating_mul(2u32.saturating_pow(exponent));
    delay.min(config.backoff_cap)
}
