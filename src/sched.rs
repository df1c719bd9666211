//! Slot scheduling and delivery.
//!
//! One cooperative tick loop enumerates due subscribers; delivery jobs run
//! on a bounded worker pool, serialized per chat. Dedup writes happen only
//! after the transport acknowledges every part of the digest, so a retried
//! or abandoned job can never burn stories the user did not receive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::digest::Assembler;
use crate::error::TransportError;
use crate::store::{Store, Subscriber};
use crate::transport::Transport;

/// Budget for composing one digest (feeds + market + externals).
const JOB_DEADLINE: Duration = Duration::from_secs(45);
/// Backoff before the second and third transport attempts.
const SEND_BACKOFF: [Duration; 2] = [Duration::from_secs(30), Duration::from_secs(120)];
/// Hold applied to the pool when the transport rate-limits us and gives no
/// retry-after.
const DEFAULT_RATE_HOLD: Duration = Duration::from_secs(30);

/// The four daily delivery slots, in subscriber-local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    Morning,
    Noon,
    Evening,
    Night,
}

impl Slot {
    pub const ALL: [Slot; 4] = [Slot::Morning, Slot::Noon, Slot::Evening, Slot::Night];

    pub fn hour(self) -> u32 {
        match self {
            Slot::Morning => 8,
            Slot::Noon => 13,
            Slot::Evening => 19,
            Slot::Night => 23,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Slot::Morning => 0,
            Slot::Noon => 1,
            Slot::Evening => 2,
            Slot::Night => 3,
        }
    }

    /// Column of `subscribers` holding the last-sent date for this slot.
    pub fn column(self) -> &'static str {
        match self {
            Slot::Morning => "last_slot_sent_morning",
            Slot::Noon => "last_slot_sent_noon",
            Slot::Evening => "last_slot_sent_evening",
            Slot::Night => "last_slot_sent_night",
        }
    }

    pub fn edition_label(self) -> &'static str {
        match self {
            Slot::Morning => "Morning Edition",
            Slot::Noon => "Midday Edition",
            Slot::Evening => "Evening Edition",
            Slot::Night => "Night Edition",
        }
    }
}

/// Which slot, if any, the given local time falls into. The window is
/// `[slot, slot + window_secs)`, matching the tick so each slot is seen by
/// exactly one tick.
pub fn due_slot<Tz: chrono::TimeZone>(local: &DateTime<Tz>, window_secs: u32) -> Option<Slot> {
    let seconds_of_day = local.hour() * 3600 + local.minute() * 60 + local.second();
    for slot in Slot::ALL {
        let start = slot.hour() * 3600;
        if seconds_of_day >= start && seconds_of_day < start + window_secs {
            return Some(slot);
        }
    }
    None
}

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("deliveries_total", "Digests acknowledged by the transport.");
        describe_counter!("delivery_failures_total", "Delivery jobs abandoned after retries.");
        describe_counter!("delivery_deadline_total", "Delivery jobs cancelled at the deadline.");
    });
}

pub struct Scheduler {
    store: Arc<Store>,
    assembler: Arc<Assembler>,
    transport: Arc<dyn Transport>,
    workers: Arc<Semaphore>,
    chat_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    /// Pool-wide dispatch hold after a transport rate limit.
    hold_until: Mutex<Option<Instant>>,
    tick: Duration,
    retention_days: u32,
    last_purge: Mutex<Option<NaiveDate>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        assembler: Arc<Assembler>,
        transport: Arc<dyn Transport>,
        delivery_parallelism: usize,
        tick: Duration,
        retention_days: u32,
    ) -> Arc<Self> {
        Arc::new(Scheduler {
            store,
            assembler,
            transport,
            workers: Arc::new(Semaphore::new(delivery_parallelism)),
            chat_locks: Mutex::new(HashMap::new()),
            hold_until: Mutex::new(None),
            tick,
            retention_days,
            last_purge: Mutex::new(None),
        })
    }

    /// Main loop: never returns.
    pub async fn run(self: Arc<Self>) {
        ensure_metrics_described();
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(tick = ?self.tick, "scheduler running");
        loop {
            interval.tick().await;
            self.tick_once(Utc::now()).await;
        }
    }

    /// One pass over the subscriber table. Public for tests.
    pub async fn tick_once(self: &Arc<Self>, now_utc: DateTime<Utc>) {
        self.maybe_purge(now_utc);

        let subscribers = match self.store.active_subscribers() {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "cannot enumerate subscribers");
                return;
            }
        };

        let window = self.tick.as_secs().min(u64::from(u32::MAX)) as u32;
        for sub in subscribers {
            let local = now_utc.with_timezone(&sub.tz());
            let Some(slot) = due_slot(&local, window) else {
                continue;
            };
            if sub.last_sent(slot) == Some(local.date_naive()) {
                continue;
            }
            let sched = self.clone();
            tokio::spawn(async move {
                sched.deliver(sub, slot, now_utc).await;
            });
        }
    }

    /// One scheduled delivery job. Errors never escape the job boundary.
    pub async fn deliver(self: Arc<Self>, sub: Subscriber, slot: Slot, now_utc: DateTime<Utc>) {
        let Ok(_permit) = self.workers.acquire().await else {
            return;
        };
        self.respect_hold().await;

        let chat_lock = self.chat_lock(sub.chat_id);
        let _chat = chat_lock.lock().await;

        let local_date = now_utc.with_timezone(&sub.tz()).date_naive();

        // Re-check under the chat lock: a concurrent job for the same chat
        // may have completed this slot while we waited.
        match self.store.subscriber(sub.chat_id) {
            Ok(Some(current)) if current.active => {
                if current.last_sent(slot) == Some(local_date) {
                    return;
                }
            }
            Ok(_) => return,
            Err(e) => {
                error!(chat_id = sub.chat_id, error = %e, "subscriber re-check failed");
                return;
            }
        }

        match self.deliver_once(&sub, slot, now_utc, local_date).await {
            Ok(()) => {
                counter!("deliveries_total").increment(1);
                info!(chat_id = sub.chat_id, slot = ?slot, "digest delivered");
            }
            Err(e) => {
                counter!("delivery_failures_total").increment(1);
                warn!(chat_id = sub.chat_id, slot = ?slot, error = %e, "delivery abandoned for this slot");
            }
        }
    }

    async fn deliver_once(
        &self,
        sub: &Subscriber,
        slot: Slot,
        now_utc: DateTime<Utc>,
        local_date: NaiveDate,
    ) -> Result<()> {
        let composed = match tokio::time::timeout(
            JOB_DEADLINE,
            self.assembler
                .compose(sub.chat_id, sub.tz(), now_utc, Some(slot)),
        )
        .await
        {
            Ok(res) => res.context("composing digest")?,
            Err(_) => {
                counter!("delivery_deadline_total").increment(1);
                anyhow::bail!("composition deadline ({JOB_DEADLINE:?}) exceeded");
            }
        };

        self.send_with_retry(sub.chat_id, &composed.parts).await?;

        // Transport acked everything: now, and only now, the dedup log and
        // the slot bookkeeping advance.
        self.store
            .mark_sent_batch(sub.chat_id, &composed.sent_items, now_utc)
            .context("recording delivered fingerprints")?;
        self.store
            .record_slot_sent(sub.chat_id, slot, local_date)
            .context("recording slot send")?;
        Ok(())
    }

    /// Send all parts, retrying the not-yet-acked tail on transient errors
    /// with the fixed backoff schedule. Permanent errors deactivate the chat.
    async fn send_with_retry(&self, chat_id: i64, parts: &[String]) -> Result<()> {
        let mut next_part = 0usize;
        let mut retries = 0usize;

        while next_part < parts.len() {
            match self.transport.send_message(chat_id, &parts[next_part]).await {
                Ok(_) => next_part += 1,
                Err(e) if e.is_permanent() => {
                    warn!(chat_id, error = %e, "chat unreachable, deactivating");
                    if let Err(db) = self.store.deactivate(chat_id) {
                        error!(chat_id, error = %db, "deactivation failed");
                    }
                    anyhow::bail!("permanent transport failure: {e}");
                }
                Err(e) if e.is_retryable() && retries < SEND_BACKOFF.len() => {
                    if let TransportError::RateLimited { retry_after } = &e {
                        self.set_hold(retry_after.unwrap_or(DEFAULT_RATE_HOLD));
                    }
                    let backoff = SEND_BACKOFF[retries];
                    retries += 1;
                    warn!(chat_id, error = %e, ?backoff, "transport failed, backing off");
                    tokio::time::sleep(backoff).await;
                    self.respect_hold().await;
                }
                Err(e) => anyhow::bail!("transport failed after {retries} retries: {e}"),
            }
        }
        Ok(())
    }

    fn chat_lock(&self, chat_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.chat_locks.lock().expect("chat lock map poisoned");
        locks
            .entry(chat_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn set_hold(&self, duration: Duration) {
        let mut hold = self.hold_until.lock().expect("hold mutex poisoned");
        *hold = Some(Instant::now() + duration);
    }

    async fn respect_hold(&self) {
        let deadline = {
            let hold = self.hold_until.lock().expect("hold mutex poisoned");
            *hold
        };
        if let Some(until) = deadline {
            let now = Instant::now();
            if until > now {
                tokio::time::sleep(until - now).await;
            }
        }
    }

    /// Daily maintenance: purge delivery records past the retention window.
    fn maybe_purge(&self, now_utc: DateTime<Utc>) {
        let today = now_utc.date_naive();
        let mut last = self.last_purge.lock().expect("purge mutex poisoned");
        if *last == Some(today) {
            return;
        }
        *last = Some(today);
        match self.store.purge_older_than(self.retention_days) {
            Ok(_) => {}
            Err(e) => error!(error = %e, "delivery log purge failed"),
        }
    }
}
