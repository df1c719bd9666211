//! Durable state: delivery log, subscribers, interaction log.
//!
//! Embedded SQLite behind a single connection mutex. All operations are
//! short local transactions; callers on the async side treat them as
//! non-suspending. `mark_sent` is idempotent on `(chat_id, fingerprint)`,
//! which is what makes transport retries safe.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};
use tracing::info;

use crate::feeds::Category;
use crate::sched::Slot;

/// A chat registered for scheduled digests.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub chat_id: i64,
    /// IANA timezone name, e.g. "Asia/Dhaka".
    pub timezone: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    /// Local date of the last successful send, per slot.
    pub last_slot_sent: [Option<NaiveDate>; 4],
}

impl Subscriber {
    pub fn last_sent(&self, slot: Slot) -> Option<NaiveDate> {
        self.last_slot_sent[slot.index()]
    }

    /// Parsed timezone; falls back to Asia/Dhaka if the stored name has
    /// become invalid (should not happen, names are validated on write).
    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone
            .parse()
            .unwrap_or(chrono_tz::Asia::Dhaka)
    }
}

/// One row of the append-only interaction log.
#[derive(Debug, Clone)]
pub struct UserLogRecord {
    pub user_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub interaction_time: DateTime<Utc>,
    pub message_type: String,
    pub location: Option<String>,
}

pub struct Store {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS subscribers (
    chat_id INTEGER PRIMARY KEY,
    timezone TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    last_slot_sent_morning TEXT,
    last_slot_sent_noon TEXT,
    last_slot_sent_evening TEXT,
    last_slot_sent_night TEXT
);
CREATE TABLE IF NOT EXISTS delivery_log (
    chat_id INTEGER NOT NULL,
    fingerprint TEXT NOT NULL,
    category TEXT NOT NULL,
    sent_at TEXT NOT NULL,
    PRIMARY KEY (chat_id, fingerprint)
);
CREATE INDEX IF NOT EXISTS idx_delivery_sent_at ON delivery_log(sent_at);
CREATE TABLE IF NOT EXISTS user_logs (
    user_id INTEGER NOT NULL,
    username TEXT,
    first_name TEXT,
    interaction_time TEXT NOT NULL,
    message_type TEXT NOT NULL,
    location TEXT
);
";

impl Store {
    /// Open (or create) the database under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;
        let path = data_dir.join("newsbrief.db");
        let conn = Connection::open(&path)
            .with_context(|| format!("opening database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "database ready");
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    // ---- delivery log ----

    pub fn has_seen(&self, chat_id: i64, fingerprint: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        let mut stmt = conn
            .prepare_cached("SELECT 1 FROM delivery_log WHERE chat_id = ?1 AND fingerprint = ?2")?;
        Ok(stmt.exists(params![chat_id, fingerprint])?)
    }

    /// Which of the given fingerprints this chat has already received.
    pub fn seen_set(&self, chat_id: i64, fingerprints: &[String]) -> Result<HashSet<String>> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        let mut stmt = conn
            .prepare_cached("SELECT 1 FROM delivery_log WHERE chat_id = ?1 AND fingerprint = ?2")?;
        let mut seen = HashSet::new();
        for fp in fingerprints {
            if stmt.exists(params![chat_id, fp])? {
                seen.insert(fp.clone());
            }
        }
        Ok(seen)
    }

    pub fn mark_sent(
        &self,
        chat_id: i64,
        fingerprint: &str,
        category: Category,
        when: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        conn.execute(
            "INSERT OR IGNORE INTO delivery_log (chat_id, fingerprint, category, sent_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![chat_id, fingerprint, category.code(), when.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Record a whole digest's fingerprints in one transaction.
    pub fn mark_sent_batch(
        &self,
        chat_id: i64,
        sent: &[(String, Category)],
        when: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().expect("db mutex poisoned");
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO delivery_log (chat_id, fingerprint, category, sent_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (fp, category) in sent {
                stmt.execute(params![chat_id, fp, category.code(), when.to_rfc3339()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Drop delivery records older than `days`. Returns rows removed.
    pub fn purge_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = (Utc::now() - chrono::Duration::days(i64::from(days))).to_rfc3339();
        let conn = self.conn.lock().expect("db mutex poisoned");
        let n = conn.execute("DELETE FROM delivery_log WHERE sent_at < ?1", params![cutoff])?;
        if n > 0 {
            info!(purged = n, days, "delivery log purged");
        }
        Ok(n)
    }

    pub fn delivery_count(&self, chat_id: i64) -> Result<u64> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        let n: u64 = conn.query_row(
            "SELECT COUNT(*) FROM delivery_log WHERE chat_id = ?1",
            params![chat_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    // ---- subscribers ----

    /// Register (or re-activate) a chat. Keeps an existing timezone.
    pub fn subscribe(&self, chat_id: i64, timezone: &str) -> Result<()> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        conn.execute(
            "INSERT INTO subscribers (chat_id, timezone, active, created_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(chat_id) DO UPDATE SET active = 1",
            params![chat_id, timezone, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn unsubscribe(&self, chat_id: i64) -> Result<bool> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        let n = conn.execute(
            "UPDATE subscribers SET active = 0 WHERE chat_id = ?1",
            params![chat_id],
        )?;
        Ok(n > 0)
    }

    /// Used when the transport reports the chat is permanently unreachable.
    pub fn deactivate(&self, chat_id: i64) -> Result<()> {
        self.unsubscribe(chat_id).map(|_| ())
    }

    pub fn set_timezone(&self, chat_id: i64, timezone: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        let n = conn.execute(
            "UPDATE subscribers SET timezone = ?1 WHERE chat_id = ?2",
            params![timezone, chat_id],
        )?;
        Ok(n > 0)
    }

    pub fn subscriber(&self, chat_id: i64) -> Result<Option<Subscriber>> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        let mut stmt = conn.prepare_cached(
            "SELECT chat_id, timezone, active, created_at,
                    last_slot_sent_morning, last_slot_sent_noon,
                    last_slot_sent_evening, last_slot_sent_night
             FROM subscribers WHERE chat_id = ?1",
        )?;
        let mut rows = stmt.query(params![chat_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_subscriber(row)?)),
            None => Ok(None),
        }
    }

    pub fn active_subscribers(&self) -> Result<Vec<Subscriber>> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        let mut stmt = conn.prepare_cached(
            "SELECT chat_id, timezone, active, created_at,
                    last_slot_sent_morning, last_slot_sent_noon,
                    last_slot_sent_evening, last_slot_sent_night
             FROM subscribers WHERE active = 1",
        )?;
        let mut out = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            out.push(row_to_subscriber(row)?);
        }
        Ok(out)
    }

    /// Advance `last_slot_sent` for the slot. At most one send per
    /// (chat, slot, date) follows from the scheduler checking the stored
    /// date before enqueueing.
    pub fn record_slot_sent(&self, chat_id: i64, slot: Slot, date: NaiveDate) -> Result<()> {
        let column = slot.column();
        let sql = format!("UPDATE subscribers SET {column} = ?1 WHERE chat_id = ?2");
        let conn = self.conn.lock().expect("db mutex poisoned");
        conn.execute(&sql, params![date.format("%Y-%m-%d").to_string(), chat_id])?;
        Ok(())
    }

    // ---- interaction log ----

    pub fn log_interaction(&self, rec: &UserLogRecord) -> Result<()> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        conn.execute(
            "INSERT INTO user_logs (user_id, username, first_name, interaction_time, message_type, location)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                rec.user_id,
                rec.username,
                rec.first_name,
                rec.interaction_time.to_rfc3339(),
                rec.message_type,
                rec.location,
            ],
        )?;
        Ok(())
    }
}

fn row_to_subscriber(row: &rusqlite::Row<'_>) -> Result<Subscriber> {
    let created_raw: String = row.get(3)?;
    let created_at = DateTime::parse_from_rfc3339(&created_raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    let mut last_slot_sent = [None; 4];
    for (i, slot) in last_slot_sent.iter_mut().enumerate() {
        let raw: Option<String> = row.get(4 + i)?;
        *slot = raw.and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok());
    }

    Ok(Subscriber {
        chat_id: row.get(0)?,
        timezone: row.get(1)?,
        active: row.get::<_, i64>(2)? != 0,
        created_at,
        last_slot_sent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_sent_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store.mark_sent(7, "abc123", Category::Global, now).unwrap();
        store.mark_sent(7, "abc123", Category::Global, now).unwrap();
        assert_eq!(store.delivery_count(7).unwrap(), 1);
        assert!(store.has_seen(7, "abc123").unwrap());
        assert!(!store.has_seen(8, "abc123").unwrap());
    }

    #[test]
    fn purge_drops_only_old_rows() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .mark_sent(1, "old", Category::Tech, now - chrono::Duration::days(8))
            .unwrap();
        store.mark_sent(1, "new", Category::Tech, now).unwrap();
        let purged = store.purge_older_than(7).unwrap();
        assert_eq!(purged, 1);
        assert!(!store.has_seen(1, "old").unwrap());
        assert!(store.has_seen(1, "new").unwrap());
    }

    #[test]
    fn subscriber_round_trip_and_slot_dates() {
        let store = Store::open_in_memory().unwrap();
        store.subscribe(42, "Asia/Dhaka").unwrap();
        let sub = store.subscriber(42).unwrap().unwrap();
        assert!(sub.active);
        assert_eq!(sub.timezone, "Asia/Dhaka");
        assert!(sub.last_sent(Slot::Morning).is_none());

        let date = NaiveDate::from_ymd_opt(2025, 9, 1).unwrap();
        store.record_slot_sent(42, Slot::Morning, date).unwrap();
        let sub = store.subscriber(42).unwrap().unwrap();
        assert_eq!(sub.last_sent(Slot::Morning), Some(date));
        assert!(sub.last_sent(Slot::Noon).is_none());

        assert!(store.unsubscribe(42).unwrap());
        assert!(store.active_subscribers().unwrap().is_empty());

        // Re-subscribing keeps the stored timezone.
        store.subscribe(42, "Europe/Prague").unwrap();
        let sub = store.subscriber(42).unwrap().unwrap();
        assert_eq!(sub.timezone, "Asia/Dhaka");
    }

    #[test]
    fn seen_set_filters() {
        let store = Store::open_in_memory().unwrap();
        store.mark_sent(5, "aa", Category::Local, Utc::now()).unwrap();
        let seen = store
            .seen_set(5, &["aa".to_string(), "bb".to_string()])
            .unwrap();
        assert!(seen.contains("aa"));
        assert!(!seen.contains("bb"));
    }
}
