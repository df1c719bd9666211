// tests/dedup_store.rs
use chrono::Utc;
use newsbrief::feeds::Category;
use newsbrief::sched::Slot;
use newsbrief::store::Store;

#[test]
fn delivery_log_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now();

    {
        let store = Store::open(dir.path()).unwrap();
        store.subscribe(99, "Asia/Dhaka").unwrap();
        store.mark_sent(99, "fp-1", Category::Local, now).unwrap();
        store
            .record_slot_sent(99, Slot::Morning, now.date_naive())
            .unwrap();
    }

    // A fresh process sees the same state: no duplicate deliveries after a
    // crash and restart.
    let store = Store::open(dir.path()).unwrap();
    assert!(store.has_seen(99, "fp-1").unwrap());
    let sub = store.subscriber(99).unwrap().unwrap();
    assert_eq!(sub.last_sent(Slot::Morning), Some(now.date_naive()));
    assert_eq!(store.delivery_count(99).unwrap(), 1);
}

#[test]
fn batch_mark_is_idempotent_per_pair() {
    let store = Store::open_in_memory().unwrap();
    let now = Utc::now();
    let batch: Vec<(String, Category)> = (0..25)
        .map(|i| (format!("fp-{i}"), Category::Global))
        .collect();

    store.mark_sent_batch(3, &batch, now).unwrap();
    // A retried job writes the same batch again; the count must not move.
    store.mark_sent_batch(3, &batch, now).unwrap();
    assert_eq!(store.delivery_count(3).unwrap(), 25);
}

#[test]
fn purge_respects_retention_window() {
    let store = Store::open_in_memory().unwrap();
    let now = Utc::now();
    for (i, age_days) in [1i64, 3, 6, 8, 30].iter().enumerate() {
        store
            .mark_sent(
                1,
                &format!("fp-{i}"),
                Category::Tech,
                now - chrono::Duration::days(*age_days),
            )
            .unwrap();
    }
    let purged = store.purge_older_than(7).unwrap();
    assert_eq!(purged, 2);
    assert_eq!(store.delivery_count(1).unwrap(), 3);
}

#[test]
fn deactivation_removes_from_schedule_but_keeps_history() {
    let store = Store::open_in_memory().unwrap();
    store.subscribe(5, "America/Los_Angeles").unwrap();
    store
        .mark_sent(5, "fp-x", Category::Sports, Utc::now())
        .unwrap();

    store.deactivate(5).unwrap();
    assert!(store.active_subscribers().unwrap().is_empty());
    // Dedup history stays: re-subscribing must not repeat old stories.
    assert!(store.has_seen(5, "fp-x").unwrap());

    store.subscribe(5, "America/Los_Angeles").unwrap();
    let subs = store.active_subscribers().unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].timezone, "America/Los_Angeles");
}
