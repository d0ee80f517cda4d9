//! State-change delivery: notify hub subscriptions and the JSON-lines relay.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Days, NaiveDate, NaiveTime, Utc};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use ulid::Ulid;

use slotkeeper::clock::SystemClock;
use slotkeeper::config::Config;
use slotkeeper::model::*;
use slotkeeper::policy::AlwaysActive;
use slotkeeper::relay::run_relay;
use slotkeeper::service::BookingService;

fn test_data_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join("slotkeeper_test_state_changes")
        .join(name);
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn config(dir: PathBuf) -> Config {
    Config {
        data_dir: dir,
        ..Config::default()
    }
}

/// A few weeks out, so the booking horizon never gets in the way.
fn base_date() -> NaiveDate {
    Utc::now().date_naive() + Days::new(21)
}

fn slot(h: u32) -> Slot {
    Slot::new(
        base_date(),
        NaiveTime::from_hms_opt(h, 0, 0).unwrap(),
        NaiveTime::from_hms_opt(h + 1, 0, 0).unwrap(),
    )
}

#[derive(Clone, Default)]
struct Sink(Arc<Mutex<Vec<u8>>>);

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Sink {
    fn changes(&self) -> Vec<StateChange> {
        let buf = self.0.lock().unwrap();
        String::from_utf8_lossy(&buf)
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    async fn wait_for(&self, n: usize) -> Vec<StateChange> {
        for _ in 0..300 {
            let changes = self.changes();
            if changes.len() >= n {
                return changes;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.changes()
    }
}

#[tokio::test]
async fn lifecycle_changes_arrive_in_order() {
    let svc = BookingService::open(&config(test_data_dir("order")), Arc::new(SystemClock)).unwrap();
    let p1 = Ulid::new();
    let u1 = Ulid::new();
    let mut rx = svc.engine.notify.subscribe(p1);

    let r = svc.admit(p1, slot(10), u1, &AlwaysActive).await.unwrap();
    svc.confirm(r.id, p1).await.unwrap();
    svc.complete(r.id, p1).await.unwrap();

    let seen: Vec<_> = (0..3)
        .map(|_| rx.try_recv().unwrap())
        .map(|c| (c.reservation_id, c.state, c.version))
        .collect();
    assert_eq!(
        seen,
        vec![
            (r.id, ReservationState::Requested, 1),
            (r.id, ReservationState::Confirmed, 2),
            (r.id, ReservationState::Completed, 3),
        ]
    );
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn subscribers_are_scoped_to_their_resource() {
    let svc = BookingService::open(&config(test_data_dir("scoped")), Arc::new(SystemClock)).unwrap();
    let (p1, p2) = (Ulid::new(), Ulid::new());
    let mut on_p1 = svc.engine.notify.subscribe(p1);

    svc.admit(p2, slot(10), Ulid::new(), &AlwaysActive).await.unwrap();
    assert!(matches!(on_p1.try_recv(), Err(TryRecvError::Empty)));

    let r = svc.admit(p1, slot(10), Ulid::new(), &AlwaysActive).await.unwrap();
    assert_eq!(on_p1.try_recv().unwrap().reservation_id, r.id);
}

#[tokio::test]
async fn dropped_subscriber_channel_is_pruned() {
    let svc = BookingService::open(&config(test_data_dir("prune")), Arc::new(SystemClock)).unwrap();
    let p1 = Ulid::new();
    drop(svc.engine.notify.subscribe(p1));
    svc.engine.notify.prune(&p1);

    // Publishing with nobody listening must not fail the admission.
    svc.admit(p1, slot(10), Ulid::new(), &AlwaysActive).await.unwrap();
}

#[tokio::test]
async fn slow_subscriber_sees_lag() {
    let svc = BookingService::open(&config(test_data_dir("lag")), Arc::new(SystemClock)).unwrap();
    let p1 = Ulid::new();
    let mut rx = svc.engine.notify.subscribe(p1);

    // More changes than the per-resource channel holds.
    for i in 0..300u32 {
        let s = Slot::new(
            base_date() + Days::new(u64::from(i / 20)),
            NaiveTime::from_hms_opt(i % 20, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(i % 20 + 1, 0, 0).unwrap(),
        );
        svc.admit(p1, s, Ulid::new(), &AlwaysActive).await.unwrap();
    }
    assert!(matches!(rx.recv().await, Err(RecvError::Lagged(_))));
}

#[tokio::test]
async fn relay_republishes_state_after_restart() {
    let dir = test_data_dir("relay_restart");
    let p1 = Ulid::new();
    let u1 = Ulid::new();

    let (kept, cancelled) = {
        let svc = BookingService::open(&config(dir.clone()), Arc::new(SystemClock)).unwrap();
        let kept = svc.admit(p1, slot(9), u1, &AlwaysActive).await.unwrap();
        let cancelled = svc.admit(p1, slot(11), u1, &AlwaysActive).await.unwrap();
        svc.cancel(cancelled.id, u1, "").await.unwrap();
        (kept, cancelled)
    };

    let svc = BookingService::open(&config(dir), Arc::new(SystemClock)).unwrap();
    let sink = Sink::default();
    let relay = tokio::spawn(run_relay(svc.engine.clone(), sink.clone()));

    let mut changes = sink.wait_for(2).await;
    changes.sort_by_key(|c| c.reservation_id);
    let mut expected = vec![
        (kept.id, ReservationState::Requested, 1),
        (cancelled.id, ReservationState::Cancelled, 2),
    ];
    expected.sort_by_key(|e| e.0);
    assert_eq!(
        changes
            .iter()
            .map(|c| (c.reservation_id, c.state, c.version))
            .collect::<Vec<_>>(),
        expected
    );

    svc.confirm(kept.id, p1).await.unwrap();
    let changes = sink.wait_for(3).await;
    assert_eq!(changes.len(), 3);
    assert_eq!(changes[2].reservation_id, kept.id);
    assert_eq!(changes[2].state, ReservationState::Confirmed);

    relay.abort();
}
