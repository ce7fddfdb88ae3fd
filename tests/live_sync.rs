use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use ulid::Ulid;

use labslot::calendar::LiveCalendar;
use labslot::engine::{BookingError, Engine};
use labslot::model::*;
use labslot::storage::local::LocalBackend;
use labslot::storage::{self, Backend};
use labslot::sync::{ConnectionStatus, Snapshot};

// ── Test infrastructure ──────────────────────────────────────

const RETRY: Duration = Duration::from_millis(50);

fn start_backend() -> Arc<LocalBackend> {
    let dir = std::env::temp_dir().join(format!("labslot_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    LocalBackend::open(&dir.join("labslot.wal")).unwrap()
}

async fn connect(backend: &Arc<LocalBackend>) -> Engine {
    Engine::connect(backend.clone(), RETRY).await
}

/// Wait until `engine` publishes a snapshot satisfying `done`.
async fn wait_for(engine: &Engine, done: impl Fn(&Snapshot) -> bool) -> Arc<Snapshot> {
    let mut sub = engine.subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snap = sub.next().await.expect("hub alive");
            if done(&snap) {
                return snap;
            }
        }
    })
    .await
    .expect("expected snapshot")
}

fn date(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

fn ids(snap: &Snapshot) -> Vec<ReservationId> {
    snap.reservations.iter().map(|r| r.id).collect()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn clients_converge_on_same_state() {
    let backend = start_backend();
    let a = connect(&backend).await;
    a.instruments().seed_defaults().await.unwrap();
    let b = connect(&backend).await;
    let c = connect(&backend).await;

    let r1 = a
        .reservations()
        .create(ReservationDraft::new(1, date("2024-06-03"), TimeSlot::Morning, "Alice"))
        .await
        .unwrap();
    wait_for(&b, |s| s.reservations.iter().any(|r| r.id == r1)).await;

    let r2 = b
        .reservations()
        .create(ReservationDraft::new(2, date("2024-06-03"), TimeSlot::Morning, "Bob"))
        .await
        .unwrap();
    wait_for(&c, |s| s.reservations.len() == 2).await;

    c.reservations().delete(r1).await.unwrap();

    for engine in [&a, &b, &c] {
        let snap = wait_for(engine, |s| s.reservations.len() == 1).await;
        assert_eq!(ids(&snap), vec![r2]);
        assert_eq!(snap.instruments.len(), 4);
        assert_eq!(snap.status, ConnectionStatus::Connected);
    }
}

#[tokio::test]
async fn remote_booking_blocks_local_conflict() {
    let backend = start_backend();
    let a = connect(&backend).await;
    a.instruments().seed_defaults().await.unwrap();
    let b = connect(&backend).await;

    a.reservations()
        .create(ReservationDraft::new(3, date("2024-06-05"), TimeSlot::Evening, "Alice"))
        .await
        .unwrap();
    wait_for(&b, |s| !s.reservations.is_empty()).await;

    let err = b
        .reservations()
        .create(ReservationDraft::new(3, date("2024-06-05"), TimeSlot::Evening, "Bob"))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "slot already booked");
}

#[tokio::test]
async fn remote_instrument_removal_reaches_other_client() {
    let backend = start_backend();
    let a = connect(&backend).await;
    a.instruments().seed_defaults().await.unwrap();
    let b = connect(&backend).await;
    wait_for(&b, |s| s.instruments.len() == 4).await;

    a.instruments().remove(4).await.unwrap();
    wait_for(&b, |s| s.instruments.len() == 3).await;

    let draft = ReservationDraft::new(4, date("2024-06-05"), TimeSlot::Morning, "Bob");
    assert!(matches!(
        b.reservations().create(draft).await,
        Err(BookingError::Validation(_))
    ));
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let backend = start_backend();
    let engine = connect(&backend).await;
    engine.instruments().seed_defaults().await.unwrap();

    let base = engine.hub().listener_count();
    let mut kept = engine.subscribe();
    let dropped = engine.subscribe();
    assert_eq!(engine.hub().listener_count(), base + 2);

    dropped.unsubscribe();
    assert_eq!(engine.hub().listener_count(), base + 1);

    let first = kept.next().await.unwrap();
    engine
        .reservations()
        .create(ReservationDraft::new(1, date("2024-06-03"), TimeSlot::Morning, "Alice"))
        .await
        .unwrap();
    let next = tokio::time::timeout(Duration::from_secs(5), kept.next())
        .await
        .unwrap()
        .unwrap();
    assert!(next.version > first.version);
    assert_eq!(next.reservations.len(), 1);

    kept.unsubscribe();
    assert_eq!(engine.hub().listener_count(), base);
}

#[tokio::test]
async fn live_calendar_follows_remote_bookings() {
    let backend = start_backend();
    let a = connect(&backend).await;
    a.instruments().seed_defaults().await.unwrap();
    let b = connect(&backend).await;

    let mut live = LiveCalendar::new(b.subscribe(), date("2024-06-03"), 2);
    a.reservations()
        .create(ReservationDraft::new(2, date("2024-06-12"), TimeSlot::Afternoon, "Alice"))
        .await
        .unwrap();

    let view = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let view = live.next().await.expect("subscription open");
            if view.grid.booked_count() == 1 {
                return view;
            }
        }
    })
    .await
    .unwrap();

    let cell = view.grid.cell(date("2024-06-12"), TimeSlot::Afternoon).unwrap();
    assert_eq!(cell.entries[0].user, "Alice");
    assert_eq!(cell.entries[0].instrument_name, "X-ray Diffractometer");
}

#[tokio::test]
async fn degraded_client_recovers_on_next_delivery() {
    let backend = start_backend();
    let a = connect(&backend).await;
    a.instruments().seed_defaults().await.unwrap();
    let b = connect(&backend).await;

    backend.suspend();
    let err = b
        .reservations()
        .create(ReservationDraft::new(1, date("2024-06-03"), TimeSlot::Morning, "Bob"))
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::StorageUnavailable(_)));
    assert_eq!(b.status().await, ConnectionStatus::Degraded);
    // Stale reads keep working.
    assert_eq!(b.instruments().list().await.len(), 4);

    backend.resume();
    a.reservations()
        .create(ReservationDraft::new(1, date("2024-06-03"), TimeSlot::Morning, "Alice"))
        .await
        .unwrap();
    let snap = wait_for(&b, |s| s.status == ConnectionStatus::Connected).await;
    assert_eq!(snap.reservations.len(), 1);
}

/// Both clients check the slot against caches that do not yet hold the
/// other's booking, so both accept. The backend keeps whatever both writes
/// leave behind: two reservations on one slot, or one booking overwritten
/// when both clients picked the same id.
#[tokio::test]
async fn concurrent_bookings_from_two_clients_race() {
    let backend = start_backend();
    let a = connect(&backend).await;
    a.instruments().seed_defaults().await.unwrap();
    let b = connect(&backend).await;
    wait_for(&b, |s| s.instruments.len() == 4).await;

    let alice = ReservationDraft::new(1, date("2024-06-03"), TimeSlot::Morning, "Alice");
    let bob = ReservationDraft::new(1, date("2024-06-03"), TimeSlot::Morning, "Bob");
    let a_store = a.reservations();
    let b_store = b.reservations();
    let (ra, rb) = tokio::join!(a_store.create(alice), b_store.create(bob));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    let stored = backend
        .read(&storage::collection(storage::RESERVATIONS))
        .await
        .unwrap()
        .and_then(|v| v.as_object().map(|m| m.len()))
        .unwrap_or(0);

    if ra == rb {
        assert_eq!(stored, 1);
        for engine in [&a, &b] {
            wait_for(engine, |s| s.reservations.len() == 1).await;
            assert!(engine.reservations().collisions().await.is_empty());
        }
    } else {
        assert_eq!(stored, 2);
        for engine in [&a, &b] {
            wait_for(engine, |s| s.reservations.len() == 2).await;
            let collisions = engine.reservations().collisions().await;
            assert_eq!(collisions.len(), 1);
            let (key, mut group) = collisions[0].clone();
            group.sort();
            let mut expected = vec![ra, rb];
            expected.sort();
            assert_eq!(group, expected);
            assert_eq!(key.date, date("2024-06-03"));
        }
    }
}

#[tokio::test]
async fn collisions_reports_doubly_booked_slots() {
    let backend = start_backend();
    let engine = connect(&backend).await;
    engine.instruments().seed_defaults().await.unwrap();

    // Two records on one slot, as left behind by a cross-client race.
    for (id, user) in [(100_u64, "Alice"), (200, "Bob")] {
        let record = Reservation {
            id,
            instrument_id: 2,
            user: user.into(),
            date: date("2024-06-04"),
            time_slot: TimeSlot::Evening,
            purpose: None,
            contact: None,
            created_at: 0,
            updated_at: 0,
        };
        backend
            .write(
                &storage::record_path(storage::RESERVATIONS, id),
                serde_json::to_value(&record).unwrap(),
            )
            .await
            .unwrap();
    }
    wait_for(&engine, |s| s.reservations.len() == 2).await;

    let collisions = engine.reservations().collisions().await;
    assert_eq!(
        collisions,
        vec![(
            SlotKey {
                instrument_id: 2,
                date: date("2024-06-04"),
                time_slot: TimeSlot::Evening,
            },
            vec![100, 200],
        )]
    );

    // Cancelling one resolves it.
    engine.reservations().delete(200).await.unwrap();
    assert!(engine.reservations().collisions().await.is_empty());
}
