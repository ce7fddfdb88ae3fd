use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use ulid::Ulid;

use labslot::calendar;
use labslot::engine::{BookingError, Engine};
use labslot::model::*;
use labslot::storage::local::LocalBackend;

const RETRY: Duration = Duration::from_millis(100);

fn open_backend() -> Arc<LocalBackend> {
    let dir = std::env::temp_dir().join(format!("labslot_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).expect("create bench dir");
    LocalBackend::open(&dir.join("labslot.wal")).expect("open backend")
}

async fn seeded_engine(backend: &Arc<LocalBackend>) -> Engine {
    let engine = Engine::connect(backend.clone(), RETRY).await;
    engine.instruments().seed_defaults().await.expect("seed instruments");
    engine
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// The `n`-th distinct slot key, cycling instruments 1-4 and all time slots.
fn slot(n: usize) -> (InstrumentId, NaiveDate, TimeSlot) {
    let base = NaiveDate::from_ymd_opt(2024, 1, 1).expect("valid date");
    let instrument = (n % 4) as InstrumentId + 1;
    let time_slot = TimeSlot::ALL[(n / 4) % 3];
    let date = base + Days::new((n / 12) as u64);
    (instrument, date, time_slot)
}

/// Panics if two stored reservations share a slot.
async fn assert_unique(engine: &Engine) -> usize {
    let all = engine.reservations().all().await;
    let keys: HashSet<SlotKey> = all.iter().map(Reservation::key).collect();
    assert_eq!(keys.len(), all.len(), "uniqueness invariant violated");
    all.len()
}

async fn phase1_sequential() {
    let backend = open_backend();
    let engine = seeded_engine(&backend).await;

    let n = 1000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let (instrument, date, time_slot) = slot(i);
        let t = Instant::now();
        engine
            .reservations()
            .create(ReservationDraft::new(instrument, date, time_slot, format!("user-{i}")))
            .await
            .expect("free slot accepted");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("create latency", &mut latencies);
    println!("  stored: {}", assert_unique(&engine).await);
}

/// Many tasks on one client race for the same slots. The write gate must
/// let exactly one booking per slot through.
async fn phase2_contended_single_client() {
    let backend = open_backend();
    let engine = Arc::new(seeded_engine(&backend).await);

    let n_tasks = 16;
    let n_slots = 120;
    let start = Instant::now();
    let mut handles = Vec::new();

    for t in 0..n_tasks {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let (mut accepted, mut conflicts) = (0usize, 0usize);
            let mut latencies = Vec::with_capacity(n_slots);
            for i in 0..n_slots {
                let (instrument, date, time_slot) = slot(i);
                let draft = ReservationDraft::new(instrument, date, time_slot, format!("task-{t}"));
                let started = Instant::now();
                match engine.reservations().create(draft).await {
                    Ok(_) => accepted += 1,
                    Err(BookingError::Conflict { .. }) => conflicts += 1,
                    Err(e) => panic!("unexpected error: {e}"),
                }
                latencies.push(started.elapsed());
            }
            (accepted, conflicts, latencies)
        }));
    }

    let (mut accepted, mut conflicts, mut latencies) = (0, 0, Vec::new());
    for h in handles {
        let (a, c, l) = h.await.expect("task panicked");
        accepted += a;
        conflicts += c;
        latencies.extend(l);
    }

    let elapsed = start.elapsed();
    println!(
        "  {n_tasks} tasks x {n_slots} slots: {accepted} accepted, {conflicts} conflicts in {:.2}s",
        elapsed.as_secs_f64()
    );
    print_latency("create latency under contention", &mut latencies);
    assert_eq!(accepted, n_slots);
    assert_eq!(assert_unique(&engine).await, n_slots);
}

/// Several clients over one backend book the same slots. Conflicts are only
/// checked against each client's cache, so some double bookings can land.
async fn phase3_contended_clients() {
    let backend = open_backend();
    let first = seeded_engine(&backend).await;
    let n_clients = 4;
    let n_slots = 200;

    let mut clients = vec![Arc::new(first)];
    for _ in 1..n_clients {
        clients.push(Arc::new(Engine::connect(backend.clone(), RETRY).await));
    }

    let start = Instant::now();
    let mut handles = Vec::new();
    for (c, engine) in clients.iter().enumerate() {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let mut accepted = 0usize;
            for i in 0..n_slots {
                let (instrument, date, time_slot) = slot(i);
                let draft = ReservationDraft::new(instrument, date, time_slot, format!("client-{c}"));
                if engine.reservations().create(draft).await.is_ok() {
                    accepted += 1;
                }
            }
            accepted
        }));
    }
    let mut accepted = 0;
    for h in handles {
        accepted += h.await.expect("client task panicked");
    }

    // Let the last deliveries settle before reading the outcome.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let observer = &clients[0];
    let stored = observer.reservations().all().await.len();
    let collisions = observer.reservations().collisions().await;
    println!(
        "  {n_clients} clients x {n_slots} slots in {:.2}s: {accepted} accepted, {stored} stored, {} doubly booked slots",
        start.elapsed().as_secs_f64(),
        collisions.len()
    );
}

async fn phase4_projection() {
    let backend = open_backend();
    let engine = seeded_engine(&backend).await;
    for i in 0..2000 {
        let (instrument, date, time_slot) = slot(i);
        engine
            .reservations()
            .create(ReservationDraft::new(instrument, date, time_slot, "bench"))
            .await
            .expect("free slot accepted");
    }

    let snap = engine.snapshot();
    let week = calendar::week_start(NaiveDate::from_ymd_opt(2024, 3, 1).expect("valid date"));
    let n = 500;
    let mut latencies = Vec::with_capacity(n);
    for _ in 0..n {
        let t = Instant::now();
        let grid = calendar::project(&snap.reservations, &snap.instruments, week, 2, None);
        latencies.push(t.elapsed());
        assert_eq!(grid.cells().count(), 42);
    }
    print_latency(&format!("2-week projection over {} reservations", snap.reservations.len()), &mut latencies);
}

#[tokio::main]
async fn main() {
    println!("=== labslot stress benchmark ===\n");

    println!("[phase 1] sequential bookings");
    phase1_sequential().await;

    println!("\n[phase 2] contended bookings, one client");
    phase2_contended_single_client().await;

    println!("\n[phase 3] contended bookings, many clients");
    phase3_contended_clients().await;

    println!("\n[phase 4] calendar projection");
    phase4_projection().await;

    println!("\n=== benchmark complete ===");
}
