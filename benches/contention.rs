//! In-process booking benchmark: sequential write throughput, contended
//! booking races, and query latency under write load. Run with
//! `cargo bench --bench contention`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use ulid::Ulid;

use cadenza::notify::NotifyHub;
use cadenza::room::LocalRoomProvider;
use cadenza::{BookingPolicy, Engine, EngineError};

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
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
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn new_engine(name: &str) -> Arc<Engine> {
    let dir = std::env::temp_dir().join("cadenza_bench");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{name}_{}.wal", Ulid::new()));
    Arc::new(
        Engine::new(
            path,
            BookingPolicy::default(),
            Arc::new(NotifyHub::default()),
            Arc::new(LocalRoomProvider::default()),
        )
        .unwrap(),
    )
}

fn bench_dates(days: usize) -> Vec<NaiveDate> {
    let start = Utc::now().date_naive() + ChronoDuration::days(7);
    (0..days as i64).map(|d| start + ChronoDuration::days(d)).collect()
}

async fn funded_student(engine: &Engine, hours: f64) -> Ulid {
    let student = Ulid::new();
    engine
        .assign_package(student, Ulid::new(), hours, Utc::now() + ChronoDuration::days(365))
        .await
        .unwrap();
    student
}

async fn phase1_sequential(engine: &Arc<Engine>) {
    let tutor = Ulid::new();
    let dates = bench_dates(90);
    for date in &dates {
        let hours: Vec<u8> = (0..24).collect();
        engine.declare_availability(tutor, *date, &hours).await.unwrap();
    }
    let student = funded_student(engine, 500.0).await;

    let n = 500;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let date = dates[i / 24];
        let hour = (i % 24) as u8;
        let t = Instant::now();
        engine
            .book(tutor, student, date, hour, hour + 1, "en", None)
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("booking latency", &mut latencies);
}

async fn phase2_contended(engine: &Arc<Engine>) {
    let tutor = Ulid::new();
    let dates = bench_dates(10);
    for date in &dates {
        let hours: Vec<u8> = (8..18).collect();
        engine.declare_availability(tutor, *date, &hours).await.unwrap();
    }

    // Many students race for the same 100 windows; every window must end up
    // with exactly one winner.
    let n_tasks = 20;
    let won = Arc::new(AtomicU64::new(0));
    let conflicts = Arc::new(AtomicU64::new(0));
    let start = Instant::now();

    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let engine = engine.clone();
        let dates = dates.clone();
        let won = won.clone();
        let conflicts = conflicts.clone();
        handles.push(tokio::spawn(async move {
            let student = funded_student(&engine, 500.0).await;
            for date in &dates {
                for hour in 8..18u8 {
                    match engine.book(tutor, student, *date, hour, hour + 1, "en", None).await {
                        Ok(_) => {
                            won.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(EngineError::SlotConflict(_)) => {
                            conflicts.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => panic!("unexpected booking error: {e}"),
                    }
                }
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let won = won.load(Ordering::Relaxed);
    let conflicts = conflicts.load(Ordering::Relaxed);
    assert_eq!(won, 100, "every contended window must have exactly one winner");
    println!(
        "  {n_tasks} students x 100 windows: {won} won, {conflicts} conflicts in {:.2}s",
        elapsed.as_secs_f64()
    );
}

async fn phase3_query_under_load(engine: &Arc<Engine>) {
    let tutor = Ulid::new();
    let dates = bench_dates(30);
    for date in &dates {
        let hours: Vec<u8> = (0..24).collect();
        engine.declare_availability(tutor, *date, &hours).await.unwrap();
    }

    // Background writers keep booking while readers query availability.
    let stop = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();
    for w in 0..4usize {
        let engine = engine.clone();
        let dates = dates.clone();
        let stop = stop.clone();
        writers.push(tokio::spawn(async move {
            let student = funded_student(&engine, 500.0).await;
            let mut i = w * 6;
            while !stop.load(Ordering::Relaxed) {
                let date = dates[(i / 24) % dates.len()];
                let hour = (i % 24) as u8;
                let _ = engine.book(tutor, student, date, hour, hour + 1, "en", None).await;
                i += 1;
                tokio::task::yield_now().await;
            }
        }));
    }

    let n_readers = 8;
    let reads_per_reader = 250;
    let mut readers = Vec::new();
    for _ in 0..n_readers {
        let engine = engine.clone();
        let from = dates[0];
        let to = dates[dates.len() - 1];
        readers.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                engine.query_available_slots(tutor, from, to).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in readers {
        all_latencies.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }

    print_latency("availability query", &mut all_latencies);
}

#[tokio::main]
async fn main() {
    println!("=== cadenza contention benchmark ===\n");

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&new_engine("phase1")).await;

    println!("\n[phase 2] contended booking races");
    phase2_contended(&new_engine("phase2")).await;

    println!("\n[phase 3] query latency under write load");
    phase3_query_under_load(&new_engine("phase3")).await;

    println!("\n=== benchmark complete ===");
}
