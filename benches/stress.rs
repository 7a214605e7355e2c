use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveDateTime, TimeDelta, Weekday};
use ulid::Ulid;

use rezcore::engine::{Engine, EngineError};
use rezcore::model::*;
use rezcore::notify::NotifyHub;

const SLOTS_PER_DAY: usize = 48;

fn bench_now() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2030, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .expect("valid bench clock")
}

fn first_day() -> NaiveDate {
    bench_now().date() + TimeDelta::days(1)
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
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// Slot `n` counted from the first bookable day, 48 per day.
fn nth_slot(n: usize) -> (NaiveDate, TimeSlot) {
    let day = first_day() + TimeDelta::days((n / SLOTS_PER_DAY) as i64);
    let start = (n % SLOTS_PER_DAY) as u16 * 30;
    (day, TimeSlot::new(start, start + 30))
}

struct World {
    engine: Arc<Engine>,
    businesses: Vec<Ulid>,
    users: Vec<Ulid>,
}

/// Businesses open around the clock every day with no lead time.
async fn setup(path: PathBuf, n_businesses: usize, n_users: usize) -> World {
    let engine = Arc::new(
        Engine::new(path, Arc::new(NotifyHub::new()))
            .expect("open engine")
            .with_clock(bench_now),
    );
    let owner = engine
        .create_owner(NewOwner {
            name: "Bench".into(),
            surname: "Owner".into(),
            gsm: "05550000000".into(),
            email: format!("owner-{}@bench.example", Ulid::new()).to_lowercase(),
            owner_type: OwnerType::Corporate,
        })
        .await
        .expect("owner");

    let mut businesses = Vec::new();
    for i in 0..n_businesses {
        let business = engine
            .create_business(NewBusiness {
                name: format!("Bench Business {i}"),
                owner_id: owner.id,
                location: Location {
                    place_id: format!("bench-place-{i}"),
                    address: "Bench Road".into(),
                    latitude: None,
                    longitude: None,
                },
                contact_email: None,
                contact_phone: None,
            })
            .await
            .expect("business");
        engine
            .save_settings(
                business.id,
                SettingsUpdate {
                    min_advance_minutes: Some(0),
                    max_advance_days: Some(3_000),
                    ..Default::default()
                },
            )
            .await
            .expect("settings");
        for day in [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ] {
            engine
                .add_rule(business.id, RuleDefinition::weekly(day, vec![TimeSlot::new(0, 24 * 60)]))
                .await
                .expect("rule");
        }
        businesses.push(business.id);
    }

    let mut users = Vec::new();
    for i in 0..n_users {
        let user = engine
            .create_user(NewUser {
                name: format!("Guest{i}"),
                surname: "Bench".into(),
                gsm: "05551234567".into(),
                email: format!("guest{i}-{}@bench.example", Ulid::new()).to_lowercase(),
            })
            .await
            .expect("user");
        users.push(user.id);
    }

    println!("  {} businesses, {} users", businesses.len(), users.len());
    World {
        engine,
        businesses,
        users,
    }
}

fn booking(world: &World, user: usize, business: usize, n: usize) -> BookingRequest {
    let (date, time_slot) = nth_slot(n);
    BookingRequest {
        user_id: world.users[user % world.users.len()],
        business_id: world.businesses[business % world.businesses.len()],
        date,
        time_slot,
        notes: None,
    }
}

async fn phase1_sequential(world: &World) {
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        world
            .engine
            .book_reservation(booking(world, i, 0, i))
            .await
            .expect("sequential booking");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(world: &World) {
    let n_tasks = 10;
    let n_per_task = 200;
    let start = Instant::now();

    let mut handles = Vec::new();
    for t in 0..n_tasks {
        let engine = world.engine.clone();
        let requests: Vec<BookingRequest> = (0..n_per_task)
            .map(|j| booking(world, t, 1 + t % (world.businesses.len() - 1), t * n_per_task + j))
            .collect();
        handles.push(tokio::spawn(async move {
            for req in requests {
                engine.book_reservation(req).await.expect("concurrent booking");
            }
        }));
    }
    for h in handles {
        h.await.expect("task");
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

/// Many callers race for the same few slots; each slot must have one winner.
async fn phase3_contention(world: &World) {
    let contenders = 50;
    let slots = 20;
    let business = world.businesses.len() - 1;
    let base = 10_000;

    let wins = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let mut handles = Vec::new();
    for c in 0..contenders {
        let engine = world.engine.clone();
        let requests: Vec<BookingRequest> =
            (0..slots).map(|s| booking(world, c, business, base + s)).collect();
        let (wins, conflicts) = (wins.clone(), conflicts.clone());
        handles.push(tokio::spawn(async move {
            for req in requests {
                match engine.book_reservation(req).await {
                    Ok(_) => wins.fetch_add(1, Ordering::Relaxed),
                    Err(EngineError::SlotAlreadyBooked { .. }) => {
                        conflicts.fetch_add(1, Ordering::Relaxed)
                    }
                    Err(e) => panic!("unexpected booking error: {e}"),
                };
            }
        }));
    }
    for h in handles {
        h.await.expect("task");
    }

    let wins = wins.load(Ordering::Relaxed);
    let conflicts = conflicts.load(Ordering::Relaxed);
    println!(
        "  {contenders} contenders x {slots} slots: {wins} booked, {conflicts} conflicts in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    assert_eq!(wins, slots, "every contended slot must have exactly one winner");
}

async fn phase4_read_under_load(world: &World) {
    let stop = Arc::new(AtomicBool::new(false));

    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let engine = world.engine.clone();
        let stop = stop.clone();
        let requests: Vec<BookingRequest> = (0..5_000)
            .map(|i| booking(world, w, 0, 20_000 + w * 5_000 + i))
            .collect();
        writer_handles.push(tokio::spawn(async move {
            for req in requests {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                let _ = engine.book_reservation(req).await;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let engine = world.engine.clone();
        let business = world.businesses[r % world.businesses.len()];
        reader_handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let date = first_day() + TimeDelta::days((i % 60) as i64);
                let t = Instant::now();
                engine.slot_board(business, date).expect("slot board");
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.expect("reader"));
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("slot board query", &mut all_latencies);
}

async fn phase5_compaction(world: &World) {
    let before = world.engine.wal_appends_since_compact().await;
    let start = Instant::now();
    world.engine.compact_wal().await.expect("compaction");
    println!(
        "  compacted {before} appends in {:.2}ms",
        start.elapsed().as_secs_f64() * 1000.0
    );
}

#[tokio::main]
async fn main() {
    let dir = std::env::temp_dir().join(format!("rezcore_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).expect("bench dir");

    println!("=== rezcore stress benchmark ===");
    println!("wal: {}\n", dir.display());

    println!("[setup]");
    let world = setup(dir.join("bench.wal"), 4, 64).await;

    println!("\n[phase 1] sequential booking throughput");
    phase1_sequential(&world).await;

    println!("\n[phase 2] concurrent booking throughput");
    phase2_concurrent(&world).await;

    println!("\n[phase 3] contended slots");
    phase3_contention(&world).await;

    println!("\n[phase 4] availability reads under write load");
    phase4_read_under_load(&world).await;

    println!("\n[phase 5] compaction");
    phase5_compaction(&world).await;

    let _ = std::fs::remove_dir_all(&dir);
    println!("\n=== benchmark complete ===");
}
