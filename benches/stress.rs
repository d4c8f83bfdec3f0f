use std::sync::Arc;
use std::time::{Duration, Instant};

use ulid::Ulid;

use shelf::config::Config;
use shelf::engine::{BookingFilter, Engine};
use shelf::form::BookingForm;
use shelf::hints::ClientHint;
use shelf::model::{Actor, Custodian, Role};
use shelf::tenant::TenantManager;

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

/// Each phase gets its own organization so phases do not interfere.
fn open_engine(tm: &TenantManager, name: &str) -> Arc<Engine> {
    tm.get_or_create(&format!("{name}_{}", Ulid::new()).to_lowercase()).unwrap()
}

/// Day `day` of 2099, one booking per day, 09:00-17:00.
fn form(admin: &Actor, day: u32) -> BookingForm {
    let month = 1 + day / 28;
    let dom = 1 + day % 28;
    BookingForm {
        name: format!("Booking {day}"),
        start: format!("2099-{month:02}-{dom:02}T09:00"),
        end: format!("2099-{month:02}-{dom:02}T17:00"),
        custodian: Some(Custodian::User(admin.user_id)),
    }
}

async fn drafted(engine: &Engine, admin: &Actor, day: u32, assets: &[Ulid]) -> Ulid {
    let id = engine.create_draft_booking(admin, None).await.unwrap();
    engine
        .save_booking(admin, id, form(admin, day), &ClientHint::default())
        .await
        .unwrap();
    engine
        .manage_assets(admin, id, assets.to_vec(), vec![])
        .await
        .unwrap();
    id
}

async fn assets(engine: &Engine, n: usize) -> Vec<Ulid> {
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let id = Ulid::new();
        engine.create_asset(id, format!("Asset {i}"), true).await.unwrap();
        ids.push(id);
    }
    ids
}

async fn phase1_sequential(tm: &TenantManager, admin: Actor) {
    let engine = open_engine(tm, "sequential");
    let pool = assets(&engine, 5).await;

    let n = 300;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for day in 0..n as u32 {
        let id = drafted(&engine, &admin, day, &pool).await;
        let t = Instant::now();
        engine.reserve_booking(&admin, id).await.unwrap();
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("reserve latency", &mut latencies);
}

async fn phase2_contended(tm: &TenantManager, admin: Actor) {
    let engine = open_engine(tm, "contended");
    let pool = assets(&engine, 3).await;

    // Every task races for the same assets on the same day.
    let n_tasks = 50;
    let mut ids = Vec::with_capacity(n_tasks);
    for _ in 0..n_tasks {
        ids.push(drafted(&engine, &admin, 0, &pool).await);
    }

    let start = Instant::now();
    let handles: Vec<_> = ids
        .into_iter()
        .map(|id| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.reserve_booking(&admin, id).await.is_ok() })
        })
        .collect();
    let mut won = 0;
    for h in handles {
        if h.await.unwrap() {
            won += 1;
        }
    }
    let elapsed = start.elapsed();
    println!(
        "  {n_tasks} racing reserves in {:.2}ms, {won} won",
        elapsed.as_secs_f64() * 1000.0
    );
    assert_eq!(won, 1, "exactly one reserve may claim the assets");
}

async fn phase3_read_under_load(tm: &TenantManager, admin: Actor) {
    let engine = open_engine(tm, "read_under_load");
    let pool = assets(&engine, 10).await;
    for day in 0..100 {
        let id = drafted(&engine, &admin, day, &pool[..2]).await;
        engine.reserve_booking(&admin, id).await.unwrap();
    }

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..4u32 {
        let engine = engine.clone();
        let stop = stop.clone();
        let asset = pool[2 + w as usize];
        writer_handles.push(tokio::spawn(async move {
            let mut day = 0;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) && day < 300 {
                let id = drafted(&engine, &admin, day, &[asset]).await;
                let _ = engine.reserve_booking(&admin, id).await;
                day += 1;
            }
        }));
    }

    let n = 500;
    let mut latencies = Vec::with_capacity(n);
    for _ in 0..n {
        let t = Instant::now();
        let _ = engine.list_bookings(&admin, &BookingFilter::default()).await;
        latencies.push(t.elapsed());
    }
    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    for h in writer_handles {
        h.await.unwrap();
    }
    print_latency("list latency", &mut latencies);
}

async fn phase4_compaction(tm: &TenantManager, admin: Actor) {
    let engine = open_engine(tm, "compaction");
    let pool = assets(&engine, 5).await;
    for day in 0..200 {
        let id = drafted(&engine, &admin, day, &pool).await;
        engine.reserve_booking(&admin, id).await.unwrap();
    }
    let appends = engine.wal_appends_since_compact().await;
    let t = Instant::now();
    engine.compact_wal().await.unwrap();
    println!(
        "  compacted {appends} appends in {:.2}ms",
        t.elapsed().as_secs_f64() * 1000.0
    );
}

#[tokio::main]
async fn main() {
    shelf::observability::init_tracing();
    let config = Config {
        data_dir: std::env::temp_dir().join(format!("shelf_bench_{}", Ulid::new())),
        ..Config::from_env()
    };
    shelf::observability::init(config.metrics_port).expect("metrics exporter");
    let tm = TenantManager::from_config(&config);
    let admin = Actor::new(Ulid::new(), Role::Admin);

    println!("=== shelf stress benchmark ===");
    println!("data_dir: {}\n", config.data_dir.display());

    println!("[phase 1] sequential reserve throughput");
    phase1_sequential(&tm, admin).await;

    println!("\n[phase 2] contended reserves");
    phase2_contended(&tm, admin).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&tm, admin).await;

    println!("\n[phase 4] WAL compaction");
    phase4_compaction(&tm, admin).await;

    println!("\n=== benchmark complete ===");
}
