use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms
const ATTENDEES: &str = r#"[{"email":"guest@bench.local","full_name":"Guest"}]"#;

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("kairos")
        .user(format!("bench_{}@bench.local", Ulid::new()))
        .password(std::env::var("KAIROS_PASSWORD").unwrap_or_else(|_| "kairos".into()));

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
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
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

/// Bookings share one global calendar, so every writer works in its own
/// lane of hourly slots far enough apart never to overlap.
fn slot(lane: i64, i: i64) -> (i64, i64) {
    let base = chrono::Utc::now().timestamp_millis() + 24 * HOUR;
    let start = base + (lane * 2_500 + i) * HOUR;
    (start, start + HOUR / 2)
}

fn insert_sql(title: &str, start: i64, end: i64) -> String {
    format!(
        "INSERT INTO bookings (title, start_time, end_time, attendees) VALUES ('{title}', {start}, {end}, '{ATTENDEES}')"
    )
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let (s, e) = slot(1, i as i64);
        let t = Instant::now();
        client.batch_execute(&insert_sql("seq", s, e)).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("create latency", &mut latencies);
}

async fn phase2_concurrent(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for task in 0..n_tasks {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            for j in 0..n_per_task {
                let (s, e) = slot(10 + task as i64, j as i64);
                client.batch_execute(&insert_sql("concurrent", s, e)).await.unwrap();
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_conflicts(host: &str, port: u16) {
    let client = connect(host, port).await;
    let (s, e) = slot(30, 0);
    client.batch_execute(&insert_sql("taken", s, e)).await.unwrap();

    let n = 1000;
    let mut latencies = Vec::with_capacity(n);
    let mut rejected = 0;
    for _ in 0..n {
        let t = Instant::now();
        if client.batch_execute(&insert_sql("clash", s, e)).await.is_err() {
            rejected += 1;
        }
        latencies.push(t.elapsed());
    }
    println!("  {rejected}/{n} overlapping creates rejected");
    print_latency("conflict rejection latency", &mut latencies);
}

async fn phase4_read_under_load(host: &str, port: u16) {
    // Writers continuously add bookings in their own lanes
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let (s, e) = slot(40 + w, i);
                let _ = client.batch_execute(&insert_sql("load", s, e)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for _ in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let (from, _) = slot(1, 0);
            let to = from + 48 * HOUR;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let sql = if i % 2 == 0 {
                    format!("SELECT * FROM bookings WHERE start_time < {to} AND end_time > {from}")
                } else {
                    "SELECT * FROM dashboard".to_string()
                };
                let t = Instant::now();
                client.simple_query(&sql).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("range + dashboard query", &mut all_latencies);
}

async fn phase5_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for c in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            for i in 0..ops_per_conn {
                let (s, e) = slot(100 + c as i64, i as i64);
                client.batch_execute(&insert_sql("storm", s, e)).await.unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("KAIROS_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("KAIROS_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid KAIROS_PORT");

    println!("=== kairos stress benchmark ===");
    println!("target: {host}:{port} (expects no availability windows configured)\n");

    println!("[phase 1] sequential create throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] concurrent create throughput");
    phase2_concurrent(&host, port).await;

    println!("\n[phase 3] conflict rejection");
    phase3_conflicts(&host, port).await;

    println!("\n[phase 4] read latency under write load");
    phase4_read_under_load(&host, port).await;

    println!("\n[phase 5] connection storm");
    phase5_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
