use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, TimeDelta, Utc};
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

async fn connect(host: &str, port: u16, dbname: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(dbname)
        .user("staygrid")
        .password("staygrid");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn fresh_tenant() -> String {
    format!("bench_{}", Ulid::new())
}

fn day(offset: i64) -> NaiveDate {
    Utc::now().date_naive() + TimeDelta::days(7 + offset)
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

async fn create_unit(client: &tokio_postgres::Client) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO units (id, name, nightly_rate, active) VALUES ('{id}', 'bench', 10000, true)"
        ))
        .await
        .expect("create unit");
    id
}

fn occupancy_sql(unit: Ulid, from: i64, nights: i64) -> String {
    format!(
        "INSERT INTO occupancies (id, unit_id, requester, check_in, check_out, state) \
         VALUES ('{}', '{unit}', 'bench', '{}', '{}', 'confirmed')",
        Ulid::new(),
        day(from),
        day(from + nights)
    )
}

fn hold_sql(unit: Ulid, from: i64, nights: i64) -> String {
    format!(
        "INSERT INTO holds (id, unit_id, requester, check_in, check_out, hold_minutes) \
         VALUES ('{}', '{unit}', 'bench', '{}', '{}', 15)",
        Ulid::new(),
        day(from),
        day(from + nights)
    )
}

/// Back-to-back one-night stays on one unit, each checking in on the
/// previous check-out day.
async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &fresh_tenant()).await;
    let unit = create_unit(&client).await;
    let n = 300;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        client
            .batch_execute(&occupancy_sql(unit, i as i64, 1))
            .await
            .expect("sequential occupancy");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} occupancies in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Many clients race for overlapping stays on a handful of units. Exactly
/// one claim per contested range may win.
async fn phase2_contention(host: &str, port: u16) {
    let tenant = fresh_tenant();
    let setup = connect(host, port, &tenant).await;
    let n_units = 5;
    let mut units = Vec::with_capacity(n_units);
    for _ in 0..n_units {
        units.push(create_unit(&setup).await);
    }
    drop(setup);

    let n_tasks = 40;
    let rounds = 20;
    let won = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for t in 0..n_tasks {
        let host = host.to_string();
        let tenant = tenant.clone();
        let units = units.clone();
        let won = won.clone();
        let lost = lost.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let mut latencies = Vec::with_capacity(rounds);
            for r in 0..rounds {
                let unit = units[(t + r) % units.len()];
                // Every task aims at the same week per round, offset a night or two.
                let from = (r as i64) * 10 + (t as i64 % 3);
                let sql = if t % 2 == 0 {
                    hold_sql(unit, from, 3)
                } else {
                    occupancy_sql(unit, from, 3)
                };
                let started = Instant::now();
                match client.batch_execute(&sql).await {
                    Ok(()) => won.fetch_add(1, Ordering::Relaxed),
                    Err(_) => lost.fetch_add(1, Ordering::Relaxed),
                };
                latencies.push(started.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in handles {
        all_latencies.extend(h.await.expect("contention task"));
    }

    let elapsed = start.elapsed();
    let total = n_tasks * rounds;
    println!(
        "  {n_tasks} tasks x {rounds} claims = {total} attempts in {:.2}s: {} won, {} rejected",
        elapsed.as_secs_f64(),
        won.load(Ordering::Relaxed),
        lost.load(Ordering::Relaxed),
    );
    print_latency("claim latency", &mut all_latencies);
}

/// Availability and calendar reads while writers keep placing holds.
async fn phase3_read_under_load(host: &str, port: u16) {
    let tenant = fresh_tenant();
    let setup = connect(host, port, &tenant).await;
    let unit = create_unit(&setup).await;
    for i in 0..60 {
        setup
            .batch_execute(&occupancy_sql(unit, i * 4, 2))
            .await
            .expect("prefill");
    }
    drop(setup);

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let tenant = tenant.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let _ = client.batch_execute(&hold_sql(unit, 2 + (w * 50 + i) % 240, 1)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 300;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        let tenant = tenant.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let from = ((r * 7 + i) % 200) as i64;
                let sql = if i % 4 == 0 {
                    format!(
                        "SELECT * FROM calendar WHERE unit_id = '{unit}' AND date >= '{}' AND date <= '{}'",
                        day(from),
                        day(from + 30)
                    )
                } else {
                    format!(
                        "SELECT * FROM availability WHERE unit_id = '{unit}' AND check_in = '{}' AND check_out = '{}'",
                        day(from),
                        day(from + 3)
                    )
                };
                let t = Instant::now();
                client.simple_query(&sql).await.expect("read");
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.expect("reader task"));
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("read latency", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &fresh_tenant()).await;
            let unit = create_unit(&client).await;
            for i in 0..ops_per_conn {
                client
                    .batch_execute(&occupancy_sql(unit, i * 2, 2))
                    .await
                    .expect("storm occupancy");
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
    let host = std::env::var("STAYGRID_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("STAYGRID_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid STAYGRID_PORT");

    println!("=== staygrid stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential write throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended claims");
    phase2_contention(&host, port).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
