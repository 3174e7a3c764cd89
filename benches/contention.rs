use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms

/// 2030-01-01T00:00:00Z
const EPOCH: i64 = 1_893_456_000_000;

async fn connect(host: &str, port: u16, password: &str) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("slotline")
        .user("slotline")
        .password(password);

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
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn rfc3339(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .expect("timestamp in range")
        .to_rfc3339()
}

/// Column `idx` of the first row.
async fn field(client: &Client, sql: &str, idx: usize) -> Result<Option<String>, tokio_postgres::Error> {
    for msg in client.simple_query(sql).await? {
        if let SimpleQueryMessage::Row(row) = msg {
            return Ok(row.get(idx).map(str::to_string));
        }
    }
    Ok(None)
}

async fn new_provider(client: &Client) -> (Ulid, Ulid) {
    let provider = Ulid::new();
    let service = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO services (id, provider_id, name, duration, price) VALUES ('{service}', '{provider}', 'Consultation', 60, 5000)"
        ))
        .await
        .unwrap();
    (provider, service)
}

fn booking_sql(provider: Ulid, service: Ulid, start: i64) -> String {
    let customer = Ulid::new();
    format!(
        "INSERT INTO appointments (customer_id, provider_id, service_id, start_time) VALUES ('{customer}', '{provider}', '{service}', '{}')",
        rfc3339(start)
    )
}

async fn phase1_sequential(host: &str, port: u16, password: &str) {
    let client = connect(host, port, password).await;
    let (provider, service) = new_provider(&client).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let sql = booking_sql(provider, service, EPOCH + (i as i64) * HOUR);
        let t = Instant::now();
        client.batch_execute(&sql).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("booking latency", &mut latencies);
}

/// Many clients fight over the same hour. Exactly one may win each slot.
async fn phase2_same_slot(host: &str, port: u16, password: &str) {
    let setup = connect(host, port, password).await;
    let (provider, service) = new_provider(&setup).await;
    drop(setup);

    let n_clients = 20;
    let n_slots = 100;
    let confirmed = Arc::new(AtomicUsize::new(0));
    let waitlisted = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_clients {
        let host = host.to_string();
        let password = password.to_string();
        let (confirmed, waitlisted, conflicts) = (confirmed.clone(), waitlisted.clone(), conflicts.clone());
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &password).await;
            for slot in 0..n_slots {
                let sql = booking_sql(provider, service, EPOCH + slot * HOUR);
                match field(&client, &sql, 0).await {
                    Ok(Some(outcome)) if outcome == "confirmed" => confirmed.fetch_add(1, Ordering::Relaxed),
                    Ok(_) => waitlisted.fetch_add(1, Ordering::Relaxed),
                    Err(e) if e.code().map(|c| c.code()) == Some("40001") => conflicts.fetch_add(1, Ordering::Relaxed),
                    Err(e) => panic!("booking failed: {e}"),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let confirmed = confirmed.load(Ordering::Relaxed);
    println!(
        "  {n_clients} clients x {n_slots} slots in {:.2}s: {confirmed} confirmed, {} waitlisted, {} conflicts",
        elapsed.as_secs_f64(),
        waitlisted.load(Ordering::Relaxed),
        conflicts.load(Ordering::Relaxed),
    );
    assert_eq!(confirmed, n_slots as usize, "every slot must be confirmed exactly once");
}

async fn phase3_availability_under_load(host: &str, port: u16, password: &str) {
    let setup = connect(host, port, password).await;
    let (provider, service) = new_provider(&setup).await;
    for i in 0..200 {
        setup
            .batch_execute(&booking_sql(provider, service, EPOCH + i * 2 * HOUR))
            .await
            .unwrap();
    }
    drop(setup);

    // Writers keep booking and cancelling on their own providers.
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let password = password.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &password).await;
            let (provider, service) = new_provider(&client).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                if let Ok(Some(id)) = field(&client, &booking_sql(provider, service, EPOCH + i * HOUR), 1).await {
                    if i % 2 == 0 {
                        let _ = client
                            .batch_execute(&format!("DELETE FROM appointments WHERE id = '{id}'"))
                            .await;
                    }
                }
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        let password = password.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &password).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let s = EPOCH + ((r * reads_per_reader + i) as i64 % 400) * HOUR;
                let sql = format!(
                    "SELECT * FROM availability WHERE provider_id = '{provider}' AND start_time = {s} AND end_time = {}",
                    s + HOUR
                );
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

    print_latency("availability query", &mut all_latencies);
}

/// Cancel a slot with a long waiting list over and over; each cancel promotes one entry.
async fn phase4_cancellation_cascade(host: &str, port: u16, password: &str) {
    let client = connect(host, port, password).await;
    let (provider, service) = new_provider(&client).await;

    let n_waiting = 500;
    let slot = EPOCH;
    let mut current = field(&client, &booking_sql(provider, service, slot), 1)
        .await
        .unwrap()
        .expect("booking row");
    for _ in 0..n_waiting {
        client.batch_execute(&booking_sql(provider, service, slot)).await.unwrap();
    }

    let mut latencies = Vec::with_capacity(n_waiting);
    let mut promoted = 0;
    let start = Instant::now();
    for _ in 0..n_waiting {
        let t = Instant::now();
        let outcome = field(&client, &format!("DELETE FROM appointments WHERE id = '{current}'"), 0)
            .await
            .unwrap();
        latencies.push(t.elapsed());
        if outcome.as_deref() == Some("cancelled_and_promoted") {
            promoted += 1;
        }
        // Take the freed slot again for the next round.
        current = field(&client, &booking_sql(provider, service, slot), 1)
            .await
            .unwrap()
            .expect("booking row");
    }

    println!(
        "  {} cancellations, {promoted} promotions in {:.2}s",
        latencies.len(),
        start.elapsed().as_secs_f64()
    );
    print_latency("cancel latency", &mut latencies);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SLOTLINE_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SLOTLINE_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid SLOTLINE_PORT");
    let password = std::env::var("SLOTLINE_PASSWORD").unwrap_or_else(|_| "slotline".into());

    println!("=== slotline contention benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&host, port, &password).await;

    println!("\n[phase 2] concurrent requests for the same slot");
    phase2_same_slot(&host, port, &password).await;

    println!("\n[phase 3] availability latency under write load");
    phase3_availability_under_load(&host, port, &password).await;

    println!("\n[phase 4] cancellation cascade");
    phase4_cancellation_cascade(&host, port, &password).await;

    println!("\n=== benchmark complete ===");
}
