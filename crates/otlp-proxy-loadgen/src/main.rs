//! Load generator for the OTLP proxy ingress.
//!
//! Fires a fixed number of POSTs at `/v1/logs` or `/v1/traces` with bounded
//! concurrency and reports status counts, latency percentiles, and throughput.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Parser, Debug)]
#[command(name = "otlp-proxy-loadgen", about = "Load generator for the OTLP proxy")]
struct Args {
    /// Proxy base URL
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    target: String,

    /// Signal to post: "logs" or "traces"
    #[arg(long, default_value = "logs")]
    signal: String,

    /// Total number of requests to send
    #[arg(long, default_value_t = 1000)]
    requests: usize,

    /// Maximum in-flight requests
    #[arg(long, default_value_t = 50)]
    concurrency: usize,

    /// Payload size in bytes
    #[arg(long, default_value_t = 1024)]
    body_bytes: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let path = match args.signal.as_str() {
        "logs" => "/v1/logs",
        "traces" => "/v1/traces",
        other => {
            eprintln!("unknown signal {other:?}, expected \"logs\" or \"traces\"");
            return ExitCode::FAILURE;
        }
    };
    let url = format!("{}{}", args.target.trim_end_matches('/'), path);
    let body = vec![b'x'; args.body_bytes];

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(args.concurrency)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            eprintln!("failed to build HTTP client: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!(
        "firing {} requests at {url} (concurrency={}, body={}B)",
        args.requests, args.concurrency, args.body_bytes
    );

    let limiter = Arc::new(Semaphore::new(args.concurrency.max(1)));
    let mut tasks = JoinSet::new();
    let started = Instant::now();

    for _ in 0..args.requests {
        let permit = match Arc::clone(&limiter).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let client = client.clone();
        let url = url.clone();
        let body = body.clone();

        tasks.spawn(async move {
            let begin = Instant::now();
            let outcome = client
                .post(&url)
                .header("Content-Type", "application/x-protobuf")
                .body(body)
                .send()
                .await;
            drop(permit);
            match outcome {
                Ok(response) => (Some(response.status().as_u16()), begin.elapsed()),
                Err(_) => (None, begin.elapsed()),
            }
        });
    }

    let mut latencies: Vec<Duration> = Vec::with_capacity(args.requests);
    let mut counts: Vec<(Option<u16>, usize)> = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let Ok((status, latency)) = joined else {
            continue;
        };
        latencies.push(latency);
        match counts.iter_mut().find(|(s, _)| *s == status) {
            Some((_, n)) => *n += 1,
            None => counts.push((status, 1)),
        }
    }
    let elapsed = started.elapsed();

    counts.sort_by_key(|&(status, _)| status.unwrap_or(0));
    for (status, n) in &counts {
        match status {
            Some(code) => println!("  {code}: {n}"),
            None => println!("  transport error: {n}"),
        }
    }

    latencies.sort();
    if !latencies.is_empty() {
        println!(
            "latency p50={:?} p95={:?} p99={:?}",
            percentile(&latencies, 50),
            percentile(&latencies, 95),
            percentile(&latencies, 99),
        );
        let rps = latencies.len() as f64 / elapsed.as_secs_f64();
        println!("{} requests in {elapsed:?} ({rps:.0} req/s)", latencies.len());
    }

    ExitCode::SUCCESS
}

fn percentile(sorted: &[Duration], p: usize) -> Duration {
    let index = (sorted.len() * p / 100).min(sorted.len() - 1);
    sorted[index]
}
