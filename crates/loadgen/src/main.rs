mod zipfian;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use zipfian::ZipfianGenerator;

/// Turnstile load generator: Zipfian comment reads mixed with user writes
/// that repeat on purpose.
#[derive(Parser)]
#[command(name = "loadgen")]
struct Args {
    /// Target service URL
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    target_url: String,

    /// Range of post ids to read (ids above 100 hit empty results)
    #[arg(long, default_value_t = 120)]
    num_posts: u64,

    /// Zipfian alpha (skewness) for post ids
    #[arg(long, default_value_t = 1.1)]
    alpha: f64,

    /// Share of requests that are POST /users, 0.0-1.0
    #[arg(long, default_value_t = 0.1)]
    write_ratio: f64,

    /// Distinct emails used by writes; smaller means more duplicates
    #[arg(long, default_value_t = 500)]
    email_pool: u64,

    /// Share of writes that carry an Idempotency-Key header
    #[arg(long, default_value_t = 0.5)]
    token_ratio: f64,

    /// Number of concurrent request tasks
    #[arg(long, default_value_t = 16)]
    concurrency: u64,

    /// Target requests per second (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    rps: u64,
}

/// Response counters, by route and status class.
#[derive(Default)]
struct Counters {
    reads: AtomicU64,
    read_hits: AtomicU64,
    writes: AtomicU64,
    created: AtomicU64,
    conflicts: AtomicU64,
    unprocessable: AtomicU64,
    server_errors: AtomicU64,
    failures: AtomicU64,
}

impl Counters {
    fn total(&self) -> u64 {
        self.reads.load(Ordering::Relaxed) + self.writes.load(Ordering::Relaxed)
    }

    fn record_status(&self, status: StatusCode) {
        let counter = match status {
            StatusCode::CREATED => &self.created,
            StatusCode::CONFLICT => &self.conflicts,
            StatusCode::UNPROCESSABLE_ENTITY => &self.unprocessable,
            s if s.is_server_error() => &self.server_errors,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Worker {
    client: Client,
    args: Arc<Args>,
    counters: Arc<Counters>,
    posts: ZipfianGenerator,
    rng: StdRng,
}

impl Worker {
    async fn run(mut self, worker_id: u64) {
        let delay = match self.args.rps {
            0 => None,
            rps => {
                let per_worker_rps = rps / self.args.concurrency.max(1);
                (per_worker_rps > 0).then(|| Duration::from_micros(1_000_000 / per_worker_rps))
            }
        };

        loop {
            let result = if self.rng.gen_bool(self.args.write_ratio) {
                self.write().await
            } else {
                self.read().await
            };

            if let Err(e) = result {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                if worker_id == 0 {
                    tracing::warn!(error = %e, "request failed");
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }

            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
        }
    }

    async fn read(&mut self) -> Result<(), reqwest::Error> {
        let post_id = self.posts.next_id(&mut self.rng);
        let url = format!("{}/comments?postId={post_id}", self.args.target_url);

        let resp = self.client.get(&url).send().await?;
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        if resp.headers().get("x-cache").is_some_and(|v| v == "HIT") {
            self.counters.read_hits.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.record_status(resp.status());
        Ok(())
    }

    async fn write(&mut self) -> Result<(), reqwest::Error> {
        let n = self.rng.gen_range(1..=self.args.email_pool.max(1));
        let url = format!("{}/users", self.args.target_url);

        let body = json!({
            "email": format!("user{n}@load.test"),
            "username": format!("user{n}"),
        });
        let mut req = self.client.post(&url).json(&body);
        if self.rng.gen_bool(self.args.token_ratio) {
            // Tokens repeat across the pool, so some are replayed with a
            // different email and come back as 422.
            let token = self.rng.gen_range(1..=self.args.email_pool.max(1));
            req = req.header("Idempotency-Key", format!("tok-{token}"));
        }

        let resp = req.send().await?;
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.counters.record_status(resp.status());
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if !(0.0..=1.0).contains(&args.write_ratio) || !(0.0..=1.0).contains(&args.token_ratio) {
        tracing::error!("--write-ratio and --token-ratio must be within 0.0-1.0");
        std::process::exit(2);
    }
    let args = Arc::new(args);

    tracing::info!(
        target_url = %args.target_url,
        alpha = args.alpha,
        num_posts = args.num_posts,
        write_ratio = args.write_ratio,
        email_pool = args.email_pool,
        concurrency = args.concurrency,
        rps = args.rps,
        "loadgen starting"
    );

    let client = Client::builder()
        .pool_max_idle_per_host(64)
        .timeout(Duration::from_secs(5))
        .build()
        .expect("failed to build HTTP client");

    let counters = Arc::new(Counters::default());

    let mut handles = Vec::new();
    for i in 0..args.concurrency {
        let posts = match ZipfianGenerator::new(args.num_posts, args.alpha) {
            Ok(g) => g,
            Err(e) => {
                tracing::error!(error = %e, "invalid Zipfian parameters");
                std::process::exit(2);
            }
        };
        let worker = Worker {
            client: client.clone(),
            args: Arc::clone(&args),
            counters: Arc::clone(&counters),
            posts,
            rng: StdRng::from_entropy(),
        };
        handles.push(tokio::spawn(worker.run(i)));
    }

    // Log throughput every 5 seconds
    let stats = Arc::clone(&counters);
    tokio::spawn(async move {
        let mut prev = 0u64;
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            let current = stats.total();
            let rps = current.saturating_sub(prev) as f64 / 5.0;
            prev = current;

            let reads = stats.reads.load(Ordering::Relaxed);
            let hits = stats.read_hits.load(Ordering::Relaxed);
            tracing::info!(
                total = current,
                rps = format!("{:.0}", rps),
                hit_rate = format!("{:.3}", if reads > 0 { hits as f64 / reads as f64 } else { 0.0 }),
                created = stats.created.load(Ordering::Relaxed),
                conflicts = stats.conflicts.load(Ordering::Relaxed),
                unprocessable = stats.unprocessable.load(Ordering::Relaxed),
                server_errors = stats.server_errors.load(Ordering::Relaxed),
                failures = stats.failures.load(Ordering::Relaxed),
                "throughput"
            );
        }
    });

    // Runs until interrupted
    for h in handles {
        let _ = h.await;
    }
}
