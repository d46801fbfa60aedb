use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use futures::future::join_all;
use reqwest::{Method, Request};
use serde_json::json;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use ratelim::config::RatelimConfig;
use ratelim::dispatch::{KeyedDispatcher, TracingSink};
use ratelim::ratelimit::{target_origin, Rate};

/// Fetch URLs concurrently, rate limited per origin.
#[derive(Parser, Debug)]
#[command(name = "ratelim", version, about)]
struct Args {
    /// URLs to fetch
    #[arg(required = true)]
    urls: Vec<Url>,

    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Burst size for each origin
    #[arg(long)]
    capacity: Option<u32>,

    /// Requests per second for each origin
    #[arg(long)]
    rate: Option<f64>,

    /// Deadline for each request, including time spent waiting for admission
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Print one JSON object per URL instead of plain lines
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    let mut config = RatelimConfig::load(args.config.as_deref())?;
    if let Some(capacity) = args.capacity {
        config.limiter.capacity = capacity;
    }
    if let Some(rate) = args.rate {
        config.limiter.rate = Rate::per_second(rate);
    }
    info!(
        capacity = config.limiter.capacity,
        rate = %config.limiter.rate,
        "Configuration loaded"
    );

    let dispatcher =
        KeyedDispatcher::with_default_transport(config.limiter, target_origin, &config.transport)?
            .with_trace_sink(TracingSink);

    let fetches = args.urls.iter().map(|url| {
        let mut request = Request::new(Method::GET, url.clone());
        *request.timeout_mut() = args.timeout.map(Duration::from_secs);
        let dispatcher = &dispatcher;
        async move {
            let start = Instant::now();
            let result = dispatcher.dispatch(request).await;
            (url, result, start.elapsed())
        }
    });

    let results = tokio::select! {
        results = join_all(fetches) => results,
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, abandoning pending requests");
            return Ok(());
        }
    };

    let mut failed = 0;
    for (url, result, elapsed) in &results {
        let elapsed_ms = elapsed.as_millis() as u64;
        match result {
            Ok(response) if args.json => {
                println!(
                    "{}",
                    json!({
                        "url": url.as_str(),
                        "status": response.status().as_u16(),
                        "elapsed_ms": elapsed_ms,
                    })
                );
            }
            Ok(response) => {
                println!("{} {} ({}ms)", response.status().as_u16(), url, elapsed_ms);
            }
            Err(err) => {
                failed += 1;
                if args.json {
                    println!(
                        "{}",
                        json!({
                            "url": url.as_str(),
                            "error": err.to_string(),
                            "cancelled": err.is_cancelled(),
                            "elapsed_ms": elapsed_ms,
                        })
                    );
                } else {
                    println!("ERR {} ({}ms): {}", url, elapsed_ms, err);
                }
            }
        }
    }

    info!(
        total = results.len(),
        failed = failed,
        origins = dispatcher.limiters().len(),
        "Finished"
    );

    if failed > 0 {
        anyhow::bail!("{} of {} requests failed", failed, results.len());
    }
    Ok(())
}
