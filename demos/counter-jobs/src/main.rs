//! Counter jobs demo.
//!
//! Run with: cargo run -p counter-jobs-demo
//!
//! Schedules stateless and stateful counter jobs on a small worker pool and
//! serves the session liveness probe on http://127.0.0.1:3000 while they run:
//!
//! ```text
//! curl http://127.0.0.1:3000/sessions/<token>
//! ```
//!
//! Environment:
//! - `AFFINITY_WORKERS` / `AFFINITY_IDLE_TIMEOUT_MS` - scheduler config
//! - `AFFINITY_JOBS` - jobs of each kind (default 5)
//! - `AFFINITY_STEPS` - steps per job (default 10)
//! - `AFFINITY_LATENCY_MS` - simulated remote latency (default 20)
//! - `AFFINITY_PROBE_ADDR` - probe listen address (default 127.0.0.1:3000)

use std::{net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use affinity_core::StepDescriptor;
use affinity_executor::{CounterExecutor, GET_COUNTER, INCREMENT_COUNTER};
use affinity_scheduler::{JobKind, JobSpec, Scheduler, SchedulerConfig};
use affinity_transport::{JobReportMessage, http::create_probe_router};
use anyhow::Context;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {value:?}")),
        Err(_) => Ok(default),
    }
}

fn counter_job(kind: JobKind, steps: u32) -> JobSpec {
    JobSpec::new(kind, StepDescriptor::new(INCREMENT_COUNTER), steps)
        .with_verify(StepDescriptor::new(GET_COUNTER))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = SchedulerConfig::from_env()?;
    let jobs: usize = env_or("AFFINITY_JOBS", 5)?;
    let steps: u32 = env_or("AFFINITY_STEPS", 10)?;
    let latency: u64 = env_or("AFFINITY_LATENCY_MS", 20)?;
    let addr: SocketAddr = env_or("AFFINITY_PROBE_ADDR", SocketAddr::from(([127, 0, 0, 1], 3000)))?;

    let executor = Arc::new(CounterExecutor::with_latency(Duration::from_millis(latency)));
    let scheduler = Scheduler::new(executor.clone(), config);

    // Serve liveness probes while the jobs run
    let app = create_probe_router(scheduler.probe()).layer(CorsLayer::permissive());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind probe listener on {addr}"))?;
    tracing::info!("Probe listening on http://{addr}");
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Probe server failed: {e}");
        }
    });

    let mut specs = Vec::with_capacity(jobs * 2);
    for _ in 0..jobs {
        specs.push(counter_job(JobKind::Stateless, steps));
        specs.push(counter_job(JobKind::Stateful, steps));
    }

    tracing::info!(
        jobs = specs.len(),
        workers = scheduler.config().workers,
        "Start"
    );
    let report = scheduler
        .run_until(specs, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    let messages: Vec<JobReportMessage> = report.jobs.iter().map(JobReportMessage::from).collect();
    println!("{}", serde_json::to_string_pretty(&messages)?);

    tracing::info!(
        succeeded = report.succeeded(),
        failed = report.failed(),
        abandoned = report.abandoned.len(),
        open_sessions = executor.open_sessions(),
        "Done"
    );

    server.abort();
    Ok(())
}
