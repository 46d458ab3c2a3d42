//! # Fibonacci Demo
//!
//! A small service that computes Fibonacci numbers and traces every
//! computation. Spans go through a batch processor wrapped in a
//! `FlowProcessor`, so the span flow can be watched while it runs:
//!
//! ```bash
//! cargo run -p spanflow --bin fib
//!
//! # in another shell
//! curl -s localhost:41820/metrics | grep spans_total
//! ```
//!
//! Every 30-100ms a root `Run` span is opened with a child `Fibonacci` span
//! for a random `n` in `[0, 100]`. Results that overflow `u64` mark the span
//! as an error. Press Ctrl-C to shut the provider down.

use anyhow::Context as _;
use opentelemetry::trace::{Span as _, Status, TraceContextExt as _, Tracer as _, TracerProvider as _};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::trace::{Tracer, TracerProvider};
use rand::Rng;
use spanflow::DEFAULT_LISTEN_ADDRESS;
use std::time::Duration;

const MAX_N: u64 = 100;

/// Returns the `n`th Fibonacci number, or `None` if it does not fit in a `u64`.
fn fibonacci(n: u64) -> Option<u64> {
    if n <= 1 {
        return Some(n);
    }

    let (mut prev, mut curr) = (0u64, 1u64);
    for _ in 1..n {
        let next = prev.checked_add(curr)?;
        prev = curr;
        curr = next;
    }
    Some(curr)
}

fn run_once(tracer: &Tracer, n: u64) {
    let run = Context::current_with_span(tracer.start("Run"));

    let mut span = tracer.start_with_context("Fibonacci", &run);
    span.set_attribute(KeyValue::new("fibonacci.n", n as i64));
    match fibonacci(n) {
        Some(result) => {
            span.set_attribute(KeyValue::new("fibonacci.result", result.to_string()));
            span.set_status(Status::Ok);
        }
        None => {
            tracing::debug!(n, "fibonacci overflowed u64");
            span.set_status(Status::error(format!("fibonacci({n}) overflows u64")));
        }
    }
    span.end();
    run.span().end();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let provider = TracerProvider::builder()
        .with_span_processor(spanflow::batcher(opentelemetry_stdout::SpanExporter::default()))
        .build();
    let tracer = provider.tracer("fib");

    tracing::info!(address = DEFAULT_LISTEN_ADDRESS, "serving span flow metrics");

    let mut rng = rand::thread_rng();
    loop {
        let pause = Duration::from_millis(rng.gen_range(30..=100));
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            () = tokio::time::sleep(pause) => run_once(&tracer, rng.gen_range(0..=MAX_N)),
        }
    }

    tracing::info!("shutting down");
    tokio::task::spawn_blocking(move || provider.shutdown())
        .await
        .context("shutdown task")?
        .context("tracer provider shutdown")?;
    Ok(())
}
