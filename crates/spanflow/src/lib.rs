//! Telemetry flow metrics for span pipelines
//!
//! `spanflow` provides [`FlowProcessor`], a span processor decorator that
//! counts every span it sees start and end and serves the counts as
//! Prometheus metrics, while forwarding every call to the processor it wraps.
//! It makes it possible to see how many spans a pipeline processes without
//! touching the pipeline itself.
//!
//! ```text
//! Tracer ──► FlowProcessor ──► wrapped processor ──► exporter
//!                  │
//!                  └─► spans_total{state="started"|"ended"}
//!                      served on GET /metrics (default :41820)
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use opentelemetry::trace::{Tracer as _, TracerProvider as _};
//! use opentelemetry_sdk::trace::TracerProvider;
//!
//! # #[tokio::main(flavor = "multi_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = TracerProvider::builder()
//!     .with_span_processor(spanflow::batcher(opentelemetry_stdout::SpanExporter::default()))
//!     .build();
//!
//! let tracer = provider.tracer("app");
//! tracer.in_span("work", |_cx| {
//!     // ...
//! });
//!
//! provider.shutdown()?;
//! # Ok(())
//! # }
//! ```
//!
//! Any [`SpanProcessor`](opentelemetry_sdk::trace::SpanProcessor) can be
//! wrapped directly with [`FlowProcessor::wrap`].

pub mod config;
pub mod counter;
pub mod endpoint;
pub mod error;
pub mod flow;
pub mod pipeline;
pub mod server;

// Re-export main types
pub use config::{FlowConfig, DEFAULT_LISTEN_ADDRESS, DEFAULT_LISTEN_PORT, DEFAULT_SHUTDOWN_TIMEOUT};
pub use counter::{SpanCounter, SpanState};
pub use endpoint::{MetricsEndpoint, METRICS_PATH};
pub use error::{ErrorHandler, ProcessorError, ServerError, TracingErrorHandler};
pub use flow::{FlowProcessor, LifecycleState};
pub use pipeline::{batcher, batcher_with_config, BatchOptions, MIN_SCHEDULED_DELAY};
pub use server::MetricsServer;
