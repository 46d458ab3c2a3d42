//! Ready-made pipelines: an SDK batch processor wrapped in a [`FlowProcessor`].

use crate::config::FlowConfig;
use crate::flow::FlowProcessor;
use opentelemetry_sdk::export::trace::SpanExporter;
use opentelemetry_sdk::runtime::Tokio;
use opentelemetry_sdk::trace::{BatchConfig, BatchConfigBuilder, BatchSpanProcessor};
use std::time::Duration;

/// Shortest delay between scheduled exports. The batch worker ticks on a
/// `tokio::time::interval`, which cannot have a zero period.
pub const MIN_SCHEDULED_DELAY: Duration = Duration::from_millis(1);

/// Batching settings for [`batcher_with_config`].
///
/// Out-of-range values are clamped, never rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    max_queue_size: usize,
    max_export_batch_size: usize,
    scheduled_delay: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_queue_size: 2048,
            max_export_batch_size: 512,
            scheduled_delay: Duration::from_secs(5),
        }
    }
}

impl BatchOptions {
    /// Spans held before new ones are dropped. At least 1.
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size.max(1);
        self.max_export_batch_size = self.max_export_batch_size.min(self.max_queue_size);
        self
    }

    /// Spans per export call. Between 1 and the queue size.
    pub fn with_max_export_batch_size(mut self, size: usize) -> Self {
        self.max_export_batch_size = size.clamp(1, self.max_queue_size);
        self
    }

    /// Delay between scheduled exports. At least [`MIN_SCHEDULED_DELAY`].
    pub fn with_scheduled_delay(mut self, delay: Duration) -> Self {
        self.scheduled_delay = delay.max(MIN_SCHEDULED_DELAY);
        self
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    pub fn max_export_batch_size(&self) -> usize {
        self.max_export_batch_size
    }

    pub fn scheduled_delay(&self) -> Duration {
        self.scheduled_delay
    }

    fn to_batch_config(self) -> BatchConfig {
        BatchConfigBuilder::default()
            .with_max_queue_size(self.max_queue_size)
            .with_max_export_batch_size(self.max_export_batch_size)
            .with_scheduled_delay(self.scheduled_delay)
            .build()
    }
}

/// Batches spans to `exporter` and reports their flow on the default
/// metrics address.
///
/// Must be called within a Tokio runtime.
pub fn batcher<E>(exporter: E) -> FlowProcessor<BatchSpanProcessor<Tokio>>
where
    E: SpanExporter + 'static,
{
    batcher_with_config(exporter, BatchOptions::default(), FlowConfig::default())
}

/// Like [`batcher`], with explicit batching and flow configuration.
pub fn batcher_with_config<E>(
    exporter: E,
    batch: BatchOptions,
    flow: FlowConfig,
) -> FlowProcessor<BatchSpanProcessor<Tokio>>
where
    E: SpanExporter + 'static,
{
    let downstream = BatchSpanProcessor::builder(exporter, Tokio)
        .with_batch_config(batch.to_batch_config())
        .build();
    FlowProcessor::wrap(downstream, flow)
}
