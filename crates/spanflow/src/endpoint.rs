//! `/metrics` request handling.
//!
//! Renders the [`SpanCounter`] snapshot, plus the handler's own scrape
//! instrumentation, in the Prometheus text exposition format. A scrape only
//! reads the counters.

use crate::counter::SpanCounter;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder, TEXT_FORMAT};
use std::sync::Arc;

/// The only route served.
pub const METRICS_PATH: &str = "/metrics";

/// Scrape instrumentation registered next to the span counters.
struct HandlerMetrics {
    requests: IntCounterVec,
    in_flight: IntGauge,
}

impl HandlerMetrics {
    fn register(registry: &Registry) -> prometheus::Result<Self> {
        let requests = IntCounterVec::new(
            Opts::new(
                "promhttp_metric_handler_requests_total",
                "Total number of scrapes by HTTP status code.",
            ),
            &["code"],
        )?;
        let in_flight = IntGauge::new(
            "promhttp_metric_handler_requests_in_flight",
            "Current number of scrapes being served.",
        )?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;

        // Expose the common codes at zero before the first scrape.
        for code in ["200", "500", "503"] {
            requests.with_label_values(&[code]);
        }

        Ok(Self {
            requests,
            in_flight,
        })
    }
}

/// Decrements the in-flight gauge when the scrape finishes.
struct InFlight<'a>(&'a IntGauge);

impl<'a> InFlight<'a> {
    fn enter(gauge: &'a IntGauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.dec();
    }
}

/// HTTP handler for the metrics route.
pub struct MetricsEndpoint {
    counter: Arc<SpanCounter>,
    registry: Registry,
    instrumentation: Option<HandlerMetrics>,
}

impl MetricsEndpoint {
    /// Creates an endpoint exposing `counter`.
    ///
    /// If the scrape instrumentation cannot be registered the endpoint still
    /// serves the span counters, without it.
    pub fn new(counter: Arc<SpanCounter>) -> Self {
        let registry = Registry::new();
        let instrumentation = match HandlerMetrics::register(&registry) {
            Ok(metrics) => Some(metrics),
            Err(err) => {
                tracing::warn!(error = %err, "scrape instrumentation disabled");
                None
            }
        };

        Self {
            counter,
            registry,
            instrumentation,
        }
    }

    /// Collects the span counters and the handler instrumentation.
    pub fn gather(&self) -> prometheus::Result<Vec<MetricFamily>> {
        let spans = IntCounterVec::new(
            Opts::new(SpanCounter::NAME, SpanCounter::HELP),
            &[SpanCounter::LABEL],
        )?;
        for (state, value) in self.counter.snapshot() {
            spans.with_label_values(&[state.as_str()]).inc_by(value);
        }

        let scratch = Registry::new();
        scratch.register(Box::new(spans))?;

        let mut families = self.registry.gather();
        families.extend(scratch.gather());
        Ok(families)
    }

    /// Renders the current metrics in the text exposition format.
    pub fn render(&self) -> prometheus::Result<Vec<u8>> {
        let families = self.gather()?;
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf)?;
        Ok(buf)
    }

    /// Serves one request.
    pub fn handle<B>(&self, req: &Request<B>) -> Response<Full<Bytes>> {
        if req.uri().path() != METRICS_PATH {
            return text_response(StatusCode::NOT_FOUND, "not found\n");
        }
        if req.method() != Method::GET && req.method() != Method::HEAD {
            let mut response = text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n");
            response
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
            return response;
        }

        let response = {
            let _in_flight = self
                .instrumentation
                .as_ref()
                .map(|m| InFlight::enter(&m.in_flight));
            self.scrape(req.method() == Method::HEAD)
        };

        if let Some(metrics) = &self.instrumentation {
            metrics
                .requests
                .with_label_values(&[response.status().as_str()])
                .inc();
        }
        response
    }

    fn scrape(&self, head_only: bool) -> Response<Full<Bytes>> {
        match self.render() {
            Ok(body) => {
                let body = if head_only { Bytes::new() } else { Bytes::from(body) };
                let mut response = Response::new(Full::new(body));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT));
                response
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode metrics");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "error encoding metrics\n")
            }
        }
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::SpanState;
    use http_body_util::BodyExt;

    fn request(method: Method, path: &str) -> Request<()> {
        Request::builder().method(method).uri(path).body(()).unwrap()
    }

    async fn body_string(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn spans_lines(body: &str) -> Vec<&str> {
        body.lines().filter(|l| l.starts_with("spans_total")).collect()
    }

    #[tokio::test]
    async fn test_scrape_lists_every_state_once() {
        let counter = Arc::new(SpanCounter::new());
        counter.increment(SpanState::Started);
        counter.increment(SpanState::Started);
        counter.increment(SpanState::Ended);
        let endpoint = MetricsEndpoint::new(Arc::clone(&counter));

        let response = endpoint.handle(&request(Method::GET, "/metrics"));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], TEXT_FORMAT);

        let body = body_string(response).await;
        assert_eq!(
            spans_lines(&body),
            [
                "spans_total{state=\"ended\"} 1",
                "spans_total{state=\"started\"} 2",
            ]
        );
        assert!(body.contains("# HELP spans_total The total number of processed spans"));
        assert!(body.contains("# TYPE spans_total counter"));
    }

    #[tokio::test]
    async fn test_zero_counters_are_exposed() {
        let endpoint = MetricsEndpoint::new(Arc::new(SpanCounter::new()));
        let body = body_string(endpoint.handle(&request(Method::GET, "/metrics"))).await;

        assert!(body.contains("spans_total{state=\"started\"} 0"));
        assert!(body.contains("spans_total{state=\"ended\"} 0"));
    }

    #[tokio::test]
    async fn test_scrape_does_not_mutate_counters() {
        let counter = Arc::new(SpanCounter::new());
        counter.increment(SpanState::Ended);
        let endpoint = MetricsEndpoint::new(Arc::clone(&counter));

        for _ in 0..3 {
            let _ = endpoint.handle(&request(Method::GET, "/metrics"));
        }
        assert_eq!(
            counter.snapshot(),
            [(SpanState::Started, 0), (SpanState::Ended, 1)]
        );
    }

    #[tokio::test]
    async fn test_scrapes_are_instrumented() {
        let endpoint = MetricsEndpoint::new(Arc::new(SpanCounter::new()));

        let first = body_string(endpoint.handle(&request(Method::GET, "/metrics"))).await;
        assert!(first.contains("promhttp_metric_handler_requests_total{code=\"200\"} 0"));
        assert!(first.contains("promhttp_metric_handler_requests_total{code=\"503\"} 0"));
        assert!(first.contains("promhttp_metric_handler_requests_in_flight 1"));

        let second = body_string(endpoint.handle(&request(Method::GET, "/metrics"))).await;
        assert!(second.contains("promhttp_metric_handler_requests_total{code=\"200\"} 1"));
    }

    #[tokio::test]
    async fn test_head_has_no_body() {
        let endpoint = MetricsEndpoint::new(Arc::new(SpanCounter::new()));
        let response = endpoint.handle(&request(Method::HEAD, "/metrics"));

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_other_routes_and_methods() {
        let endpoint = MetricsEndpoint::new(Arc::new(SpanCounter::new()));

        let response = endpoint.handle(&request(Method::GET, "/"));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = endpoint.handle(&request(Method::POST, "/metrics"));
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[ALLOW], "GET, HEAD");
    }
}
