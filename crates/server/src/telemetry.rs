//! Tracing subscriber setup and per-request HTTP instrumentation.

use std::time::Duration;
#[cfg(feature = "metrics")]
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
    time::Instant,
};

use axum::{body::HttpBody, extract::MatchedPath};
use tower_http::request_id::RequestId;
use tracing::{
    field::{Field, Visit},
    Event, Subscriber,
};
use tracing_subscriber::{
    fmt::{
        format::Format as FmtFormat, format::Writer as FmtWriter, writer::MakeWriter, FmtContext,
        FormatEvent, FormatFields,
    },
    layer::{Context as LayerContext, SubscriberExt},
    registry::LookupSpan,
    EnvFilter, Layer,
};

#[cfg(feature = "metrics")]
use crate::metrics::MetricsContext;
use crate::config::{LogFormat, ServerConfig};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const DEFAULT_FILTER: &str = "info,harmony_server=info,harmony=info";

/// Installs the global subscriber. Later calls leave the first one in place.
pub fn init_tracing(config: &ServerConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let json = matches!(config.log_format(), LogFormat::Json);
    let subscriber = build_subscriber(json, env_filter, std::io::stderr);

    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}

pub fn build_subscriber<W>(
    json: bool,
    env_filter: EnvFilter,
    make_writer: W,
) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + Clone + 'static,
{
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(RequestIdStorageLayer);
    let format = FmtFormat::default().with_target(true).with_level(true);

    if json {
        Box::new(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .event_format(RequestIdEventFormat::new(format.json()))
                    .with_writer(make_writer),
            ),
        )
    } else {
        Box::new(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .event_format(RequestIdEventFormat::new(format))
                    .with_writer(make_writer),
            ),
        )
    }
}

/// Remembers the `request_id` field of each new span.
struct RequestIdStorageLayer;

#[derive(Clone)]
struct SpanRequestId(String);

#[derive(Default)]
struct RequestIdVisitor {
    request_id: Option<String>,
}

impl Visit for RequestIdVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "request_id" {
            self.request_id = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "request_id" && self.request_id.is_none() {
            let rendered = format!("{value:?}");
            self.request_id = Some(rendered.trim_matches('"').to_string());
        }
    }
}

impl<S> Layer<S> for RequestIdStorageLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::Id,
        ctx: LayerContext<'_, S>,
    ) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = RequestIdVisitor::default();
        attrs.record(&mut visitor);
        if let Some(request_id) = visitor.request_id {
            span.extensions_mut().insert(SpanRequestId(request_id));
        }
    }
}

/// Prefixes events inside a request span with `[request_id=...]`.
struct RequestIdEventFormat<E> {
    inner: E,
}

impl<E> RequestIdEventFormat<E> {
    fn new(inner: E) -> Self {
        Self { inner }
    }
}

impl<S, N, E> FormatEvent<S, N> for RequestIdEventFormat<E>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    N: for<'writer> FormatFields<'writer> + 'static,
    E: FormatEvent<S, N>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: FmtWriter<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let request_id = ctx.lookup_current().and_then(|span| {
            span.scope()
                .find_map(|span| span.extensions().get::<SpanRequestId>().cloned())
        });
        if let Some(SpanRequestId(request_id)) = request_id {
            write!(writer, "[request_id={request_id}] ")?;
        }
        self.inner.format_event(ctx, writer, event)
    }
}

fn route_of<B>(request: &axum::http::Request<B>) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string())
}

#[derive(Clone, Default)]
pub struct HttpSpanMaker;

impl<B> tower_http::trace::MakeSpan<B> for HttpSpanMaker
where
    B: HttpBody + Send + 'static,
    B::Data: Send,
{
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = request
            .extensions()
            .get::<RequestId>()
            .and_then(|rid| rid.header_value().to_str().ok())
            .unwrap_or("unknown")
            .to_owned();

        tracing::info_span!(
            "http.request",
            method = %request.method(),
            route = %route_of(request),
            request_id = %request_id,
            status_code = tracing::field::Empty,
            latency_ms = tracing::field::Empty
        )
    }
}

#[derive(Clone, Default)]
pub struct HttpOnResponse;

impl<B> tower_http::trace::OnResponse<B> for HttpOnResponse
where
    B: HttpBody + Send + 'static,
    B::Data: Send,
{
    fn on_response(
        self,
        response: &axum::http::Response<B>,
        latency: Duration,
        span: &tracing::Span,
    ) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let status = response.status().as_u16();

        span.record("status_code", tracing::field::display(status));
        span.record("latency_ms", tracing::field::display(latency_ms));

        tracing::debug!(parent: span, status, latency_ms, "request completed");
    }
}

/// Records request counts and latency per matched route.
#[cfg(feature = "metrics")]
#[derive(Clone)]
pub struct MetricsRecorderLayer {
    metrics: Option<Arc<MetricsContext>>,
}

#[cfg(feature = "metrics")]
impl MetricsRecorderLayer {
    pub fn new(metrics: Option<Arc<MetricsContext>>) -> Self {
        Self { metrics }
    }
}

#[cfg(feature = "metrics")]
impl<S> tower::Layer<S> for MetricsRecorderLayer {
    type Service = MetricsRecorderService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsRecorderService {
            inner,
            metrics: self.metrics.clone(),
        }
    }
}

#[cfg(feature = "metrics")]
#[derive(Clone)]
pub struct MetricsRecorderService<S> {
    inner: S,
    metrics: Option<Arc<MetricsContext>>,
}

#[cfg(feature = "metrics")]
impl<S, B> tower::Service<axum::http::Request<B>> for MetricsRecorderService<S>
where
    S: tower::Service<axum::http::Request<B>, Response = axum::response::Response>,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: axum::http::Request<B>) -> Self::Future {
        let metrics = self.metrics.clone();
        let route = route_of(&request);
        let start = Instant::now();
        let future = self.inner.call(request);

        Box::pin(async move {
            let response = future.await?;
            if let Some(metrics) = metrics {
                metrics.observe_http(&route, response.status().as_u16(), start.elapsed());
            }
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::HeaderValue, http::Request};
    use serial_test::serial;
    use std::{
        io::Write,
        sync::{Arc, Mutex},
    };
    use tower_http::trace::MakeSpan;
    use tracing::info;

    #[derive(Clone, Default)]
    struct CaptureWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl CaptureWriter {
        fn contents(&self) -> String {
            let data = self.buffer.lock().expect("lock");
            String::from_utf8_lossy(&data).to_string()
        }
    }

    struct CaptureHandle {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl<'a> MakeWriter<'a> for CaptureWriter {
        type Writer = CaptureHandle;

        fn make_writer(&'a self) -> Self::Writer {
            CaptureHandle {
                buffer: self.buffer.clone(),
            }
        }
    }

    impl Write for CaptureHandle {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.buffer.lock().expect("lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn subscriber_emits_json_and_compact() {
        let json_writer = CaptureWriter::default();
        let subscriber = build_subscriber(true, EnvFilter::new("info"), json_writer.clone());
        tracing::subscriber::with_default(subscriber, || {
            info!(message = "json-output");
        });
        assert!(json_writer.contents().contains("\"message\":\"json-output\""));

        let compact_writer = CaptureWriter::default();
        let subscriber = build_subscriber(false, EnvFilter::new("info"), compact_writer.clone());
        tracing::subscriber::with_default(subscriber, || {
            info!("compact-output");
        });
        let output = compact_writer.contents();
        assert!(output.contains("compact-output"));
        assert!(!output.contains("\"compact-output\""));
    }

    #[test]
    fn events_inside_request_spans_carry_the_request_id() {
        let writer = CaptureWriter::default();
        let subscriber = build_subscriber(false, EnvFilter::new("debug"), writer.clone());
        tracing::subscriber::with_default(subscriber, || {
            let header = HeaderValue::from_static("req-42");
            let mut request = Request::builder()
                .uri("/api/v1/chats")
                .body(Body::empty())
                .unwrap();
            request.extensions_mut().insert(RequestId::new(header));
            let span = HttpSpanMaker.make_span(&request);
            let _entered = span.enter();
            info!("chat created");
        });
        assert!(writer.contents().contains("[request_id=req-42] "));
    }

    #[test]
    #[serial]
    fn init_tracing_tolerates_multiple_invocations() {
        let mut config = ServerConfig::default();
        init_tracing(&config);
        config.log_format = LogFormat::Json;
        init_tracing(&config);
    }
}
