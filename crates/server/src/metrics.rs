#![cfg(feature = "metrics")]

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct MetricsContext {
    registry: Registry,
    pub http_requests_total: IntCounterVec,
    pub http_request_duration: HistogramVec,
    pub upstream_channels: IntGauge,
}

impl MetricsContext {
    pub fn init() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let counter = IntCounterVec::new(
            Opts::new(
                "harmony_http_requests_total",
                "Number of HTTP responses served, labeled by route and status",
            ),
            &["route", "status"],
        )?;
        registry.register(Box::new(counter.clone()))?;

        let duration = HistogramVec::new(
            HistogramOpts::new(
                "harmony_http_request_duration_seconds",
                "HTTP request latency in seconds, labeled by route and status",
            ),
            &["route", "status"],
        )?;
        registry.register(Box::new(duration.clone()))?;

        let upstream = IntGauge::new(
            "harmony_fanout_upstream_channels",
            "Chat channels this process holds a bus subscription for",
        )?;
        registry.register(Box::new(upstream.clone()))?;

        Ok(Arc::new(Self {
            registry,
            http_requests_total: counter,
            http_request_duration: duration,
            upstream_channels: upstream,
        }))
    }

    pub fn observe_http(&self, route: &str, status: u16, elapsed: Duration) {
        let status = status.to_string();
        let labels = [route, status.as_str()];
        self.http_requests_total.with_label_values(&labels).inc();
        self.http_request_duration
            .with_label_values(&labels)
            .observe(elapsed.as_secs_f64());
    }

    pub fn set_upstream_channels(&self, count: usize) {
        self.upstream_channels.set(count as i64);
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}
