//! Connection metrics.
//!
//! Every component receives the sink explicitly as an `Arc<dyn MetricsSink>`;
//! implementations must tolerate concurrent calls from any number of
//! connection tasks.

use prometheus::core::Collector;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub trait MetricsSink: Send + Sync {
    fn inbound_opened(&self);
    fn inbound_closed(&self, open_for: Duration);
    fn inbound_bytes_in(&self, n: usize);
    fn inbound_bytes_out(&self, n: usize);
    fn sni_parsed(&self, label: &str, took: Duration);
    fn outbound_opened(&self, dst: &str, sni: &str);
    fn outbound_closed(&self, dst: &str, sni: &str, open_for: Duration);
    fn outbound_bytes_in(&self, dst: &str, sni: &str, n: usize);
    fn outbound_bytes_out(&self, dst: &str, sni: &str, n: usize);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn inbound_opened(&self) {}
    fn inbound_closed(&self, _open_for: Duration) {}
    fn inbound_bytes_in(&self, _n: usize) {}
    fn inbound_bytes_out(&self, _n: usize) {}
    fn sni_parsed(&self, _label: &str, _took: Duration) {}
    fn outbound_opened(&self, _dst: &str, _sni: &str) {}
    fn outbound_closed(&self, _dst: &str, _sni: &str, _open_for: Duration) {}
    fn outbound_bytes_in(&self, _dst: &str, _sni: &str, _n: usize) {}
    fn outbound_bytes_out(&self, _dst: &str, _sni: &str, _n: usize) {}
}

const TIME_BUCKETS: [f64; 21] = [
    0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 20.0, 25.0, 30.0, 40.0, 60.0, 100.0, 200.0, 300.0,
    500.0, 1000.0, 2000.0, 4000.0, 8000.0, 16000.0,
];

const OUTBOUND_LABELS: &[&str] = &["dst", "sni"];

/// Distinct `sni` label values kept before new names collapse into
/// [`OVERFLOW_SNI_LABEL`].
pub const MAX_SNI_LABELS: usize = 1000;

pub const OVERFLOW_SNI_LABEL: &str = "other";

// Never subject to the cap
const FIXED_SNI_LABELS: &[&str] = &["non-tls", "no-sni", "error"];

/// Bounded set of SNI label values. Client-chosen names would otherwise
/// grow every labelled family without limit.
#[derive(Debug)]
struct SniLabels {
    seen: Mutex<HashSet<String>>,
    limit: usize,
}

impl SniLabels {
    fn new(limit: usize) -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
            limit,
        }
    }

    /// A name keeps its own label for good once admitted, so gauges are
    /// always decremented under the label they were incremented with.
    fn label<'a>(&self, sni: &'a str) -> &'a str {
        if FIXED_SNI_LABELS.contains(&sni) {
            return sni;
        }
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        if seen.contains(sni) {
            return sni;
        }
        if seen.len() < self.limit {
            seen.insert(sni.to_string());
            return sni;
        }
        OVERFLOW_SNI_LABEL
    }
}

/// Prometheus-backed sink, exported by the metrics endpoint.
#[derive(Clone)]
pub struct PrometheusMetrics {
    inbound_total: IntCounter,
    inbound_open: IntGauge,
    inbound_bytes_in: IntCounter,
    inbound_bytes_out: IntCounter,
    inbound_time: Histogram,
    sni_parsed_total: IntCounterVec,
    sni_parse_time: HistogramVec,
    outbound_total: IntCounterVec,
    outbound_open: IntGaugeVec,
    outbound_bytes_in: IntCounterVec,
    outbound_bytes_out: IntCounterVec,
    outbound_time: HistogramVec,
    sni_labels: Arc<SniLabels>,
}

fn register<C>(registry: &Registry, collector: C) -> prometheus::Result<C>
where
    C: Collector + Clone + 'static,
{
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

fn histogram_opts(name: &str, help: &str) -> HistogramOpts {
    HistogramOpts::new(name, help).buckets(TIME_BUCKETS.to_vec())
}

impl PrometheusMetrics {
    /// Creates all collectors and registers them on `registry`.
    ///
    /// Fails if any of them is already registered there.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Self::with_sni_label_limit(registry, MAX_SNI_LABELS)
    }

    /// Like [`new`](Self::new), keeping at most `limit` distinct SNI labels.
    pub fn with_sni_label_limit(registry: &Registry, limit: usize) -> prometheus::Result<Self> {
        Ok(Self {
            inbound_total: register(
                registry,
                IntCounter::new(
                    "sni_router_inbound_connections_total",
                    "The total number of inbound connections",
                )?,
            )?,
            inbound_open: register(
                registry,
                IntGauge::new(
                    "sni_router_inbound_connections_open",
                    "Number of open inbound connections",
                )?,
            )?,
            inbound_bytes_in: register(
                registry,
                IntCounter::new(
                    "sni_router_inbound_connections_bytes_in_total",
                    "Total number of bytes received from inbound connections",
                )?,
            )?,
            inbound_bytes_out: register(
                registry,
                IntCounter::new(
                    "sni_router_inbound_connections_bytes_out_total",
                    "Total number of bytes sent to inbound connections",
                )?,
            )?,
            inbound_time: register(
                registry,
                Histogram::with_opts(histogram_opts(
                    "sni_router_inbound_connections_time_seconds",
                    "Histogram of time inbound connections are open in seconds",
                ))?,
            )?,
            sni_parsed_total: register(
                registry,
                IntCounterVec::new(
                    Opts::new(
                        "sni_router_sni_parsed_total",
                        "Total number of snis parsed successfully or with error",
                    ),
                    &["sni"],
                )?,
            )?,
            sni_parse_time: register(
                registry,
                HistogramVec::new(
                    histogram_opts(
                        "sni_router_sni_parsed_time_seconds",
                        "Histogram of time to parse the sni in seconds",
                    ),
                    &["sni"],
                )?,
            )?,
            outbound_total: register(
                registry,
                IntCounterVec::new(
                    Opts::new(
                        "sni_router_outbound_connections_total",
                        "Total number of outbound connections",
                    ),
                    OUTBOUND_LABELS,
                )?,
            )?,
            outbound_open: register(
                registry,
                IntGaugeVec::new(
                    Opts::new(
                        "sni_router_outbound_connections_open",
                        "Number of open outbound connections",
                    ),
                    OUTBOUND_LABELS,
                )?,
            )?,
            outbound_bytes_in: register(
                registry,
                IntCounterVec::new(
                    Opts::new(
                        "sni_router_outbound_connections_bytes_in_total",
                        "Total number of bytes received from outbound connections",
                    ),
                    OUTBOUND_LABELS,
                )?,
            )?,
            outbound_bytes_out: register(
                registry,
                IntCounterVec::new(
                    Opts::new(
                        "sni_router_outbound_connections_bytes_out_total",
                        "Total number of bytes sent to outbound connections",
                    ),
                    OUTBOUND_LABELS,
                )?,
            )?,
            outbound_time: register(
                registry,
                HistogramVec::new(
                    histogram_opts(
                        "sni_router_outbound_connections_time_seconds",
                        "Histogram of time outbound connections are open in seconds",
                    ),
                    OUTBOUND_LABELS,
                )?,
            )?,
            sni_labels: Arc::new(SniLabels::new(limit)),
        })
    }
}

impl MetricsSink for PrometheusMetrics {
    fn inbound_opened(&self) {
        self.inbound_total.inc();
        self.inbound_open.inc();
    }

    fn inbound_closed(&self, open_for: Duration) {
        self.inbound_open.dec();
        self.inbound_time.observe(open_for.as_secs_f64());
    }

    fn inbound_bytes_in(&self, n: usize) {
        self.inbound_bytes_in.inc_by(n as u64);
    }

    fn inbound_bytes_out(&self, n: usize) {
        self.inbound_bytes_out.inc_by(n as u64);
    }

    fn sni_parsed(&self, label: &str, took: Duration) {
        let label = self.sni_labels.label(label);
        self.sni_parsed_total.with_label_values(&[label]).inc();
        self.sni_parse_time
            .with_label_values(&[label])
            .observe(took.as_secs_f64());
    }

    fn outbound_opened(&self, dst: &str, sni: &str) {
        let sni = self.sni_labels.label(sni);
        self.outbound_total.with_label_values(&[dst, sni]).inc();
        self.outbound_open.with_label_values(&[dst, sni]).inc();
    }

    fn outbound_closed(&self, dst: &str, sni: &str, open_for: Duration) {
        let sni = self.sni_labels.label(sni);
        self.outbound_open.with_label_values(&[dst, sni]).dec();
        self.outbound_time
            .with_label_values(&[dst, sni])
            .observe(open_for.as_secs_f64());
    }

    fn outbound_bytes_in(&self, dst: &str, sni: &str, n: usize) {
        let sni = self.sni_labels.label(sni);
        self.outbound_bytes_in
            .with_label_values(&[dst, sni])
            .inc_by(n as u64);
    }

    fn outbound_bytes_out(&self, dst: &str, sni: &str, n: usize) {
        let sni = self.sni_labels.label(sni);
        self.outbound_bytes_out
            .with_label_values(&[dst, sni])
            .inc_by(n as u64);
    }
}
