use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    result_rows: CounterVec,
    result_bytes: CounterVec,
    result_chunks_in: CounterVec,
    overflow_chunks: CounterVec,
    overflow_bytes: CounterVec,
    overflow_inflight_bytes: GaugeVec,
    overflow_status_requests: CounterVec,
    failures: CounterVec,
    truncations: CounterVec,
    final_responses: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn inc_chunks_in(&self, trace_id: &str) {
        self.inner
            .result_chunks_in
            .with_label_values(&[trace_id])
            .inc();
    }

    pub fn record_payload_rows(&self, trace_id: &str, rows: u64, bytes: u64) {
        self.inner
            .result_rows
            .with_label_values(&[trace_id])
            .inc_by(rows as f64);
        self.inner
            .result_bytes
            .with_label_values(&[trace_id])
            .inc_by(bytes as f64);
    }

    pub fn record_overflow_send(&self, trace_id: &str, envelope_bytes: u64, inflight_bytes: u64) {
        self.inner
            .overflow_chunks
            .with_label_values(&[trace_id])
            .inc();
        self.inner
            .overflow_bytes
            .with_label_values(&[trace_id])
            .inc_by(envelope_bytes as f64);
        self.set_overflow_inflight(trace_id, inflight_bytes);
    }

    pub fn set_overflow_inflight(&self, trace_id: &str, inflight_bytes: u64) {
        self.inner
            .overflow_inflight_bytes
            .with_label_values(&[trace_id])
            .set(inflight_bytes as f64);
    }

    pub fn inc_overflow_status_requests(&self, trace_id: &str) {
        self.inner
            .overflow_status_requests
            .with_label_values(&[trace_id])
            .inc();
    }

    pub fn inc_failures(&self, trace_id: &str, code: &str) {
        self.inner
            .failures
            .with_label_values(&[trace_id, code])
            .inc();
    }

    pub fn inc_truncations(&self, trace_id: &str, reason: &str) {
        self.inner
            .truncations
            .with_label_values(&[trace_id, reason])
            .inc();
    }

    pub fn inc_final_responses(&self, trace_id: &str) {
        self.inner
            .final_responses
            .with_label_values(&[trace_id])
            .inc();
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let result_rows = counter_vec(
            &registry,
            "dqr_result_rows_total",
            "Rows appended to the in-memory result payload",
            &["trace_id"],
        );
        let result_bytes = counter_vec(
            &registry,
            "dqr_result_bytes_total",
            "Serialized row bytes appended to the in-memory result payload",
            &["trace_id"],
        );
        let result_chunks_in = counter_vec(
            &registry,
            "dqr_result_chunks_in_total",
            "Chunks received from upstream tasks",
            &["trace_id"],
        );

        let overflow_chunks = counter_vec(
            &registry,
            "dqr_overflow_chunks_total",
            "Chunks sent to the overflow sink",
            &["trace_id"],
        );
        let overflow_bytes = counter_vec(
            &registry,
            "dqr_overflow_bytes_total",
            "Envelope bytes sent to the overflow sink",
            &["trace_id"],
        );
        let overflow_inflight_bytes = gauge_vec(
            &registry,
            "dqr_overflow_inflight_bytes",
            "Overflow bytes sent but not yet acknowledged",
            &["trace_id"],
        );
        let overflow_status_requests = counter_vec(
            &registry,
            "dqr_overflow_status_requests_total",
            "Credit refresh requests sent to the overflow sink",
            &["trace_id"],
        );

        let failures = counter_vec(
            &registry,
            "dqr_failures_total",
            "Failure notifications by issue code",
            &["trace_id", "code"],
        );
        let truncations = counter_vec(
            &registry,
            "dqr_truncations_total",
            "Result truncations by limit",
            &["trace_id", "reason"],
        );
        let final_responses = counter_vec(
            &registry,
            "dqr_final_responses_total",
            "Final responses sent to query owners",
            &["trace_id"],
        );

        Self {
            registry,
            result_rows,
            result_bytes,
            result_chunks_in,
            overflow_chunks,
            overflow_bytes,
            overflow_inflight_bytes,
            overflow_status_requests,
            failures,
            truncations,
            final_responses,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_prometheus_text() {
        let m = MetricsRegistry::new();
        m.record_payload_rows("q1", 10, 128);
        let text = m.render_prometheus();
        assert!(text.contains("dqr_result_rows_total"));
        assert!(text.contains("q1"));
    }

    #[test]
    fn renders_all_metric_families() {
        let m = MetricsRegistry::new();
        m.inc_chunks_in("q1");
        m.record_payload_rows("q1", 2, 80);
        m.record_overflow_send("q1", 53, 53);
        m.inc_overflow_status_requests("q1");
        m.inc_failures("q1", "6002");
        m.inc_truncations("q1", "bytes");
        m.inc_final_responses("q1");
        let text = m.render_prometheus();

        assert!(text.contains("dqr_result_chunks_in_total"));
        assert!(text.contains("dqr_result_rows_total"));
        assert!(text.contains("dqr_result_bytes_total"));

        assert!(text.contains("dqr_overflow_chunks_total"));
        assert!(text.contains("dqr_overflow_bytes_total"));
        assert!(text.contains("dqr_overflow_inflight_bytes"));
        assert!(text.contains("dqr_overflow_status_requests_total"));

        assert!(text.contains("dqr_failures_total"));
        assert!(text.contains("dqr_truncations_total"));
        assert!(text.contains("dqr_final_responses_total"));
    }
}
