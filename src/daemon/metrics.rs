//! Request counts and latency percentiles

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Latency samples kept per key; the oldest half goes when full
pub const MAX_SAMPLES: usize = 1000;

#[derive(Default)]
struct Samples {
    counts: HashMap<String, u64>,
    latencies: HashMap<String, Vec<Duration>>,
}

/// Per-route request metrics keyed by `METHOD path`
#[derive(Default)]
pub struct Metrics {
    inner: Mutex<Samples>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencyStats {
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
}

/// Point-in-time report for `/internal/v1/metrics`
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub requests: HashMap<String, u64>,
    #[serde(rename = "latency_ms")]
    pub latency: HashMap<String, LatencyStats>,
    pub tasks: usize,
    pub uptime_seconds: u64,
    pub containers: usize,
    pub active_resources: usize,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, method: &str, path: &str, elapsed: Duration) {
        let key = format!("{} {}", method, path);
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        *inner.counts.entry(key.clone()).or_default() += 1;
        let samples = inner.latencies.entry(key).or_default();
        if samples.len() >= MAX_SAMPLES {
            samples.drain(..MAX_SAMPLES / 2);
        }
        samples.push(elapsed);
    }

    /// Counts and percentiles; the caller fills in the backend gauges
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let latency = inner
            .latencies
            .iter()
            .filter(|(_, s)| !s.is_empty())
            .map(|(key, samples)| {
                let mut sorted = samples.clone();
                sorted.sort();
                let at = |pct: usize| sorted[sorted.len() * pct / 100].as_millis() as u64;
                (
                    key.clone(),
                    LatencyStats {
                        p50: at(50),
                        p95: at(95),
                        p99: at(99),
                    },
                )
            })
            .collect();
        MetricsSnapshot {
            requests: inner.counts.clone(),
            latency,
            tasks: tokio::runtime::Handle::try_current()
                .map(|h| h.metrics().num_alive_tasks())
                .unwrap_or_default(),
            ..Default::default()
        }
    }

    #[cfg(test)]
    fn sample_count(&self, key: &str) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .latencies
            .get(key)
            .map_or(0, Vec::len)
    }
}

/// Middleware recording every request
pub async fn track(State(metrics): State<Arc<Metrics>>, req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let resp = next.run(req).await;
    metrics.record(&method, &path, start.elapsed());
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_key() {
        let m = Metrics::new();
        m.record("GET", "/test", Duration::from_millis(1));
        m.record("GET", "/test", Duration::from_millis(3));
        m.record("POST", "/other", Duration::from_millis(2));
        let snap = m.snapshot();
        assert_eq!(snap.requests["GET /test"], 2);
        assert_eq!(snap.requests["POST /other"], 1);
        assert_eq!(snap.latency["POST /other"].p50, 2);
    }

    #[test]
    fn test_percentiles() {
        let m = Metrics::new();
        for ms in 1..=100 {
            m.record("GET", "/p", Duration::from_millis(ms));
        }
        let stats = m.snapshot().latency["GET /p"];
        assert_eq!(stats, LatencyStats { p50: 51, p95: 96, p99: 100 });
    }

    #[test]
    fn test_ring_drops_oldest_half() {
        let m = Metrics::new();
        for _ in 0..MAX_SAMPLES {
            m.record("GET", "/r", Duration::from_millis(1));
        }
        assert_eq!(m.sample_count("GET /r"), MAX_SAMPLES);
        m.record("GET", "/r", Duration::from_millis(1));
        assert_eq!(m.sample_count("GET /r"), MAX_SAMPLES / 2 + 1);
        assert_eq!(m.snapshot().requests["GET /r"], MAX_SAMPLES as u64 + 1);
    }
}
