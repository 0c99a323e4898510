use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
    histogram_opts, opts,
};

use crate::error::{Result, WardenError};

/// Prometheus registry and collectors for the Warden DNS proxy.
pub struct Metrics {
    registry: Registry,

    // Query pipeline
    pub queries_total: IntCounterVec,
    pub responses_total: IntCounterVec,
    pub query_duration: HistogramVec,
    pub resolve_errors: IntCounter,
    pub malformed_packets: IntCounterVec,
    pub truncated_responses: IntCounter,

    // Cache
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub cache_evictions: IntCounter,
    pub cache_entries: IntGauge,
    pub prefetches: IntCounter,
    pub prefetch_domains: IntGauge,

    // Blocking
    pub blocked_queries: IntCounter,
    pub denylist_entries: IntGauge,

    // Upstream
    pub upstream_requests: IntCounterVec,
    pub upstream_duration: HistogramVec,

    // Query log backpressure
    pub query_log_dropped: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let queries_total = IntCounterVec::new(
            opts!("warden_queries_total", "Queries received, by protocol and query type"),
            &["protocol", "query_type"],
        )
        .map_err(prom_err)?;
        let responses_total = IntCounterVec::new(
            opts!("warden_responses_total", "Responses sent, by response type and rcode"),
            &["response_type", "rcode"],
        )
        .map_err(prom_err)?;
        let query_duration = HistogramVec::new(
            histogram_opts!("warden_query_duration_seconds", "End-to-end query duration"),
            &["protocol"],
        )
        .map_err(prom_err)?;
        let resolve_errors = IntCounter::with_opts(opts!(
            "warden_resolve_errors_total",
            "Queries that failed inside the resolver chain"
        ))
        .map_err(prom_err)?;
        let malformed_packets = IntCounterVec::new(
            opts!("warden_malformed_packets_total", "Inbound packets that failed validation"),
            &["protocol", "reason"],
        )
        .map_err(prom_err)?;
        let truncated_responses = IntCounter::with_opts(opts!(
            "warden_truncated_responses_total",
            "UDP responses replaced by a truncated answer"
        ))
        .map_err(prom_err)?;

        let cache_hits = IntCounter::with_opts(opts!("warden_cache_hits_total", "Cache hits"))
            .map_err(prom_err)?;
        let cache_misses = IntCounter::with_opts(opts!("warden_cache_misses_total", "Cache misses"))
            .map_err(prom_err)?;
        let cache_evictions = IntCounter::with_opts(opts!(
            "warden_cache_evictions_total",
            "Entries evicted by the LRU bound"
        ))
        .map_err(prom_err)?;
        let cache_entries =
            IntGauge::with_opts(opts!("warden_cache_entries", "Current cache size")).map_err(prom_err)?;
        let prefetches = IntCounter::with_opts(opts!(
            "warden_cache_prefetches_total",
            "Cache entries refreshed by the prefetcher"
        ))
        .map_err(prom_err)?;
        let prefetch_domains = IntGauge::with_opts(opts!(
            "warden_cache_prefetch_domains",
            "Domains currently tracked for prefetching"
        ))
        .map_err(prom_err)?;

        let blocked_queries =
            IntCounter::with_opts(opts!("warden_blocked_queries_total", "Queries answered from a denylist"))
                .map_err(prom_err)?;
        let denylist_entries = IntGauge::with_opts(opts!(
            "warden_denylist_entries",
            "Compiled denylist patterns over all groups"
        ))
        .map_err(prom_err)?;

        let upstream_requests = IntCounterVec::new(
            opts!("warden_upstream_requests_total", "Upstream exchanges, by upstream and outcome"),
            &["upstream", "result"],
        )
        .map_err(prom_err)?;
        let upstream_duration = HistogramVec::new(
            histogram_opts!("warden_upstream_duration_seconds", "Upstream round-trip time"),
            &["upstream"],
        )
        .map_err(prom_err)?;

        let query_log_dropped = IntCounter::with_opts(opts!(
            "warden_query_log_dropped_total",
            "Query log entries dropped on buffer overflow"
        ))
        .map_err(prom_err)?;

        for collector in [
            Box::new(queries_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(responses_total.clone()),
            Box::new(query_duration.clone()),
            Box::new(resolve_errors.clone()),
            Box::new(malformed_packets.clone()),
            Box::new(truncated_responses.clone()),
            Box::new(cache_hits.clone()),
            Box::new(cache_misses.clone()),
            Box::new(cache_evictions.clone()),
            Box::new(cache_entries.clone()),
            Box::new(prefetches.clone()),
            Box::new(prefetch_domains.clone()),
            Box::new(blocked_queries.clone()),
            Box::new(denylist_entries.clone()),
            Box::new(upstream_requests.clone()),
            Box::new(upstream_duration.clone()),
            Box::new(query_log_dropped.clone()),
        ] {
            registry.register(collector).map_err(prom_err)?;
        }

        Ok(Self {
            registry,
            queries_total,
            responses_total,
            query_duration,
            resolve_errors,
            malformed_packets,
            truncated_responses,
            cache_hits,
            cache_misses,
            cache_evictions,
            cache_entries,
            prefetches,
            prefetch_domains,
            blocked_queries,
            denylist_entries,
            upstream_requests,
            upstream_duration,
            query_log_dropped,
        })
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buf)
            .map_err(prom_err)?;
        String::from_utf8(buf).map_err(|e| WardenError::Cache(e.to_string()))
    }
}

fn prom_err(err: prometheus::Error) -> WardenError {
    WardenError::Startup(format!("metrics registration failed: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_export() {
        let metrics = Metrics::new().unwrap();
        metrics.queries_total.with_label_values(&["udp", "A"]).inc();
        metrics.cache_hits.inc();
        let out = metrics.export().unwrap();
        assert!(out.contains("warden_queries_total"));
        assert!(out.contains("warden_cache_hits_total 1"));
    }
}
