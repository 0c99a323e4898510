use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{NextResolver, Resolver};
use crate::config::QueryLogConfig;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::model::{Request, Response};

/// One observed query outcome.
#[derive(Clone, Debug)]
pub struct QueryLogEntry {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub client_names: String,
    pub question: String,
    pub query_type: String,
    pub response_type: String,
    pub rcode: String,
    pub duration_ms: u128,
}

/// Bounded in-memory buffer between the hot path and the background writer.
/// On overflow the oldest entry is dropped and a counter incremented.
pub struct QueryLogSink {
    buffer: Mutex<VecDeque<QueryLogEntry>>,
    capacity: usize,
    metrics: Arc<Metrics>,
}

impl QueryLogSink {
    pub fn new(config: &QueryLogConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(config.buffer_size.max(1))),
            capacity: config.buffer_size.max(1),
            metrics,
        }
    }

    pub fn push(&self, entry: QueryLogEntry) {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.capacity {
            buffer.pop_front();
            self.metrics.query_log_dropped.inc();
        }
        buffer.push_back(entry);
    }

    pub fn drain(&self) -> Vec<QueryLogEntry> {
        self.buffer.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    /// Flush the buffer to the log sink every `flush_interval` until
    /// cancelled; a final flush runs on shutdown.
    pub fn spawn_writer(self: Arc<Self>, flush_interval: Duration, cancel: CancellationToken) {
        let sink = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval.max(Duration::from_millis(100)));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        sink.flush();
                        debug!("query log writer stopping");
                        break;
                    }
                    _ = ticker.tick() => sink.flush(),
                }
            }
        });
    }

    fn flush(&self) {
        for entry in self.drain() {
            info!(
                target: "warden::query_log",
                "{} client={}({}) {} {} -> {} {} {}ms",
                entry.timestamp.to_rfc3339(),
                entry.client_ip,
                entry.client_names,
                entry.question,
                entry.query_type,
                entry.response_type,
                entry.rcode,
                entry.duration_ms,
            );
        }
    }
}

/// Observe-only chain link: calls the rest of the chain, records the
/// outcome (including failures), and passes the response through untouched.
pub struct QueryLogResolver {
    sink: Arc<QueryLogSink>,
    next: NextResolver,
}

impl QueryLogResolver {
    pub fn new(sink: Arc<QueryLogSink>, next: NextResolver) -> Self {
        Self { sink, next }
    }

    fn entry_for(&self, request: &Request, outcome: &Result<Response>) -> QueryLogEntry {
        let (response_type, rcode) = match outcome {
            Ok(response) => (response.response_type.to_string(), response.message.rcode().to_string()),
            Err(e) => ("ERROR".to_string(), e.to_string()),
        };
        let question = request.message.question();
        QueryLogEntry {
            timestamp: Utc::now(),
            client_ip: request.client_ip.to_string(),
            client_names: request.client_names.join(","),
            question: question.map(|q| q.name.clone()).unwrap_or_default(),
            query_type: question.map(|q| q.qtype.to_string()).unwrap_or_default(),
            response_type,
            rcode,
            duration_ms: request.received_at.elapsed().as_millis(),
        }
    }
}

#[async_trait]
impl Resolver for QueryLogResolver {
    fn name(&self) -> &'static str {
        "query_log"
    }

    async fn resolve(&self, request: &mut Request) -> Result<Response> {
        request.ensure_active()?;
        let outcome = self.next.resolve(request).await;
        // A cancelled request must leave no trace in the log.
        if !matches!(outcome, Err(crate::error::WardenError::Cancelled)) {
            self.sink.push(self.entry_for(request, &outcome));
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::enums::RecordType;
    use crate::resolver::test_support::{StaticResolver, request_for};

    fn sink() -> Arc<QueryLogSink> {
        Arc::new(QueryLogSink::new(
            &QueryLogConfig { buffer_size: 3, ..QueryLogConfig::default() },
            Arc::new(Metrics::new().unwrap()),
        ))
    }

    #[tokio::test]
    async fn records_success_and_failure() {
        let sink = sink();
        let ok = QueryLogResolver::new(sink.clone(), StaticResolver::resolved("1.2.3.4").arc());
        let failing = QueryLogResolver::new(sink.clone(), StaticResolver::failing().arc());

        let mut request = request_for("example.com", RecordType::A);
        ok.resolve(&mut request).await.unwrap();
        let mut request = request_for("example.com", RecordType::A);
        failing.resolve(&mut request).await.unwrap_err();

        let entries = sink.drain();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].response_type, "RESOLVED");
        assert_eq!(entries[1].response_type, "ERROR");
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let sink = sink();
        for i in 0..5 {
            sink.push(QueryLogEntry {
                timestamp: Utc::now(),
                client_ip: "127.0.0.1".into(),
                client_names: String::new(),
                question: format!("q{}.example.com", i),
                query_type: "A".into(),
                response_type: "RESOLVED".into(),
                rcode: "NOERROR".into(),
                duration_ms: 1,
            });
        }
        let entries = sink.drain();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].question, "q2.example.com");
    }
}
