use std::sync::Arc;

use async_trait::async_trait;

use super::{NextResolver, Resolver};
use crate::error::{Result, WardenError};
use crate::metrics::Metrics;
use crate::model::{Request, Response};

/// Observe-only chain link recording query counters and durations.
pub struct MetricsTeeResolver {
    metrics: Arc<Metrics>,
    next: NextResolver,
}

impl MetricsTeeResolver {
    pub fn new(metrics: Arc<Metrics>, next: NextResolver) -> Self {
        Self { metrics, next }
    }
}

#[async_trait]
impl Resolver for MetricsTeeResolver {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn resolve(&self, request: &mut Request) -> Result<Response> {
        request.ensure_active()?;
        let protocol = request.protocol.to_string();
        let query_type = request
            .message
            .question()
            .map(|q| q.qtype.to_string())
            .unwrap_or_default();
        self.metrics
            .queries_total
            .with_label_values(&[&protocol, &query_type])
            .inc();

        let outcome = self.next.resolve(request).await;

        match &outcome {
            Ok(response) => {
                self.metrics
                    .responses_total
                    .with_label_values(&[
                        &response.response_type.to_string(),
                        &response.message.rcode().to_string(),
                    ])
                    .inc();
            }
            Err(WardenError::Cancelled) => {}
            Err(_) => self.metrics.resolve_errors.inc(),
        }
        self.metrics
            .query_duration
            .with_label_values(&[&protocol])
            .observe(request.received_at.elapsed().as_secs_f64());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::enums::RecordType;
    use crate::resolver::test_support::{StaticResolver, request_for};

    #[tokio::test]
    async fn counts_queries_and_responses() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let resolver =
            MetricsTeeResolver::new(metrics.clone(), StaticResolver::resolved("1.2.3.4").arc());
        let mut request = request_for("example.com", RecordType::A);
        resolver.resolve(&mut request).await.unwrap();
        let exported = metrics.export().unwrap();
        assert!(exported.contains("warden_queries_total{protocol=\"udp\",query_type=\"A\"} 1"));
        assert!(exported.contains("response_type=\"RESOLVED\""));
    }

    #[tokio::test]
    async fn counts_errors() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let resolver = MetricsTeeResolver::new(metrics.clone(), StaticResolver::failing().arc());
        let mut request = request_for("example.com", RecordType::A);
        resolver.resolve(&mut request).await.unwrap_err();
        assert!(metrics.export().unwrap().contains("warden_resolve_errors_total 1"));
    }
}
