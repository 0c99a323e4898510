use async_trait::async_trait;
use tracing::debug;

use super::{NextResolver, Resolver};
use crate::config::FilteringConfig;
use crate::dns::DnsMessage;
use crate::dns::enums::RecordType;
use crate::error::{Result, WardenError};
use crate::model::{Request, Response, ResponseType};

/// Drops queries whose type is listed in `filtering.queryTypes`, answering
/// with an empty NOERROR so the client always receives a valid message.
pub struct FilteringResolver {
    query_types: Vec<RecordType>,
    next: NextResolver,
}

impl FilteringResolver {
    pub fn new(config: &FilteringConfig, next: NextResolver) -> Result<Self> {
        let query_types = config
            .query_types
            .iter()
            .map(|s| s.parse::<RecordType>().map_err(WardenError::Config))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { query_types, next })
    }
}

#[async_trait]
impl Resolver for FilteringResolver {
    fn name(&self) -> &'static str {
        "filtering"
    }

    async fn resolve(&self, request: &mut Request) -> Result<Response> {
        request.ensure_active()?;
        if let Some(question) = request.message.question() {
            if self.query_types.contains(&question.qtype) {
                debug!("filtering {} query for {}", question.qtype, question.name);
                let response = DnsMessage::response_for(&request.message);
                return Ok(Response::new(
                    response,
                    ResponseType::Filtered,
                    format!("query type {} filtered", question.qtype),
                ));
            }
        }
        self.next.resolve(request).await
    }
}
