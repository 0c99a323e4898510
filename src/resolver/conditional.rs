use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::upstream_group::UpstreamGroups;
use super::{NextResolver, Resolver};
use crate::config::ConditionalConfig;
use crate::error::{Result, WardenError};
use crate::model::{Request, Response, ResponseType};

/// Routes questions whose name matches a configured suffix to a specific
/// upstream group. Longest suffix wins; a mapping for `.` catches
/// single-label names.
pub struct ConditionalResolver {
    /// (suffix without leading dot, group), longest suffix first.
    mapping: Vec<(String, String)>,
    catch_all_group: Option<String>,
    groups: Arc<UpstreamGroups>,
    next: NextResolver,
}

impl ConditionalResolver {
    pub fn new(config: &ConditionalConfig, groups: Arc<UpstreamGroups>, next: NextResolver) -> Self {
        let mut mapping: Vec<(String, String)> = Vec::new();
        let mut catch_all_group = None;
        for (suffix, group) in &config.mapping {
            if suffix == "." {
                catch_all_group = Some(group.clone());
            } else {
                mapping.push((suffix.trim_matches('.').to_lowercase(), group.clone()));
            }
        }
        // Longest suffix (by label count, then length) first.
        mapping.sort_by(|a, b| {
            let labels = |s: &str| s.split('.').count();
            labels(&b.0).cmp(&labels(&a.0)).then(b.0.len().cmp(&a.0.len()))
        });
        Self { mapping, catch_all_group, groups, next }
    }

    fn group_for(&self, qname: &str) -> Option<&str> {
        if !qname.contains('.') {
            return self.catch_all_group.as_deref();
        }
        for (suffix, group) in &self.mapping {
            if qname == suffix || qname.ends_with(&format!(".{}", suffix)) {
                return Some(group);
            }
        }
        None
    }
}

#[async_trait]
impl Resolver for ConditionalResolver {
    fn name(&self) -> &'static str {
        "conditional"
    }

    async fn resolve(&self, request: &mut Request) -> Result<Response> {
        request.ensure_active()?;
        let qname = request.question_name().to_lowercase();
        let Some(group_name) = self.group_for(&qname) else {
            return self.next.resolve(request).await;
        };
        debug!("conditional forwarding {} to group {}", qname, group_name);
        let group = self.groups.get(group_name).ok_or_else(|| {
            WardenError::Upstream(group_name.to_string(), "conditional group missing".into())
        })?;
        let message = group.dispatch(&request.message, &request.cancel).await?;
        Ok(Response::new(
            message,
            ResponseType::Conditional,
            format!("conditional forward to {}", group_name),
        ))
    }
}
