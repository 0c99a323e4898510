use async_trait::async_trait;
use tracing::debug;

use super::{NextResolver, Resolver};
use crate::config::RewriterConfig;
use crate::dns::enums::Rcode;
use crate::error::Result;
use crate::model::{Request, Response};

/// Rewrites the tail of the question name (`home` → `lan`) before handing
/// the request to the wrapped remainder of the chain, and maps the names in
/// the returned answer back. With `fallbackUpstream` an NXDOMAIN for the
/// rewritten name triggers a second pass with the original name.
pub struct RewriterResolver {
    /// (from, to), both lowercase without leading dot.
    rules: Vec<(String, String)>,
    fallback_upstream: bool,
    next: NextResolver,
}

impl RewriterResolver {
    pub fn new(config: &RewriterConfig, next: NextResolver) -> Self {
        let rules = config
            .mapping
            .iter()
            .map(|(from, to)| {
                (
                    from.trim_start_matches('.').to_lowercase(),
                    to.trim_start_matches('.').to_lowercase(),
                )
            })
            .collect();
        Self { rules, fallback_upstream: config.fallback_upstream, next }
    }

    fn rewrite(&self, name: &str) -> Option<(String, String, String)> {
        let lower = name.to_lowercase();
        for (from, to) in &self.rules {
            if lower == *from {
                return Some((to.clone(), from.clone(), to.clone()));
            }
            if let Some(prefix) = lower.strip_suffix(&format!(".{}", from)) {
                return Some((format!("{}.{}", prefix, to), from.clone(), to.clone()));
            }
        }
        None
    }

    /// Swap `to` back to `from` on every name the upstream answered with.
    fn restore_names(response: &mut Response, original: &str, from: &str, to: &str) {
        for question in &mut response.message.questions {
            question.name = original.to_string();
        }
        let suffix = format!(".{}", to);
        for rr in response
            .message
            .answers
            .iter_mut()
            .chain(&mut response.message.authorities)
        {
            let lower = rr.name.to_lowercase();
            if lower == to {
                rr.name = from.to_string();
            } else if let Some(prefix) = lower.strip_suffix(&suffix) {
                rr.name = format!("{}.{}", prefix, from);
            }
        }
    }
}

#[async_trait]
impl Resolver for RewriterResolver {
    fn name(&self) -> &'static str {
        "rewriter"
    }

    async fn resolve(&self, request: &mut Request) -> Result<Response> {
        request.ensure_active()?;
        let original = request.question_name().to_string();
        let Some((rewritten, from, to)) = self.rewrite(&original) else {
            return self.next.resolve(request).await;
        };

        debug!("rewriting question {} -> {}", original, rewritten);
        if let Some(question) = request.message.questions.first_mut() {
            question.name = rewritten;
        }
        let outcome = self.next.resolve(request).await;

        // The request must leave this link with its original question.
        if let Some(question) = request.message.questions.first_mut() {
            question.name = original.clone();
        }

        match outcome {
            Ok(mut response) => {
                if response.message.rcode() == Rcode::NxDomain && self.fallback_upstream {
                    debug!("rewritten {} was NXDOMAIN, retrying with original name", original);
                    return self.next.resolve(request).await;
                }
                Self::restore_names(&mut response, &original, &from, &to);
                Ok(response)
            }
            Err(e) => Err(e),
        }
    }
}
