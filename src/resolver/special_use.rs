use async_trait::async_trait;
use tracing::debug;

use super::{NextResolver, Resolver};
use crate::config::SpecialUseConfig;
use crate::dns::DnsMessage;
use crate::dns::enums::Rcode;
use crate::error::Result;
use crate::model::{Request, Response, ResponseType};

/// Special-use top level domains (RFC 6761/6762) that must never reach an
/// upstream. Answered with NXDOMAIN.
const SPECIAL_USE_SUFFIXES: &[&str] = &["test", "invalid", "localhost", "onion"];

/// RFC 6762 appendix G home-network names; opt-in because conditional
/// mappings commonly serve these zones.
const APPENDIX_G_SUFFIXES: &[&str] =
    &["local", "intranet", "internal", "private", "corp", "home", "lan"];

pub struct SpecialUseResolver {
    enable: bool,
    appendix_g: bool,
    next: NextResolver,
}

impl SpecialUseResolver {
    pub fn new(config: &SpecialUseConfig, next: NextResolver) -> Self {
        Self { enable: config.enable, appendix_g: config.rfc6762_appendix_g, next }
    }

    fn is_special(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        let last_label = name.rsplit('.').next().unwrap_or("");
        SPECIAL_USE_SUFFIXES.contains(&last_label)
            || (self.appendix_g && APPENDIX_G_SUFFIXES.contains(&last_label))
    }
}

#[async_trait]
impl Resolver for SpecialUseResolver {
    fn name(&self) -> &'static str {
        "special_use_domains"
    }

    async fn resolve(&self, request: &mut Request) -> Result<Response> {
        request.ensure_active()?;
        let name = request.question_name().to_string();
        if self.enable && !name.is_empty() && self.is_special(&name) {
            debug!("{} is a special-use domain, answering NXDOMAIN", name);
            let response = DnsMessage::error_response(&request.message, Rcode::NxDomain);
            return Ok(Response::new(
                response,
                ResponseType::Special,
                "special-use domain",
            ));
        }
        self.next.resolve(request).await
    }
}
