use std::net::IpAddr;

use async_trait::async_trait;
use tracing::trace;

use super::{NextResolver, Resolver};
use crate::config::EcsConfig;
use crate::dns::edns::ClientSubnet;
use crate::error::Result;
use crate::model::{Request, Response};

/// Applies the EDNS Client Subnet policy before the query is forwarded:
/// optionally adopts an inbound ECS address as the client identity, masks
/// and attaches the client address, or strips the option entirely.
pub struct EcsResolver {
    config: EcsConfig,
    next: NextResolver,
}

impl EcsResolver {
    pub fn new(config: &EcsConfig, next: NextResolver) -> Self {
        Self { config: config.clone(), next }
    }

    fn mask_for(&self, ip: IpAddr) -> u8 {
        match ip {
            IpAddr::V4(_) => self.config.ipv4_mask,
            IpAddr::V6(_) => self.config.ipv6_mask,
        }
    }
}

#[async_trait]
impl Resolver for EcsResolver {
    fn name(&self) -> &'static str {
        "ecs"
    }

    async fn resolve(&self, request: &mut Request) -> Result<Response> {
        request.ensure_active()?;

        if self.config.use_as_client {
            if let Some(subnet) = request.message.client_subnet() {
                if subnet.source_prefix > 0 {
                    trace!("adopting ECS address {} as client identity", subnet.address);
                    request.client_ip = subnet.address;
                }
            }
        }

        let mask = self.mask_for(request.client_ip);
        if mask > 0 {
            let subnet = ClientSubnet::for_ip(request.client_ip, mask);
            request.message.set_client_subnet(&subnet);
        } else if !self.config.forward {
            request.message.remove_client_subnet();
        }

        self.next.resolve(request).await
    }
}
