use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{NextResolver, Resolver, client_group_lookup};
use crate::config::ClientLookupConfig;
use crate::dns::enums::RecordType;
use crate::dns::{DnsMessage, RData};
use crate::error::Result;
use crate::model::{Request, Response};
use crate::upstream::transport::UpstreamClient;

const RDNS_CACHE_TTL: Duration = Duration::from_secs(600);

/// Attaches display names to the request (static map first, then a reverse
/// lookup against the configured rDNS upstream) and picks the upstream
/// client-group. Never answers by itself.
pub struct ClientNameResolver {
    names_by_ip: HashMap<IpAddr, Vec<String>>,
    rdns: Option<UpstreamClient>,
    rdns_timeout: Duration,
    rdns_cache: DashMap<IpAddr, (Vec<String>, Instant)>,
    group_keys: HashSet<String>,
    next: NextResolver,
}

impl ClientNameResolver {
    pub fn new(
        config: &ClientLookupConfig,
        group_keys: HashSet<String>,
        rdns_timeout: Duration,
        next: NextResolver,
    ) -> Result<Self> {
        let mut names_by_ip: HashMap<IpAddr, Vec<String>> = HashMap::new();
        for (name, ips) in &config.clients {
            for ip in ips {
                names_by_ip.entry(*ip).or_default().push(name.clone());
            }
        }
        let rdns = match &config.upstream {
            Some(upstream) => Some(UpstreamClient::build(upstream)?),
            None => None,
        };
        Ok(Self {
            names_by_ip,
            rdns,
            rdns_timeout,
            rdns_cache: DashMap::new(),
            group_keys,
            next,
        })
    }

    async fn lookup_names(&self, ip: IpAddr, cancel: &CancellationToken) -> Vec<String> {
        if let Some(names) = self.names_by_ip.get(&ip) {
            return names.clone();
        }
        let Some(rdns) = &self.rdns else {
            return Vec::new();
        };
        if let Some(entry) = self.rdns_cache.get(&ip) {
            let (names, fetched_at) = entry.value();
            if fetched_at.elapsed() < RDNS_CACHE_TTL {
                return names.clone();
            }
        }

        let query = DnsMessage::new_query(reverse_ptr_name(ip), RecordType::PTR);
        let names = match rdns.exchange(&query, self.rdns_timeout, cancel).await {
            Ok(response) => response
                .answers
                .iter()
                .filter_map(|rr| match &rr.rdata {
                    RData::Ptr(target) => Some(target.clone()),
                    _ => None,
                })
                .collect(),
            Err(e) => {
                warn!("reverse lookup for {} failed: {}", ip, e);
                Vec::new()
            }
        };
        self.rdns_cache.insert(ip, (names.clone(), Instant::now()));
        names
    }
}

#[async_trait]
impl Resolver for ClientNameResolver {
    fn name(&self) -> &'static str {
        "client_name"
    }

    async fn resolve(&self, request: &mut Request) -> Result<Response> {
        request.ensure_active()?;

        let names = self.lookup_names(request.client_ip, &request.cancel).await;
        if !names.is_empty() {
            trace!("client {} resolved to names {:?}", request.client_ip, names);
            request.client_names = names;
        }

        if let Some(group) =
            client_group_lookup(&self.group_keys, &request.client_names, request.client_ip)
        {
            debug!("client {} mapped to upstream group {}", request.client_ip, group);
            request.client_group = group;
        }

        self.next.resolve(request).await
    }
}

/// `1.2.3.4` → `4.3.2.1.in-addr.arpa`; IPv6 uses the nibble format.
pub fn reverse_ptr_name(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut nibbles: Vec<String> = Vec::with_capacity(32);
            for octet in v6.octets().iter().rev() {
                nibbles.push(format!("{:x}", octet & 0x0F));
                nibbles.push(format!("{:x}", octet >> 4));
            }
            format!("{}.ip6.arpa", nibbles.join("."))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResponseType;
    use crate::resolver::test_support::{StaticResolver, request_for};

    #[test]
    fn reverse_names() {
        assert_eq!(reverse_ptr_name("1.2.3.4".parse().unwrap()), "4.3.2.1.in-addr.arpa");
        let v6 = reverse_ptr_name("2001:db8::1".parse().unwrap());
        assert!(v6.ends_with(".ip6.arpa"));
        assert!(v6.starts_with("1.0.0.0."));
    }

    #[tokio::test]
    async fn static_names_and_group_are_attached() {
        let mut config = ClientLookupConfig::default();
        config
            .clients
            .insert("laptop".to_string(), vec!["192.168.1.2".parse().unwrap()]);
        let group_keys: HashSet<String> =
            ["default".to_string(), "laptop".to_string()].into_iter().collect();

        let resolver = ClientNameResolver::new(
            &config,
            group_keys,
            Duration::from_secs(1),
            StaticResolver::resolved("1.2.3.4").arc(),
        )
        .unwrap();

        let mut request = request_for("example.com", RecordType::A);
        request.client_ip = "192.168.1.2".parse().unwrap();
        let response = resolver.resolve(&mut request).await.unwrap();
        assert_eq!(response.response_type, ResponseType::Resolved);
        assert_eq!(request.client_names, vec!["laptop".to_string()]);
        assert_eq!(request.client_group, "laptop");
    }

    #[tokio::test]
    async fn unknown_client_keeps_default_group() {
        let resolver = ClientNameResolver::new(
            &ClientLookupConfig::default(),
            ["default".to_string()].into_iter().collect(),
            Duration::from_secs(1),
            StaticResolver::resolved("1.2.3.4").arc(),
        )
        .unwrap();
        let mut request = request_for("example.com", RecordType::A);
        resolver.resolve(&mut request).await.unwrap();
        assert_eq!(request.client_group, "default");
    }
}
