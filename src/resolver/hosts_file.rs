use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use tracing::debug;

use super::custom_dns::parse_reverse_name;
use super::{NextResolver, Resolver};
use crate::dns::enums::RecordType;
use crate::dns::{DnsMessage, ResourceRecord};
use crate::error::Result;
use crate::model::{Request, Response, ResponseType};

/// An already-parsed hosts table: name → addresses plus the reverse index.
/// Materialising the table (reading hosts files, DHCP leases, watchers) is
/// a collaborator concern; this resolver only serves lookups.
#[derive(Debug, Default)]
pub struct HostsTable {
    by_name: HashMap<String, Vec<IpAddr>>,
    by_ip: HashMap<IpAddr, Vec<String>>,
}

impl HostsTable {
    pub fn insert(&mut self, ip: IpAddr, names: &[String]) {
        for name in names {
            let name = name.to_lowercase();
            self.by_name.entry(name.clone()).or_default().push(ip);
            self.by_ip.entry(ip).or_default().push(name);
        }
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Answers A/AAAA/PTR queries from the hosts table, tagged HOSTSFILE.
pub struct HostsFileResolver {
    table: HostsTable,
    ttl: u32,
    next: NextResolver,
}

impl HostsFileResolver {
    pub fn with_table(table: HostsTable, ttl: u32, next: NextResolver) -> Self {
        Self { table, ttl, next }
    }
}

#[async_trait]
impl Resolver for HostsFileResolver {
    fn name(&self) -> &'static str {
        "hosts_file"
    }

    async fn resolve(&self, request: &mut Request) -> Result<Response> {
        request.ensure_active()?;
        if self.table.is_empty() {
            return self.next.resolve(request).await;
        }
        let Some(question) = request.message.question().cloned() else {
            return self.next.resolve(request).await;
        };
        let qname = question.name.to_lowercase();

        let answers: Vec<ResourceRecord> = match question.qtype {
            RecordType::A | RecordType::AAAA => self
                .table
                .by_name
                .get(&qname)
                .into_iter()
                .flatten()
                .filter(|ip| {
                    (question.qtype == RecordType::A && ip.is_ipv4())
                        || (question.qtype == RecordType::AAAA && ip.is_ipv6())
                })
                .map(|ip| ResourceRecord::from_ip(question.name.clone(), self.ttl, *ip))
                .collect(),
            RecordType::PTR => parse_reverse_name(&qname)
                .and_then(|ip| self.table.by_ip.get(&ip))
                .into_iter()
                .flatten()
                .map(|name| ResourceRecord::ptr(qname.clone(), self.ttl, name.clone()))
                .collect(),
            _ => Vec::new(),
        };

        if answers.is_empty() {
            return self.next.resolve(request).await;
        }
        debug!("answering {} from hosts table", question.name);
        let mut message = DnsMessage::response_for(&request.message);
        message.answers = answers;
        Ok(Response::new(message, ResponseType::HostsFile, "hosts table"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::test_support::{StaticResolver, request_for};

    fn table() -> HostsTable {
        let mut table = HostsTable::default();
        table.insert("192.168.1.5".parse().unwrap(), &["router.lan".to_string()]);
        table.insert("2001:db8::5".parse().unwrap(), &["router.lan".to_string()]);
        table
    }

    #[tokio::test]
    async fn answers_a_and_aaaa_separately() {
        let resolver = HostsFileResolver::with_table(table(), 120, StaticResolver::resolved("9.9.9.9").arc());

        let mut request = request_for("router.lan", RecordType::A);
        let response = resolver.resolve(&mut request).await.unwrap();
        assert_eq!(response.response_type, ResponseType::HostsFile);
        assert_eq!(response.message.answers.len(), 1);
        assert_eq!(response.message.answers[0].ttl, 120);

        let mut request = request_for("router.lan", RecordType::AAAA);
        let response = resolver.resolve(&mut request).await.unwrap();
        assert_eq!(response.message.answers[0].rdata.ip().unwrap().to_string(), "2001:db8::5");
    }

    #[tokio::test]
    async fn ptr_answers_from_reverse_index() {
        let resolver = HostsFileResolver::with_table(table(), 120, StaticResolver::resolved("9.9.9.9").arc());
        let mut request = request_for("5.1.168.192.in-addr.arpa", RecordType::PTR);
        let response = resolver.resolve(&mut request).await.unwrap();
        assert_eq!(response.response_type, ResponseType::HostsFile);
        assert_eq!(response.message.answers[0].rdata.target(), Some("router.lan"));
    }

    #[tokio::test]
    async fn unknown_names_fall_through() {
        let inner = StaticResolver::resolved("9.9.9.9").arc();
        let resolver = HostsFileResolver::with_table(table(), 120, inner.clone());
        let mut request = request_for("elsewhere.example", RecordType::A);
        let response = resolver.resolve(&mut request).await.unwrap();
        assert_eq!(response.response_type, ResponseType::Resolved);
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test]
    async fn empty_table_is_transparent() {
        let inner = StaticResolver::resolved("9.9.9.9").arc();
        let resolver = HostsFileResolver::with_table(HostsTable::default(), 120, inner.clone());
        let mut request = request_for("router.lan", RecordType::A);
        let response = resolver.resolve(&mut request).await.unwrap();
        assert_eq!(response.response_type, ResponseType::Resolved);
        assert_eq!(inner.calls(), 1);
    }
}
