use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use tracing::debug;

use super::{NextResolver, Resolver};
use crate::config::CustomDnsConfig;
use crate::dns::enums::RecordType;
use crate::dns::{DnsMessage, RData, ResourceRecord};
use crate::error::{Result, WardenError};
use crate::model::{Request, Response, ResponseType};

/// Answers from the static `customDNS.mapping` table. A mapping covers the
/// name itself and every subdomain; PTR queries are answered from a reverse
/// index built at load time.
pub struct CustomDnsResolver {
    mapping: HashMap<String, Vec<RData>>,
    reverse: HashMap<IpAddr, Vec<String>>,
    ttl: u32,
    filter_unmapped_types: bool,
    next: NextResolver,
}

impl CustomDnsResolver {
    pub fn new(config: &CustomDnsConfig, next: NextResolver) -> Result<Self> {
        let mut mapping: HashMap<String, Vec<RData>> = HashMap::new();
        let mut reverse: HashMap<IpAddr, Vec<String>> = HashMap::new();

        for (name, value) in &config.mapping {
            let name = name.to_lowercase();
            let records = parse_mapping_value(value).map_err(|e| {
                WardenError::Config(format!("customDNS.mapping.{}: {}", name, e))
            })?;
            for record in &records {
                if let Some(ip) = record.ip() {
                    reverse.entry(ip).or_default().push(name.clone());
                }
            }
            mapping.insert(name, records);
        }

        Ok(Self {
            mapping,
            reverse,
            ttl: config.custom_ttl.as_secs() as u32,
            filter_unmapped_types: config.filter_unmapped_types,
            next,
        })
    }

    /// The mapping entry covering `name`, walking parent suffixes.
    fn lookup(&self, name: &str) -> Option<&Vec<RData>> {
        let mut candidate = name;
        loop {
            if let Some(records) = self.mapping.get(candidate) {
                return Some(records);
            }
            candidate = candidate.split_once('.')?.1;
        }
    }

    fn answer(&self, request: &Request, answers: Vec<ResourceRecord>) -> Response {
        let mut message = DnsMessage::response_for(&request.message);
        message.answers = answers;
        Response::new(message, ResponseType::CustomDns, "custom DNS mapping")
    }
}

#[async_trait]
impl Resolver for CustomDnsResolver {
    fn name(&self) -> &'static str {
        "custom_dns"
    }

    async fn resolve(&self, request: &mut Request) -> Result<Response> {
        request.ensure_active()?;
        let Some(question) = request.message.question().cloned() else {
            return self.next.resolve(request).await;
        };
        let qname = question.name.to_lowercase();

        if question.qtype == RecordType::PTR {
            if let Some(ip) = parse_reverse_name(&qname) {
                if let Some(names) = self.reverse.get(&ip) {
                    debug!("answering PTR for {} from custom DNS", ip);
                    let answers = names
                        .iter()
                        .map(|n| ResourceRecord::ptr(qname.clone(), self.ttl, n.clone()))
                        .collect();
                    return Ok(self.answer(request, answers));
                }
            }
        }

        if let Some(records) = self.lookup(&qname) {
            let answers: Vec<ResourceRecord> = records
                .iter()
                .filter(|rdata| record_type_of(rdata) == question.qtype)
                .map(|rdata| ResourceRecord {
                    name: question.name.clone(),
                    rtype: question.qtype,
                    class: question.qclass,
                    ttl: self.ttl,
                    rdata: rdata.clone(),
                })
                .collect();

            if !answers.is_empty() {
                debug!("answering {} {} from custom DNS", question.name, question.qtype);
                return Ok(self.answer(request, answers));
            }
            if self.filter_unmapped_types {
                debug!("{} is covered by custom DNS but has no {} records", question.name, question.qtype);
                return Ok(self.answer(request, Vec::new()));
            }
        }

        self.next.resolve(request).await
    }
}

fn record_type_of(rdata: &RData) -> RecordType {
    match rdata {
        RData::A(_) => RecordType::A,
        RData::Aaaa(_) => RecordType::AAAA,
        RData::Cname(_) => RecordType::CNAME,
        RData::Ns(_) => RecordType::NS,
        RData::Ptr(_) => RecordType::PTR,
        RData::Mx { .. } => RecordType::MX,
        RData::Soa { .. } => RecordType::SOA,
        RData::Txt(_) => RecordType::TXT,
        RData::Opt(_) => RecordType::OPT,
        RData::Raw(_) => RecordType::Other(0),
    }
}

/// `ip`, `ip,ip`, or `CNAME:target`.
fn parse_mapping_value(value: &str) -> std::result::Result<Vec<RData>, String> {
    if let Some(target) = value.strip_prefix("CNAME:") {
        let target = target.trim();
        if target.is_empty() {
            return Err("empty CNAME target".to_string());
        }
        return Ok(vec![RData::Cname(target.to_lowercase())]);
    }
    let mut records = Vec::new();
    for part in value.split(',') {
        let ip: IpAddr = part
            .trim()
            .parse()
            .map_err(|_| format!("invalid IP address {}", part.trim()))?;
        records.push(match ip {
            IpAddr::V4(v4) => RData::A(v4),
            IpAddr::V6(v6) => RData::Aaaa(v6),
        });
    }
    if records.is_empty() {
        return Err("empty mapping value".to_string());
    }
    Ok(records)
}

/// Parse `4.3.2.1.in-addr.arpa` / nibble `ip6.arpa` names back to addresses.
pub(crate) fn parse_reverse_name(name: &str) -> Option<IpAddr> {
    if let Some(rest) = name.strip_suffix(".in-addr.arpa") {
        let mut octets: Vec<u8> = Vec::with_capacity(4);
        for part in rest.rsplit('.') {
            octets.push(part.parse().ok()?);
        }
        let arr: [u8; 4] = octets.try_into().ok()?;
        return Some(IpAddr::from(arr));
    }
    if let Some(rest) = name.strip_suffix(".ip6.arpa") {
        let nibbles: Vec<&str> = rest.rsplit('.').collect();
        if nibbles.len() != 32 {
            return None;
        }
        let mut octets = [0u8; 16];
        for (i, chunk) in nibbles.chunks(2).enumerate() {
            let high = u8::from_str_radix(chunk[0], 16).ok()?;
            let low = u8::from_str_radix(chunk[1], 16).ok()?;
            octets[i] = (high << 4) | low;
        }
        return Some(IpAddr::from(octets));
    }
    None
}
