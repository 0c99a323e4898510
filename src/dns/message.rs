use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::edns::{ClientSubnet, EdnsOption, OPTION_CLIENT_SUBNET};
use super::enums::{Opcode, Rcode, RecordClass, RecordType};
use super::header::Header;
use super::question::Question;
use super::record::{RData, ResourceRecord};
use super::wire::WireError;

/// A parsed DNS message. Names are stored dotted and re-encoded without
/// compression; parsing follows compression pointers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsMessage {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additionals: Vec<ResourceRecord>,
}

impl DnsMessage {
    pub fn new_query(name: impl Into<String>, qtype: RecordType) -> Self {
        let mut message = DnsMessage {
            header: Header { rd: true, ..Header::default() },
            questions: vec![Question::new(name, qtype)],
            ..DnsMessage::default()
        };
        message.header.qdcount = 1;
        message
    }

    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let header = Header::read(buf)?;
        let mut offset = Header::WIRE_LEN;

        let mut questions = Vec::with_capacity(header.qdcount as usize);
        for _ in 0..header.qdcount {
            questions.push(Question::read(buf, &mut offset)?);
        }
        let mut answers = Vec::with_capacity(header.ancount as usize);
        for _ in 0..header.ancount {
            answers.push(ResourceRecord::read(buf, &mut offset)?);
        }
        let mut authorities = Vec::with_capacity(header.nscount as usize);
        for _ in 0..header.nscount {
            authorities.push(ResourceRecord::read(buf, &mut offset)?);
        }
        let mut additionals = Vec::with_capacity(header.arcount as usize);
        for _ in 0..header.arcount {
            additionals.push(ResourceRecord::read(buf, &mut offset)?);
        }

        Ok(DnsMessage { header, questions, answers, authorities, additionals })
    }

    pub fn serialize(&self) -> Result<Vec<u8>, WireError> {
        let mut header = self.header.clone();
        header.qdcount = self.questions.len() as u16;
        header.ancount = self.answers.len() as u16;
        header.nscount = self.authorities.len() as u16;
        header.arcount = self.additionals.len() as u16;

        let mut out = Vec::with_capacity(512);
        header.write(&mut out)?;
        for question in &self.questions {
            question.write(&mut out)?;
        }
        for record in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            record.write(&mut out)?;
        }
        Ok(out)
    }

    pub fn id(&self) -> u16 {
        self.header.id
    }

    pub fn set_id(&mut self, id: u16) {
        self.header.id = id;
    }

    pub fn opcode(&self) -> Opcode {
        self.header.opcode.into()
    }

    pub fn rcode(&self) -> Rcode {
        self.header.rcode.into()
    }

    pub fn set_rcode(&mut self, rcode: Rcode) {
        self.header.rcode = rcode.into();
    }

    pub fn is_query(&self) -> bool {
        !self.header.qr
    }

    pub fn question(&self) -> Option<&Question> {
        self.questions.first()
    }

    pub fn question_name(&self) -> &str {
        self.questions.first().map(|q| q.name.as_str()).unwrap_or("")
    }

    /// Response skeleton mirroring id, opcode, RD and the question section.
    pub fn response_for(query: &DnsMessage) -> Self {
        let mut response = DnsMessage {
            header: Header {
                id: query.header.id,
                qr: true,
                opcode: query.header.opcode,
                rd: query.header.rd,
                ra: true,
                ..Header::default()
            },
            questions: query.questions.clone(),
            ..DnsMessage::default()
        };
        response.header.qdcount = response.questions.len() as u16;
        response
    }

    pub fn error_response(query: &DnsMessage, rcode: Rcode) -> Self {
        let mut response = Self::response_for(query);
        response.set_rcode(rcode);
        response
    }

    /// Empty response with the TC bit set, used when a UDP answer exceeds the
    /// client's advertised payload size.
    pub fn truncated_response_for(query: &DnsMessage) -> Self {
        let mut response = Self::response_for(query);
        response.header.tc = true;
        response
    }

    /// Smallest TTL over the answer section.
    pub fn min_answer_ttl(&self) -> Option<u32> {
        self.answers.iter().map(|rr| rr.ttl).min()
    }

    /// Overwrite the TTL of every record except the OPT pseudo-record.
    pub fn set_ttls(&mut self, ttl: u32) {
        for rr in self
            .answers
            .iter_mut()
            .chain(&mut self.authorities)
            .chain(&mut self.additionals)
        {
            if rr.rtype != RecordType::OPT {
                rr.ttl = ttl;
            }
        }
    }

    /// Subtract `elapsed_secs` from every record TTL, saturating at zero.
    pub fn decrement_ttls(&mut self, elapsed_secs: u32) {
        for rr in self
            .answers
            .iter_mut()
            .chain(&mut self.authorities)
            .chain(&mut self.additionals)
        {
            if rr.rtype != RecordType::OPT {
                rr.ttl = rr.ttl.saturating_sub(elapsed_secs);
            }
        }
    }

    pub fn answer_ips(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.answers.iter().filter_map(|rr| rr.rdata.ip())
    }

    pub fn cname_targets(&self) -> impl Iterator<Item = &str> + '_ {
        self.answers.iter().filter_map(|rr| match &rr.rdata {
            RData::Cname(target) => Some(target.as_str()),
            _ => None,
        })
    }

    fn opt_record(&self) -> Option<&ResourceRecord> {
        self.additionals.iter().find(|rr| rr.rtype == RecordType::OPT)
    }

    fn opt_record_mut(&mut self) -> Option<&mut ResourceRecord> {
        self.additionals.iter_mut().find(|rr| rr.rtype == RecordType::OPT)
    }

    /// Maximum UDP payload the sender advertises (RFC 6891), 512 without EDNS.
    pub fn max_udp_payload_size(&self) -> u16 {
        match self.opt_record() {
            Some(opt) => u16::from(opt.class).max(512),
            None => 512,
        }
    }

    pub fn client_subnet(&self) -> Option<ClientSubnet> {
        let opt = self.opt_record()?;
        if let RData::Opt(options) = &opt.rdata {
            options
                .iter()
                .find(|o| o.code == OPTION_CLIENT_SUBNET)
                .and_then(|o| ClientSubnet::decode(&o.data))
        } else {
            None
        }
    }

    /// Insert or replace the Client Subnet option, creating the OPT
    /// pseudo-record if the query carries none.
    pub fn set_client_subnet(&mut self, subnet: &ClientSubnet) {
        let option = subnet.encode();
        if self.opt_record().is_none() {
            self.additionals.push(ResourceRecord {
                name: String::new(),
                rtype: RecordType::OPT,
                class: RecordClass::Other(4096),
                ttl: 0,
                rdata: RData::Opt(Vec::new()),
            });
        }
        if let Some(opt) = self.opt_record_mut() {
            if let RData::Opt(options) = &mut opt.rdata {
                options.retain(|o| o.code != OPTION_CLIENT_SUBNET);
                options.push(option);
            }
        }
    }

    pub fn remove_client_subnet(&mut self) {
        if let Some(opt) = self.opt_record_mut() {
            if let RData::Opt(options) = &mut opt.rdata {
                options.retain(|o| o.code != OPTION_CLIENT_SUBNET);
            }
        }
    }

    pub fn edns_options(&self) -> &[EdnsOption] {
        match self.opt_record().map(|rr| &rr.rdata) {
            Some(RData::Opt(options)) => options,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn query_roundtrip() {
        let mut query = DnsMessage::new_query("www.example.com", RecordType::A);
        query.set_id(4711);
        let bytes = query.serialize().unwrap();
        let parsed = DnsMessage::parse(&bytes).unwrap();
        assert_eq!(parsed, query);
        assert!(parsed.is_query());
    }

    #[test]
    fn response_roundtrip_with_answers() {
        let query = DnsMessage::new_query("www.example.com", RecordType::A);
        let mut response = DnsMessage::response_for(&query);
        response
            .answers
            .push(ResourceRecord::a("www.example.com", 123, Ipv4Addr::new(1, 2, 3, 4)));
        let bytes = response.serialize().unwrap();
        let parsed = DnsMessage::parse(&bytes).unwrap();
        assert_eq!(parsed.header.ancount, 1);
        assert_eq!(parsed.answers[0].ttl, 123);
        assert!(!parsed.is_query());
    }

    #[test]
    fn decrement_ttls_saturates() {
        let query = DnsMessage::new_query("www.example.com", RecordType::A);
        let mut response = DnsMessage::response_for(&query);
        response
            .answers
            .push(ResourceRecord::a("www.example.com", 10, Ipv4Addr::new(1, 2, 3, 4)));
        response.decrement_ttls(15);
        assert_eq!(response.answers[0].ttl, 0);
    }

    #[test]
    fn client_subnet_set_and_get() {
        let mut query = DnsMessage::new_query("www.example.com", RecordType::A);
        assert!(query.client_subnet().is_none());
        let ecs = ClientSubnet::for_ip("192.0.2.55".parse().unwrap(), 24);
        query.set_client_subnet(&ecs);
        let read_back = query.client_subnet().unwrap();
        assert_eq!(read_back.address, "192.0.2.0".parse::<std::net::IpAddr>().unwrap());
        query.remove_client_subnet();
        assert!(query.client_subnet().is_none());
    }

    #[test]
    fn payload_size_defaults_to_512() {
        let query = DnsMessage::new_query("www.example.com", RecordType::A);
        assert_eq!(query.max_udp_payload_size(), 512);
    }
}
