pub mod expiring_lru;
pub mod redis_sync;

use serde::{Deserialize, Serialize};

use crate::dns::enums::{RecordClass, RecordType};
use crate::dns::{DnsMessage, Question};
use crate::error::Result;

/// Cache key: `<qname>|<qclass>|<qtype>|<clientGroup>`, qname lowercased,
/// class and type as their numeric codes so the key parses back unambiguously.
pub fn cache_key(question: &Question, client_group: &str) -> String {
    format!(
        "{}|{}|{}|{}",
        question.name.to_lowercase(),
        u16::from(question.qclass),
        u16::from(question.qtype),
        client_group
    )
}

/// Reverse of [`cache_key`], used by the prefetcher to rebuild the question.
pub fn parse_cache_key(key: &str) -> Option<(Question, String)> {
    let mut parts = key.split('|');
    let name = parts.next()?;
    let qclass: RecordClass = parts.next()?.parse::<u16>().ok()?.into();
    let qtype: RecordType = parts.next()?.parse::<u16>().ok()?.into();
    let group = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((
        Question { name: name.to_string(), qtype, qclass },
        group.to_string(),
    ))
}

/// Cached payload: the packed wire form plus the rcode, so serving a hit
/// needs no parsed message retained in memory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DnsCacheEntry {
    pub wire: Vec<u8>,
    pub rcode: u8,
}

impl DnsCacheEntry {
    pub fn from_message(message: &DnsMessage) -> Result<Self> {
        Ok(Self { wire: message.serialize()?, rcode: message.header.rcode })
    }

    pub fn to_message(&self) -> Result<DnsMessage> {
        Ok(DnsMessage::parse(&self.wire)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_parseable() {
        let question = Question::new("WWW.Example.COM", RecordType::AAAA);
        let key = cache_key(&question, "kids");
        assert_eq!(key, "www.example.com|1|28|kids");
        let (parsed, group) = parse_cache_key(&key).unwrap();
        assert_eq!(parsed.name, "www.example.com");
        assert_eq!(parsed.qtype, RecordType::AAAA);
        assert_eq!(parsed.qclass, RecordClass::IN);
        assert_eq!(group, "kids");
    }

    #[test]
    fn entry_roundtrip() {
        let message = DnsMessage::new_query("example.com", RecordType::A);
        let entry = DnsCacheEntry::from_message(&message).unwrap();
        assert_eq!(entry.to_message().unwrap(), message);
    }
}
