use std::fmt;
use std::net::IpAddr;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::dns::DnsMessage;
use crate::error::{Result, WardenError};

/// Transport the query arrived on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
    Tls,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => write!(f, "udp"),
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Tls => write!(f, "tls"),
            Protocol::Https => write!(f, "https"),
        }
    }
}

/// Which link of the chain produced the final answer. Carried on every
/// response for the query log, metrics and tests.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResponseType {
    Resolved,
    Cached,
    Blocked,
    Conditional,
    CustomDns,
    HostsFile,
    Filtered,
    Special,
    NotFwd,
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseType::Resolved => write!(f, "RESOLVED"),
            ResponseType::Cached => write!(f, "CACHED"),
            ResponseType::Blocked => write!(f, "BLOCKED"),
            ResponseType::Conditional => write!(f, "CONDITIONAL"),
            ResponseType::CustomDns => write!(f, "CUSTOMDNS"),
            ResponseType::HostsFile => write!(f, "HOSTSFILE"),
            ResponseType::Filtered => write!(f, "FILTERED"),
            ResponseType::Special => write!(f, "SPECIAL"),
            ResponseType::NotFwd => write!(f, "NOTFWD"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Response {
    pub message: DnsMessage,
    pub response_type: ResponseType,
    pub reason: String,
}

impl Response {
    pub fn new(message: DnsMessage, response_type: ResponseType, reason: impl Into<String>) -> Self {
        Self { message, response_type, reason: reason.into() }
    }
}

/// A single inbound query travelling down the resolver chain.
///
/// The question itself is never mutated by resolvers other than the
/// rewriter (which restores it); resolvers may augment the client identity
/// fields and the EDNS section.
#[derive(Clone, Debug)]
pub struct Request {
    pub message: DnsMessage,
    pub client_ip: IpAddr,
    pub protocol: Protocol,
    /// Display names attached by the client-name resolver.
    pub client_names: Vec<String>,
    /// Upstream client-group this request maps to; `default` until resolved.
    pub client_group: String,
    pub received_at: Instant,
    pub cancel: CancellationToken,
}

impl Request {
    pub fn new(message: DnsMessage, client_ip: IpAddr, protocol: Protocol) -> Self {
        Self {
            message,
            client_ip,
            protocol,
            client_names: Vec::new(),
            client_group: "default".to_string(),
            received_at: Instant::now(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn question_name(&self) -> &str {
        self.message.question_name()
    }

    /// All identifiers the client can be matched by: names first, then IP.
    pub fn client_identifiers(&self) -> Vec<String> {
        let mut ids = self.client_names.clone();
        ids.push(self.client_ip.to_string());
        ids
    }

    /// Every resolver calls this on entry; a cancelled request must not
    /// touch caches or logs.
    pub fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(WardenError::Cancelled)
        } else {
            Ok(())
        }
    }
}
