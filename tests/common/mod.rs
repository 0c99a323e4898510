use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::net::UdpSocket;

use warden::dns::enums::{Rcode, RecordType};
use warden::dns::{DnsMessage, ResourceRecord};
use warden::model::{Protocol, Request};

/// In-process upstream DNS server for integration tests: answers A queries
/// from a fixed table, NXDOMAIN for everything else.
pub struct MockUpstream {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl MockUpstream {
    pub async fn spawn(answers: HashMap<String, Ipv4Addr>, ttl: u32) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_task = hits.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                let Ok(query) = DnsMessage::parse(&buf[..len]) else { continue };
                hits_in_task.fetch_add(1, Ordering::SeqCst);
                let mut response = DnsMessage::response_for(&query);
                let name = query.question_name().to_lowercase();
                match answers.get(&name) {
                    Some(ip) => {
                        response.answers.push(ResourceRecord::a(name.clone(), ttl, *ip));
                    }
                    None => response.set_rcode(Rcode::NxDomain),
                }
                let _ = socket.send_to(&response.serialize().unwrap(), peer).await;
            }
        });

        Self { addr, hits }
    }

    /// A socket that swallows every query without answering.
    pub async fn spawn_blackhole() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let _ = socket.recv_from(&mut buf).await;
            }
        });
        addr
    }

    pub fn upstream_string(&self) -> String {
        format!("tcp+udp:{}:{}", self.addr.ip(), self.addr.port())
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

pub fn request_for(name: &str, qtype: RecordType) -> Request {
    Request::new(
        DnsMessage::new_query(name, qtype),
        "127.0.0.1".parse().unwrap(),
        Protocol::Udp,
    )
}
