use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket, lookup_host};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{Upstream, UpstreamProtocol};
use crate::dns::DnsMessage;
use crate::error::{Result, WardenError};

/// Pooled UDP sockets older than this are discarded at checkout.
const UDP_IDLE_REAP: Duration = Duration::from_secs(10);
const MAX_POOLED_SOCKETS: usize = 8;
const MAX_UDP_RESPONSE: usize = 4096;

struct PooledSocket {
    socket: UdpSocket,
    last_used: Instant,
}

enum ClientKind {
    Plain { pool: Mutex<Vec<PooledSocket>> },
    Tls { connector: TlsConnector, server_name: ServerName<'static> },
    Https { http: reqwest::Client, url: String },
}

/// A connection handle for a single upstream server. Owns the UDP socket
/// pool (plain DNS) or the TLS/HTTPS client state.
pub struct UpstreamClient {
    upstream: Upstream,
    kind: ClientKind,
}

impl UpstreamClient {
    pub fn build(upstream: &Upstream) -> Result<Self> {
        let kind = match upstream.protocol {
            UpstreamProtocol::PlainDns => ClientKind::Plain { pool: Mutex::new(Vec::new()) },
            UpstreamProtocol::Tls => {
                let connector = TlsConnector::from(Arc::new(client_tls_config(upstream)?));
                let server_name = ServerName::try_from(upstream.tls_name().to_string())
                    .map_err(|_| {
                        WardenError::Tls(format!("invalid TLS name {}", upstream.tls_name()))
                    })?;
                ClientKind::Tls { connector, server_name }
            }
            UpstreamProtocol::Https => {
                let mut builder = reqwest::Client::builder()
                    .use_rustls_tls()
                    .timeout(Duration::from_secs(30));
                if !upstream.fingerprints.is_empty() {
                    builder = builder.use_preconfigured_tls(client_tls_config(upstream)?);
                }
                let http = builder
                    .build()
                    .map_err(|e| WardenError::Tls(format!("http client: {}", e)))?;
                ClientKind::Https { http, url: upstream.doh_url() }
            }
        };
        Ok(Self { upstream: upstream.clone(), kind })
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    /// One query/response exchange, bounded by `deadline` and `cancel`.
    pub async fn exchange(
        &self,
        query: &DnsMessage,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<DnsMessage> {
        let wire = query.serialize()?;
        let exchange = self.exchange_wire(&wire);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(WardenError::Cancelled),
            result = tokio::time::timeout(deadline, exchange) => match result {
                Ok(response) => response?,
                Err(_) => return Err(WardenError::UpstreamTimeout),
            },
        };
        if response.id() != query.id() {
            return Err(WardenError::Upstream(
                self.upstream.to_string(),
                "response id mismatch".to_string(),
            ));
        }
        Ok(response)
    }

    async fn exchange_wire(&self, wire: &[u8]) -> Result<DnsMessage> {
        match &self.kind {
            ClientKind::Plain { pool } => {
                let response = self.exchange_udp(pool, wire).await?;
                if response.header.tc {
                    debug!("upstream {} answered truncated, retrying over tcp", self.upstream);
                    self.exchange_tcp(wire).await
                } else {
                    Ok(response)
                }
            }
            ClientKind::Tls { connector, server_name } => {
                let addr = self.resolve_addr().await?;
                let tcp = TcpStream::connect(addr).await?;
                let mut stream = connector.connect(server_name.clone(), tcp).await?;
                let result = exchange_framed(&mut stream, wire).await;
                let _ = stream.shutdown().await;
                DnsMessage::parse(&result?).map_err(Into::into)
            }
            ClientKind::Https { http, url } => {
                let response = http
                    .post(url)
                    .header("content-type", "application/dns-message")
                    .header("accept", "application/dns-message")
                    .body(wire.to_vec())
                    .send()
                    .await
                    .map_err(|e| WardenError::Upstream(self.upstream.to_string(), e.to_string()))?;
                if !response.status().is_success() {
                    return Err(WardenError::Upstream(
                        self.upstream.to_string(),
                        format!("http status {}", response.status()),
                    ));
                }
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| WardenError::Upstream(self.upstream.to_string(), e.to_string()))?;
                DnsMessage::parse(&body).map_err(Into::into)
            }
        }
    }

    async fn resolve_addr(&self) -> Result<std::net::SocketAddr> {
        lookup_host((self.upstream.host.as_str(), self.upstream.port))
            .await?
            .next()
            .ok_or_else(|| {
                WardenError::Upstream(self.upstream.to_string(), "host did not resolve".into())
            })
    }

    async fn exchange_udp(&self, pool: &Mutex<Vec<PooledSocket>>, wire: &[u8]) -> Result<DnsMessage> {
        let addr = self.resolve_addr().await?;
        let socket = self.checkout_socket(pool).await?;
        socket.send_to(wire, addr).await?;

        let mut buf = vec![0u8; MAX_UDP_RESPONSE];
        let (len, from) = socket.recv_from(&mut buf).await?;
        if from != addr {
            return Err(WardenError::Upstream(
                self.upstream.to_string(),
                format!("response from unexpected peer {}", from),
            ));
        }
        let response = DnsMessage::parse(&buf[..len])?;
        self.return_socket(pool, socket);
        Ok(response)
    }

    async fn exchange_tcp(&self, wire: &[u8]) -> Result<DnsMessage> {
        let addr = self.resolve_addr().await?;
        let mut stream = TcpStream::connect(addr).await?;
        let response = exchange_framed(&mut stream, wire).await?;
        DnsMessage::parse(&response).map_err(Into::into)
    }

    async fn checkout_socket(&self, pool: &Mutex<Vec<PooledSocket>>) -> Result<UdpSocket> {
        {
            let mut pool = pool.lock();
            // Reap idle sockets, newest first survives.
            pool.retain(|entry| entry.last_used.elapsed() < UDP_IDLE_REAP);
            if let Some(entry) = pool.pop() {
                trace!("reusing pooled socket for {}", self.upstream);
                return Ok(entry.socket);
            }
        }
        let bind_addr = if self.upstream.host.contains(':') { "[::]:0" } else { "0.0.0.0:0" };
        Ok(UdpSocket::bind(bind_addr).await?)
    }

    fn return_socket(&self, pool: &Mutex<Vec<PooledSocket>>, socket: UdpSocket) {
        let mut pool = pool.lock();
        if pool.len() < MAX_POOLED_SOCKETS {
            pool.push(PooledSocket { socket, last_used: Instant::now() });
        }
    }
}

/// Two-byte length-framed exchange used by DNS over TCP and TLS.
async fn exchange_framed<S>(stream: &mut S, wire: &[u8]) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = u16::try_from(wire.len())
        .map_err(|_| WardenError::Upstream("tcp".into(), "query too large".into()))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(wire).await?;
    stream.flush().await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let response_len = u16::from_be_bytes(len_buf) as usize;
    let mut response = vec![0u8; response_len];
    stream.read_exact(&mut response).await?;
    Ok(response)
}

fn client_tls_config(upstream: &Upstream) -> Result<rustls::ClientConfig> {
    let config = if upstream.fingerprints.is_empty() {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(FingerprintVerifier::new(
                upstream.fingerprints.clone(),
            )))
            .with_no_client_auth()
    };
    Ok(config)
}

/// Accepts exactly the certificates whose SHA-256 digest is pinned in the
/// upstream definition; PKI validation is bypassed, signatures are still
/// verified.
#[derive(Debug)]
struct FingerprintVerifier {
    fingerprints: Vec<String>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl FingerprintVerifier {
    fn new(fingerprints: Vec<String>) -> Self {
        Self {
            fingerprints,
            algorithms: rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let digest = ring::digest::digest(&ring::digest::SHA256, end_entity.as_ref());
        let fingerprint = hex::encode(digest.as_ref());
        if self
            .fingerprints
            .iter()
            .any(|expected| expected.eq_ignore_ascii_case(&fingerprint))
        {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(format!(
                "certificate fingerprint {} is not pinned",
                fingerprint
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::enums::RecordType;
    use std::net::Ipv4Addr;

    /// A UDP socket that answers every query with a fixed A record.
    async fn spawn_mock_upstream(answer: Ipv4Addr) -> std::net::SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                let Ok(query) = DnsMessage::parse(&buf[..len]) else { continue };
                let mut response = DnsMessage::response_for(&query);
                response.answers.push(crate::dns::ResourceRecord::a(
                    query.question_name().to_string(),
                    123,
                    answer,
                ));
                let _ = socket.send_to(&response.serialize().unwrap(), from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn plain_udp_exchange() {
        let addr = spawn_mock_upstream(Ipv4Addr::new(1, 2, 3, 4)).await;
        let upstream: Upstream = format!("tcp+udp:{}:{}", addr.ip(), addr.port()).parse().unwrap();
        let client = UpstreamClient::build(&upstream).unwrap();

        let mut query = DnsMessage::new_query("example.com", RecordType::A);
        query.set_id(77);
        let cancel = CancellationToken::new();
        let response = client.exchange(&query, Duration::from_secs(2), &cancel).await.unwrap();
        assert_eq!(response.id(), 77);
        assert_eq!(response.answers[0].rdata.ip().unwrap().to_string(), "1.2.3.4");
    }

    #[tokio::test]
    async fn cancelled_exchange_returns_cancelled() {
        // 192.0.2.0/24 is TEST-NET; nothing will answer.
        let upstream: Upstream = "tcp+udp:192.0.2.1:53".parse().unwrap();
        let client = UpstreamClient::build(&upstream).unwrap();
        let query = DnsMessage::new_query("example.com", RecordType::A);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client.exchange(&query, Duration::from_secs(2), &cancel).await.unwrap_err();
        assert!(matches!(err, WardenError::Cancelled));
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let upstream: Upstream = "tcp+udp:192.0.2.1:53".parse().unwrap();
        let client = UpstreamClient::build(&upstream).unwrap();
        let query = DnsMessage::new_query("example.com", RecordType::A);
        let cancel = CancellationToken::new();
        let err = client.exchange(&query, Duration::from_millis(50), &cancel).await.unwrap_err();
        assert!(matches!(err, WardenError::UpstreamTimeout));
    }
}
