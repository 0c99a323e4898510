use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{Semaphore, broadcast};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dns::DnsMessage;
use crate::dns::enums::{Opcode, Rcode};
use crate::error::{Result, WardenError};
use crate::metrics::Metrics;
use crate::model::{Protocol, Request};
use crate::resolver::NextResolver;

const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TCP_MESSAGE: usize = 65535;

/// Shared state of all DNS listeners.
#[derive(Clone)]
pub struct ServerContext {
    pub chain: NextResolver,
    pub metrics: Arc<Metrics>,
    pub query_semaphore: Arc<Semaphore>,
    pub cancel: CancellationToken,
}

impl ServerContext {
    /// Process one wire-format query and produce the wire-format answer.
    ///
    /// Malformed input yields FORMERR where an id is recoverable, non-query
    /// opcodes yield NOTIMP, chain errors yield SERVFAIL; `None` means the
    /// packet is unanswerable (or the request was cancelled) and is dropped.
    pub async fn handle_message(&self, buf: &[u8], client_ip: IpAddr, protocol: Protocol) -> Option<Vec<u8>> {
        let protocol_label = protocol.to_string();
        let query = match DnsMessage::parse(buf) {
            Ok(query) => query,
            Err(e) => {
                debug!("malformed packet from {}: {}", client_ip, e);
                self.metrics
                    .malformed_packets
                    .with_label_values(&[&protocol_label, "parse_error"])
                    .inc();
                // Salvage the id so the client sees FORMERR, not a timeout.
                if buf.len() >= 12 {
                    let mut response = DnsMessage::default();
                    response.header.id = u16::from_be_bytes([buf[0], buf[1]]);
                    response.header.qr = true;
                    response.set_rcode(Rcode::FormErr);
                    return response.serialize().ok();
                }
                return None;
            }
        };
        if !query.is_query() {
            self.metrics
                .malformed_packets
                .with_label_values(&[&protocol_label, "not_query"])
                .inc();
            return None;
        }
        if query.opcode() != Opcode::Query {
            debug!("unsupported opcode {:?} from {}", query.opcode(), client_ip);
            return DnsMessage::error_response(&query, Rcode::NotImp).serialize().ok();
        }
        if query.questions.is_empty() {
            self.metrics
                .malformed_packets
                .with_label_values(&[&protocol_label, "no_question"])
                .inc();
            return DnsMessage::error_response(&query, Rcode::FormErr).serialize().ok();
        }

        let mut request =
            Request::new(query.clone(), client_ip, protocol).with_cancel(self.cancel.child_token());

        // A panicking resolver must not take the listener down; it becomes
        // a SERVFAIL like any other internal failure.
        let outcome = std::panic::AssertUnwindSafe(self.chain.resolve(&mut request))
            .catch_unwind()
            .await;
        let message = match outcome {
            Ok(Ok(response)) => response.message,
            Ok(Err(WardenError::Cancelled)) => return None,
            Ok(Err(e)) => {
                warn!("query for {} failed: {}", query.question_name(), e);
                DnsMessage::error_response(&query, Rcode::ServFail)
            }
            Err(panic) => {
                error!("resolver panicked handling {}: {:?}", query.question_name(), panic);
                DnsMessage::error_response(&query, Rcode::ServFail)
            }
        };
        message.serialize().ok()
    }
}

/// UDP listener. Each datagram is handled on its own task; responses larger
/// than the client's advertised payload size are replaced by a truncated
/// answer.
pub async fn run_udp_server(
    bind_addr: SocketAddr,
    context: ServerContext,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
    info!("UDP DNS server listening on {}", bind_addr);
    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("UDP server shutting down");
                return Ok(());
            }
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = received?;
                let Ok(permit) = context.query_semaphore.clone().try_acquire_owned() else {
                    warn!("query limit reached, dropping datagram from {}", peer);
                    continue;
                };
                let query_data = buf[..len].to_vec();
                let socket = socket.clone();
                let context = context.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let Some(response) = context
                        .handle_message(&query_data, peer.ip(), Protocol::Udp)
                        .await
                    else {
                        return;
                    };
                    let response = clamp_udp_response(&context, &query_data, response);
                    if let Err(e) = socket.send_to(&response, peer).await {
                        warn!("failed to send UDP response to {}: {}", peer, e);
                    }
                });
            }
        }
    }
}

fn clamp_udp_response(context: &ServerContext, query_data: &[u8], response: Vec<u8>) -> Vec<u8> {
    let max_size = DnsMessage::parse(query_data)
        .map(|q| q.max_udp_payload_size())
        .unwrap_or(512) as usize;
    if response.len() <= max_size {
        return response;
    }
    context.metrics.truncated_responses.inc();
    match DnsMessage::parse(query_data)
        .map(|q| DnsMessage::truncated_response_for(&q))
        .and_then(|m| m.serialize())
    {
        Ok(truncated) => truncated,
        Err(_) => response,
    }
}

/// TCP listener with two-byte length framing and an idle timeout per
/// connection.
pub async fn run_tcp_server(
    bind_addr: SocketAddr,
    context: ServerContext,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!("TCP DNS server listening on {}", bind_addr);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("TCP server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let context = context.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_stream(stream, peer, context, Protocol::Tcp).await {
                        debug!("TCP connection from {} ended: {}", peer, e);
                    }
                });
            }
        }
    }
}

/// DNS-over-TLS listener (RFC 7858).
pub async fn run_dot_server(
    bind_addr: SocketAddr,
    cert_file: &Path,
    key_file: &Path,
    context: ServerContext,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(load_server_tls(cert_file, key_file)?);
    let listener = TcpListener::bind(bind_addr).await?;
    info!("DoT server listening on {}", bind_addr);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("DoT server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let acceptor = acceptor.clone();
                let context = context.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(tls_stream) => tls_stream,
                        Err(e) => {
                            debug!("TLS handshake with {} failed: {}", peer, e);
                            return;
                        }
                    };
                    if let Err(e) = serve_stream(tls_stream, peer, context, Protocol::Tls).await {
                        debug!("DoT connection from {} ended: {}", peer, e);
                    }
                });
            }
        }
    }
}

/// Serve length-framed queries on one stream until EOF or idle timeout.
async fn serve_stream<S>(
    mut stream: S,
    peer: SocketAddr,
    context: ServerContext,
    protocol: Protocol,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        let mut len_buf = [0u8; 2];
        match tokio::time::timeout(TCP_IDLE_TIMEOUT, stream.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => return Ok(()), // EOF or idle
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_TCP_MESSAGE {
            return Ok(());
        }
        let mut message = vec![0u8; len];
        stream.read_exact(&mut message).await?;

        let _permit = match context.query_semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("query limit reached, closing connection from {}", peer);
                return Ok(());
            }
        };
        if let Some(response) = context.handle_message(&message, peer.ip(), protocol).await {
            let len = u16::try_from(response.len())
                .map_err(|_| WardenError::Wire(crate::dns::wire::WireError::InvalidRecord))?;
            stream.write_all(&len.to_be_bytes()).await?;
            stream.write_all(&response).await?;
            stream.flush().await?;
        }
    }
}

/// Server-side TLS config from PEM cert chain + key files. Certificate
/// management (issuing, rotation) is out of scope; only the paths come
/// from the configuration.
pub fn load_server_tls(cert_file: &Path, key_file: &Path) -> Result<Arc<rustls::ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
        std::fs::File::open(cert_file)
            .map_err(|e| WardenError::Tls(format!("{}: {}", cert_file.display(), e)))?,
    ))
    .collect::<std::result::Result<Vec<_>, _>>()
    .map_err(|e| WardenError::Tls(format!("invalid certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(WardenError::Tls(format!("no certificate found in {}", cert_file.display())));
    }
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(key_file)
            .map_err(|e| WardenError::Tls(format!("{}: {}", key_file.display(), e)))?,
    ))
    .map_err(|e| WardenError::Tls(format!("invalid private key: {}", e)))?
    .ok_or_else(|| WardenError::Tls(format!("no private key found in {}", key_file.display())))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| WardenError::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}
