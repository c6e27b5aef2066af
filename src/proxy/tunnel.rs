//! CONNECT tunnel establishment
//!
//! One attempt dials the upstream hop (optionally over TLS), sends a CONNECT
//! frame, reads the response head and, once the tunnel is up, optionally runs
//! a TLS handshake to the real target through it. Every socket the attempt
//! opens is registered, and dropping the attempt at any point closes them.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::uri::Authority;
use rustls::ClientConfig;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::error::{Result, RotaError};
use crate::models::ProxyToConnect;
use crate::proxy::headers::{parse_body_error, ConnectResponseHead, HeaderSet};
use crate::proxy::sockets::{SocketLabel, SocketRegistry, SocketRole, TrackedStream};
use crate::proxy::tls::{connect_tls, target_client_config, TargetServerName};
use crate::proxy::transport::{ProxyStream, Transport};
use crate::proxy::url::format_authority;

const MAX_HEAD_BYTES: u64 = 16 * 1024;
const MAX_ERROR_BODY_BYTES: usize = 4096;
const ERROR_BODY_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_CHUNK_LINE_BYTES: u64 = 1024;

/// Lifecycle of one tunnel attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Connecting,
    TunnelPending,
    TunnelEstablished,
    TlsHandshaking,
    Ready,
    Failed,
    Cancelled,
}

impl TunnelState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TunnelState::Ready | TunnelState::Failed | TunnelState::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TunnelState) -> bool {
        use TunnelState::*;

        match (self, next) {
            (Connecting, TunnelPending)
            | (TunnelPending, TunnelEstablished)
            | (TunnelEstablished, TlsHandshaking)
            | (TunnelEstablished, Ready)
            | (TlsHandshaking, Ready) => true,
            (current, Failed) | (current, Cancelled) => !current.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug)]
struct TunnelAttempt {
    id: Uuid,
    origin: &'static str,
    state: TunnelState,
    started: Instant,
}

impl TunnelAttempt {
    fn new(origin: &'static str) -> Self {
        let attempt = Self {
            id: Uuid::new_v4(),
            origin,
            state: TunnelState::Connecting,
            started: Instant::now(),
        };
        debug!(attempt_id = %attempt.id, origin, "Tunnel attempt started");
        attempt
    }

    fn advance(&mut self, next: TunnelState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(RotaError::Internal(format!(
                "illegal tunnel transition {:?} -> {:?}",
                self.state, next
            )));
        }
        debug!(attempt_id = %self.id, from = ?self.state, to = ?next, "Tunnel state changed");
        self.state = next;
        Ok(())
    }

    fn fail(&mut self, error: &RotaError) {
        let next = match error {
            RotaError::Cancelled => TunnelState::Cancelled,
            _ => TunnelState::Failed,
        };
        if self.state.can_transition_to(next) {
            self.state = next;
        }
        debug!(
            attempt_id = %self.id,
            origin = self.origin,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            error = %error,
            "Tunnel attempt failed"
        );
    }
}

impl Drop for TunnelAttempt {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.state = TunnelState::Cancelled;
            debug!(attempt_id = %self.id, origin = self.origin, "Tunnel attempt abandoned");
        }
    }
}

/// TLS settings for the connection to the upstream proxy itself
#[derive(Debug, Clone)]
pub struct HopTls {
    pub config: Arc<ClientConfig>,
    pub server_name: TargetServerName,
}

/// The upstream proxy a connection is dialed to
#[derive(Debug, Clone)]
pub struct Hop {
    pub hostname: String,
    pub port: u16,
    pub tls: Option<HopTls>,
}

impl Hop {
    pub fn plain(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            tls: None,
        }
    }

    pub fn with_tls(mut self, tls: HopTls) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn authority(&self) -> String {
        format_authority(&self.hostname, self.port)
    }

    /// Open a registered connection to the hop, running its TLS handshake if any
    pub async fn dial(
        &self,
        sockets: &SocketRegistry,
        origin: &'static str,
        idle_timeout: Duration,
    ) -> Result<ProxyStream> {
        let lease = sockets.add(SocketLabel::new(origin, SocketRole::ProxyHop));
        let tcp = TcpStream::connect((self.hostname.as_str(), self.port)).await?;
        let tracked = TrackedStream::new(tcp, lease).with_idle_timeout(idle_timeout);

        match &self.tls {
            Some(tls) => {
                let stream = connect_tls(tls.config.clone(), &tls.server_name, tracked).await?;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(tracked)),
        }
    }
}

/// Where the rejection reason of a refused CONNECT is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonSource {
    /// Error header, else the status text
    Header,
    /// Error header, else the drained body, else the status text
    Body,
}

/// Everything needed to run one tunnel attempt
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    /// Provenance recorded on every registered socket
    pub origin: &'static str,
    pub hop: Hop,
    /// CONNECT request target, `host:port`
    pub authority: String,
    pub headers: HeaderSet,
    /// Headers carrying an upstream's rejection reason, in lookup order
    pub error_headers: &'static [&'static str],
    pub reason: ReasonSource,
    /// Run a TLS handshake to the target over the tunnel
    pub target_tls: Option<TargetServerName>,
    pub idle_timeout: Duration,
}

impl TunnelRequest {
    /// The CONNECT request head. Rejects a target or header that would break
    /// the request framing.
    fn connect_frame(&self) -> Result<String> {
        validate_connect_target(&self.authority)?;

        let mut frame = format!("CONNECT {} HTTP/1.1\r\n", self.authority);
        self.headers
            .clone()
            .with_default("Host", self.authority.clone())
            .write_to(&mut frame)?;
        frame.push_str("\r\n");
        Ok(frame)
    }
}

/// A CONNECT target must be a bare `host:port` authority
fn validate_connect_target(target: &str) -> Result<()> {
    let invalid = |why: &str| RotaError::InvalidUrl(format!("CONNECT target {:?} {}", target, why));

    let authority: Authority = target.parse().map_err(|_| invalid("is not an authority"))?;
    if authority.as_str().contains('@') {
        return Err(invalid("must not carry credentials"));
    }
    if authority.port_u16().is_none() {
        return Err(invalid("has no port"));
    }
    Ok(())
}

/// Run one tunnel attempt to completion.
///
/// Resolves exactly once: with the ready stream, a [`crate::error::TransportError`]
/// when the upstream answered with a non-200 status, or the local error.
#[instrument(skip_all, fields(origin = request.origin, hop = %request.hop.authority(), authority = %request.authority))]
pub async fn establish(request: &TunnelRequest, sockets: &SocketRegistry) -> Result<ProxyStream> {
    let mut attempt = TunnelAttempt::new(request.origin);
    match run_attempt(&mut attempt, request, sockets).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            attempt.fail(&e);
            Err(e)
        }
    }
}

async fn run_attempt(
    attempt: &mut TunnelAttempt,
    request: &TunnelRequest,
    sockets: &SocketRegistry,
) -> Result<ProxyStream> {
    let frame = request.connect_frame()?;

    let hop = request
        .hop
        .dial(sockets, request.origin, request.idle_timeout)
        .await?;
    attempt.advance(TunnelState::TunnelPending)?;

    let mut reader = BufReader::new(hop);
    reader.write_all(frame.as_bytes()).await?;
    reader.flush().await?;

    let head = read_response_head(&mut reader).await?;
    if !head.is_success() {
        let err = match request.reason {
            ReasonSource::Header => head.to_transport_error(request.error_headers),
            ReasonSource::Body => {
                let body = drain_error_body(&mut reader, &head).await;
                parse_body_error(&head, &body, request.error_headers)
            }
        };
        warn!(status = err.status_code, reason = %err.reason, "Upstream refused tunnel");
        return Err(err.into());
    }
    attempt.advance(TunnelState::TunnelEstablished)?;

    let Some(server_name) = &request.target_tls else {
        let lease = sockets.add(SocketLabel::new(request.origin, SocketRole::Tunnel));
        let tunnel = TrackedStream::new(reader, lease).with_idle_timeout(request.idle_timeout);
        attempt.advance(TunnelState::Ready)?;
        return Ok(Box::new(tunnel));
    };

    attempt.advance(TunnelState::TlsHandshaking)?;
    let lease = sockets.add(SocketLabel::new(request.origin, SocketRole::TargetTls));
    let tls = connect_tls(target_client_config()?, server_name, reader).await?;
    let tls = TrackedStream::new(tls, lease).with_idle_timeout(request.idle_timeout);
    attempt.advance(TunnelState::Ready)?;
    Ok(Box::new(tls))
}

/// Read up to and including the blank line ending a response head.
///
/// Bytes after the head stay buffered in `reader`.
async fn read_response_head<R>(reader: &mut R) -> Result<ConnectResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    let mut limited = (&mut *reader).take(MAX_HEAD_BYTES);
    let mut buf = Vec::with_capacity(256);

    loop {
        let n = limited.read_until(b'\n', &mut buf).await?;
        if buf.ends_with(b"\r\n\r\n") || buf.ends_with(b"\n\n") {
            break;
        }
        if limited.limit() == 0 {
            return Err(RotaError::MalformedResponse(
                "response head too large".to_string(),
            ));
        }
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream closed the connection before answering CONNECT",
            )
            .into());
        }
    }

    ConnectResponseHead::parse(&buf)
}

/// Bounded, time-limited read of a refused CONNECT's body
async fn drain_error_body<R>(reader: &mut R, head: &ConnectResponseHead) -> Vec<u8>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    let outcome = if head.is_chunked() {
        tokio::time::timeout(ERROR_BODY_DRAIN_TIMEOUT, read_chunked(reader, &mut body)).await
    } else {
        let limit = match head.content_length() {
            Some(0) => return body,
            Some(n) => n.min(MAX_ERROR_BODY_BYTES),
            None => MAX_ERROR_BODY_BYTES,
        };
        let mut limited = reader.take(limit as u64);
        tokio::time::timeout(ERROR_BODY_DRAIN_TIMEOUT, limited.read_to_end(&mut body))
            .await
            .map(|res| res.map(|_| ()))
    };

    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => debug!(error = %e, "Error body drain failed"),
        Err(_) => debug!(bytes = body.len(), "Error body drain timed out"),
    }
    body
}

/// Decode a chunked body into `body`, keeping at most
/// `MAX_ERROR_BODY_BYTES`. Stops at the last chunk; trailers are not read.
async fn read_chunked<R>(reader: &mut R, body: &mut Vec<u8>) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(16);
    loop {
        line.clear();
        (&mut *reader)
            .take(MAX_CHUNK_LINE_BYTES)
            .read_until(b'\n', &mut line)
            .await?;

        let size = match httparse::parse_chunk_size(&line) {
            Ok(httparse::Status::Complete((_, size))) => size,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "malformed chunk size line",
                ))
            }
        };
        if size == 0 {
            return Ok(());
        }

        let room = (MAX_ERROR_BODY_BYTES - body.len()) as u64;
        let wanted = size.min(room);
        let read = (&mut *reader).take(wanted).read_to_end(body).await?;
        if (read as u64) < wanted {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        if wanted < size {
            // cap reached, the rest of the body is not needed
            return Ok(());
        }

        line.clear();
        (&mut *reader)
            .take(MAX_CHUNK_LINE_BYTES)
            .read_until(b'\n', &mut line)
            .await?;
    }
}

/// A tunnel attempt running as its own task
pub struct TunnelHandle {
    id: Uuid,
    cancel: CancellationToken,
    rx: oneshot::Receiver<Result<ProxyStream>>,
}

impl TunnelHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Abort the attempt. Its sockets are destroyed and the outcome becomes
    /// [`RotaError::Cancelled`] unless it already completed.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for the single outcome of the attempt
    pub async fn result(self) -> Result<ProxyStream> {
        self.rx.await.unwrap_or_else(|_| {
            Err(RotaError::Internal(
                "tunnel task ended without a result".to_string(),
            ))
        })
    }
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("id", &self.id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Run `transport.connect` as an independent task
pub fn spawn_connect(
    transport: Arc<dyn Transport>,
    target: String,
    headers: HeaderSet,
    proxy: ProxyToConnect,
    sockets: SocketRegistry,
    timeout: Duration,
) -> TunnelHandle {
    let id = Uuid::new_v4();
    let cancel = CancellationToken::new();
    let (tx, rx) = oneshot::channel();

    let token = cancel.clone();
    let span = info_span!("tunnel_task", attempt_id = %id, proxy_id = %proxy.id, target = %target);
    tokio::spawn(
        async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(RotaError::Cancelled),
                res = transport.connect(&target, headers, &proxy, &sockets, timeout) => res,
            };

            if let Err(e) = &result {
                debug!(error = %e, "Tunnel task finished with error");
            }
            if tx.send(result).is_err() {
                debug!("Tunnel handle dropped, discarding result");
            }
        }
        .instrument(span),
    );

    TunnelHandle { id, cancel, rx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::proxy::testing::{
        round_trip, spawn_echo_target, spawn_proxy, spawn_tls_echo_target, ProxyReply, TestCert,
    };
    use tokio::net::TcpListener;

    fn request(hop_port: u16, authority: &str) -> TunnelRequest {
        TunnelRequest {
            origin: "test:tunnel",
            hop: Hop::plain("127.0.0.1", hop_port),
            authority: authority.to_string(),
            headers: HeaderSet::new().with("X-Test", "1"),
            error_headers: &["x-rota-proxyerror"],
            reason: ReasonSource::Body,
            target_tls: None,
            idle_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_state_transitions() {
        use TunnelState::*;

        assert!(Connecting.can_transition_to(TunnelPending));
        assert!(TunnelEstablished.can_transition_to(Ready));
        assert!(TunnelEstablished.can_transition_to(TlsHandshaking));
        assert!(TlsHandshaking.can_transition_to(Ready));
        assert!(Connecting.can_transition_to(Failed));
        assert!(TlsHandshaking.can_transition_to(Cancelled));

        assert!(!Connecting.can_transition_to(Ready));
        assert!(!TunnelPending.can_transition_to(TlsHandshaking));
        assert!(!Ready.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Cancelled));
        assert!(Ready.is_terminal() && Failed.is_terminal() && Cancelled.is_terminal());
    }

    #[test]
    fn test_attempt_rejects_illegal_transition() {
        let mut attempt = TunnelAttempt::new("test");
        assert!(attempt.advance(TunnelState::Ready).is_err());
        attempt.advance(TunnelState::TunnelPending).unwrap();
        attempt.fail(&RotaError::Cancelled);
        assert_eq!(attempt.state, TunnelState::Cancelled);
    }

    #[test]
    fn test_connect_frame() {
        let frame = request(1, "example.com:443").connect_frame().unwrap();
        assert_eq!(
            frame,
            "CONNECT example.com:443 HTTP/1.1\r\nX-Test: 1\r\nHost: example.com:443\r\n\r\n"
        );

        let frame = request(1, "[2001:db8::1]:443").connect_frame().unwrap();
        assert!(frame.starts_with("CONNECT [2001:db8::1]:443 HTTP/1.1\r\n"));
    }

    #[test]
    fn test_connect_frame_rejects_bad_targets() {
        for target in [
            "example.com:443 HTTP/1.1\r\nX-Injected: yes\r\nX-Pad: x",
            "example.com",
            "user:pw@example.com:443",
            "",
        ] {
            let err = request(1, target).connect_frame().unwrap_err();
            assert!(matches!(err, RotaError::InvalidUrl(_)), "{:?}: {:?}", target, err);
        }
    }

    #[tokio::test]
    async fn test_injected_header_fails_before_dialing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let sockets = SocketRegistry::new();

        let mut req = request(port, "example.com:443");
        req.headers = req.headers.with("X-Caller", "v\r\nX-Smuggled: 1");

        let err = establish(&req, &sockets).await.err().unwrap();
        assert!(matches!(err, RotaError::InvalidHeader(_)));
        assert!(!err.is_network_error());
        assert!(sockets.is_empty());

        // the upstream never saw a connection
        let accepted = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(accepted.is_err());
    }

    #[tokio::test]
    async fn test_response_head_split_across_reads() {
        let mock = tokio_test::io::Builder::new()
            .read(b"HTTP/1.1 200 Connection")
            .read(b" Established\r\nVia: test\r\n")
            .read(b"\r\nearly")
            .build();
        let mut reader = BufReader::new(mock);

        let head = read_response_head(&mut reader).await.unwrap();
        assert!(head.is_success());
        assert_eq!(head.reason, "Connection Established");
        assert_eq!(head.headers.get("via"), Some("test"));

        // bytes after the head stay readable
        let mut rest = [0u8; 5];
        reader.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"early");
    }

    #[tokio::test]
    async fn test_error_body_drain_respects_content_length() {
        let mock = tokio_test::io::Builder::new()
            .read(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 4\r\n\r\n")
            .read(b"deny")
            .build();
        let mut reader = BufReader::new(mock);

        let head = read_response_head(&mut reader).await.unwrap();
        assert_eq!(head.content_length(), Some(4));
        assert_eq!(drain_error_body(&mut reader, &head).await, b"deny");
    }

    #[tokio::test]
    async fn test_error_body_drain_decodes_chunks() {
        let mock = tokio_test::io::Builder::new()
            .read(b"HTTP/1.1 407 Proxy Authentication Required\r\nTransfer-Encoding: chunked\r\n\r\n")
            .read(b"5\r\n{\"mes\r\n")
            .read(b"18;ext=1\r\nsage\":\"bad credentials\"}\r\n")
            .read(b"0\r\n\r\n")
            .build();
        let mut reader = BufReader::new(mock);

        let head = read_response_head(&mut reader).await.unwrap();
        assert_eq!(
            drain_error_body(&mut reader, &head).await,
            br#"{"message":"bad credentials"}"#
        );
    }

    #[tokio::test]
    async fn test_establish_plain_tunnel() {
        let target = spawn_echo_target().await;
        let (proxy, head) = spawn_proxy(ProxyReply::Tunnel(target), None).await;
        let sockets = SocketRegistry::new();

        let mut stream = establish(&request(proxy.port(), "example.com:80"), &sockets)
            .await
            .unwrap();

        let head = head.await.unwrap();
        assert!(head.starts_with("CONNECT example.com:80 HTTP/1.1\r\n"));
        assert!(head.contains("X-Test: 1\r\n"));

        assert_eq!(round_trip(&mut stream, b"ping").await, b"ping");
        assert_eq!(sockets.count_by_role(SocketRole::ProxyHop), 1);
        assert_eq!(sockets.count_by_role(SocketRole::Tunnel), 1);

        drop(stream);
        assert!(sockets.is_empty());
    }

    #[tokio::test]
    async fn test_establish_tls_over_tunnel() {
        let cert = TestCert::generate();
        let (target, sni) = spawn_tls_echo_target(&cert).await;
        let (proxy, _head) = spawn_proxy(ProxyReply::Tunnel(target), None).await;
        let sockets = SocketRegistry::new();

        let mut req = request(proxy.port(), "example.com:443");
        req.target_tls = Some(TargetServerName::for_host("example.com").unwrap());

        let mut stream = establish(&req, &sockets).await.unwrap();
        assert_eq!(round_trip(&mut stream, b"secure").await, b"secure");
        assert_eq!(sni.await.unwrap().as_deref(), Some("example.com"));
        assert_eq!(sockets.count_by_role(SocketRole::TargetTls), 1);

        drop(stream);
        assert!(sockets.is_empty());
    }

    #[tokio::test]
    async fn test_rejection_reason_from_header() {
        let (proxy, _head) = spawn_proxy(
            ProxyReply::reject("403 Forbidden", vec![("x-rota-proxyerror", "\"quota exceeded\"")]),
            None,
        )
        .await;
        let sockets = SocketRegistry::new();

        let err = establish(&request(proxy.port(), "example.com:443"), &sockets)
            .await
            .err()
            .unwrap();
        assert_eq!(
            err.as_transport_error(),
            Some(&TransportError::new(403, "quota exceeded"))
        );
        assert!(sockets.is_empty());
    }

    #[tokio::test]
    async fn test_rejection_reason_from_body() {
        let (proxy, _head) = spawn_proxy(
            ProxyReply::Respond {
                status: "407 Proxy Authentication Required",
                headers: vec![("Content-Type", "application/json")],
                body: r#"{"message":"bad credentials"}"#,
            },
            None,
        )
        .await;
        let sockets = SocketRegistry::new();

        let err = establish(&request(proxy.port(), "example.com:443"), &sockets)
            .await
            .err()
            .unwrap();
        assert_eq!(
            err.as_transport_error(),
            Some(&TransportError::new(407, "bad credentials"))
        );
        assert!(sockets.is_empty());
    }

    #[tokio::test]
    async fn test_rejection_reason_from_chunked_body() {
        // answers with a chunked body and keeps the connection open
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            let _ = stream.read(&mut buf).await;
            stream
                .write_all(
                    b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                      Transfer-Encoding: chunked\r\n\r\n\
                      1d\r\n{\"message\":\"bad credentials\"}\r\n0\r\n\r\n",
                )
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });
        let sockets = SocketRegistry::new();

        let started = Instant::now();
        let err = establish(&request(port, "example.com:443"), &sockets)
            .await
            .err()
            .unwrap();
        assert_eq!(
            err.as_transport_error(),
            Some(&TransportError::new(407, "bad credentials"))
        );
        assert!(started.elapsed() < ERROR_BODY_DRAIN_TIMEOUT);
        assert!(sockets.is_empty());
        server.abort();
    }

    #[tokio::test]
    async fn test_header_only_reason_ignores_body() {
        let (proxy, _head) = spawn_proxy(
            ProxyReply::Respond {
                status: "502 Bad Gateway",
                headers: vec![],
                body: "upstream exploded",
            },
            None,
        )
        .await;

        let mut req = request(proxy.port(), "example.com:443");
        req.reason = ReasonSource::Header;

        let err = establish(&req, &SocketRegistry::new()).await.err().unwrap();
        assert_eq!(
            err.as_transport_error(),
            Some(&TransportError::new(502, "Bad Gateway"))
        );
    }

    #[tokio::test]
    async fn test_refused_hop_is_local_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let sockets = SocketRegistry::new();

        let err = establish(&request(port, "example.com:443"), &sockets)
            .await
            .err()
            .unwrap();
        assert!(err.is_network_error());
        assert!(!err.is_upstream_rejection());
        assert!(sockets.is_empty());
    }

    #[tokio::test]
    async fn test_early_close_is_local_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(b"HTTP/1.1 200 Conn").await;
        });
        let sockets = SocketRegistry::new();

        let err = establish(&request(port, "example.com:443"), &sockets)
            .await
            .err()
            .unwrap();
        assert!(err.is_network_error());
        assert!(sockets.is_empty());
    }

    #[tokio::test]
    async fn test_idle_upstream_times_out() {
        // accepts but never answers CONNECT
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });
        let sockets = SocketRegistry::new();

        let mut req = request(port, "example.com:443");
        req.idle_timeout = Duration::from_millis(100);

        let err = establish(&req, &sockets).await.err().unwrap();
        assert!(matches!(err, RotaError::Io(ref e) if e.kind() == io::ErrorKind::TimedOut));
        assert!(sockets.is_empty());
        server.abort();
    }
}
