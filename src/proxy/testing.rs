//! Fixtures for transport tests: self-signed certificates, fake CONNECT
//! proxies and echo targets bound to loopback.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;

use crate::models::CertificateInfo;
use crate::proxy::tls::crypto_provider;

pub struct TestCert {
    pub der: CertificateDer<'static>,
    pub cert_pem: String,
    pub key_pem: String,
}

impl TestCert {
    pub fn generate() -> Self {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        Self {
            der: cert.der().clone(),
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        }
    }

    pub fn info(&self) -> CertificateInfo {
        CertificateInfo {
            cert: self.cert_pem.clone(),
            key: self.key_pem.clone(),
        }
    }

    pub fn key_der(&self) -> PrivateKeyDer<'static> {
        rustls_pemfile::private_key(&mut self.key_pem.as_bytes())
            .unwrap()
            .unwrap()
    }
}

/// Server side acceptor presenting `cert`, no client authentication
pub fn tls_acceptor(cert: &TestCert) -> TlsAcceptor {
    let config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.der.clone()], cert.key_der())
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// Server side acceptor presenting `cert` and demanding it back from the client
pub fn mtls_acceptor(cert: &TestCert) -> TlsAcceptor {
    let verifier = Arc::new(ExpectClientCert {
        expected: cert.der.clone(),
    });
    let config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_client_cert_verifier(verifier)
        .with_single_cert(vec![cert.der.clone()], cert.key_der())
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

#[derive(Debug)]
struct ExpectClientCert {
    expected: CertificateDer<'static>,
}

impl ClientCertVerifier for ExpectClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.expected.as_ref() {
            Ok(ClientCertVerified::assertion())
        } else {
            Err(rustls::Error::General("unexpected client certificate".into()))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &crypto_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &crypto_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        crypto_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// What a fake upstream does once it has read a request head
pub enum ProxyReply {
    /// Answer 200 and relay bytes to the given address
    Tunnel(SocketAddr),
    /// Answer with this response and close
    Respond {
        status: &'static str,
        headers: Vec<(&'static str, &'static str)>,
        body: &'static str,
    },
}

impl ProxyReply {
    pub fn reject(status: &'static str, headers: Vec<(&'static str, &'static str)>) -> Self {
        ProxyReply::Respond {
            status,
            headers,
            body: "",
        }
    }
}

/// Single-connection fake upstream proxy.
///
/// Resolves with the request head it received, before acting on `reply`.
pub async fn spawn_proxy(
    reply: ProxyReply,
    tls: Option<TlsAcceptor>,
) -> (SocketAddr, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (head_tx, head_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        match tls {
            Some(acceptor) => {
                let stream = acceptor.accept(tcp).await.unwrap();
                serve(stream, reply, head_tx).await;
            }
            None => serve(tcp, reply, head_tx).await,
        }
    });

    (addr, head_rx)
}

async fn serve<S>(stream: S, reply: ProxyReply, head_tx: oneshot::Sender<String>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let head = read_head(&mut reader).await;
    let _ = head_tx.send(head);

    match reply {
        ProxyReply::Tunnel(target) => {
            reader
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await
                .unwrap();
            let mut upstream = TcpStream::connect(target).await.unwrap();
            let _ = tokio::io::copy_bidirectional(&mut reader, &mut upstream).await;
        }
        ProxyReply::Respond {
            status,
            headers,
            body,
        } => {
            let mut response = format!("HTTP/1.1 {}\r\n", status);
            for (name, value) in headers {
                response.push_str(&format!("{}: {}\r\n", name, value));
            }
            response.push_str(&format!(
                "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            ));
            reader.write_all(response.as_bytes()).await.unwrap();
            let _ = reader.shutdown().await;
        }
    }
}

async fn read_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> String {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await.unwrap() == 0 {
            break;
        }
        let done = line == "\r\n";
        head.push_str(&line);
        if done {
            break;
        }
    }
    head
}

/// Plain TCP target echoing what it reads
pub async fn spawn_echo_target() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    addr
}

/// TLS target echoing what it reads; resolves with the SNI the client sent
pub async fn spawn_tls_echo_target(
    cert: &TestCert,
) -> (SocketAddr, oneshot::Receiver<Option<String>>) {
    let acceptor = tls_acceptor(cert);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (sni_tx, sni_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut stream = acceptor.accept(tcp).await.unwrap();
        let _ = sni_tx.send(stream.get_ref().1.server_name().map(str::to_string));

        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                    let _ = stream.flush().await;
                }
            }
        }
    });

    (addr, sni_rx)
}

/// Write `payload` and read the same number of bytes back
pub async fn round_trip<S>(stream: &mut S, payload: &[u8]) -> Vec<u8>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    stream.write_all(payload).await.unwrap();
    stream.flush().await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}
