//! Common utilities for integration tests
#![allow(dead_code)]

use proxy_agent::{ProxyEndpoint, ProxyProtocol};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener as TokioTcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::TlsAcceptor;

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Build an in-memory TLS acceptor with a self-signed certificate for localhost
pub fn test_tls_acceptor() -> TlsAcceptor {
    let certified = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .expect("Failed to generate test certificate");

    let cert_der = certified.cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified.signing_key.serialize_der(),
    ));

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .expect("Failed to build server TLS config");
    TlsAcceptor::from(Arc::new(config))
}

/// Endpoint pointing at a local mock proxy, with a short handshake timeout
pub fn local_endpoint(port: u16, protocol: ProxyProtocol) -> ProxyEndpoint {
    ProxyEndpoint::builder()
        .proxy_hostname("127.0.0.1")
        .proxy_port(port)
        .proxy_protocol(protocol)
        .proxy_connect_timeout(500)
        .skip_verify(true)
        .build()
        .expect("Failed to build endpoint")
}

/// What the mock proxy does once it has read the CONNECT request
#[derive(Clone)]
pub enum AfterReply {
    /// Keep the socket open without sending anything else
    Hold,
    /// Close the socket
    Close,
    /// Echo everything back (acts as a plain target)
    Echo,
    /// Accept TLS on the tunnel and echo (acts as an https target)
    TlsEcho(TlsAcceptor),
    /// Wait for the client side to close; reports `true` on EOF
    AwaitClose(mpsc::Sender<bool>),
}

/// Mock HTTP CONNECT proxy behaviour
#[derive(Clone)]
pub struct MockProxy {
    /// Bytes sent back after the request; `None` sends nothing
    pub reply: Option<Vec<u8>>,
    pub after: AfterReply,
    /// Terminate TLS on the proxy connection itself (https proxy)
    pub tls: Option<TlsAcceptor>,
}

impl MockProxy {
    pub fn replying(reply: &[u8], after: AfterReply) -> Self {
        Self {
            reply: Some(reply.to_vec()),
            after,
            tls: None,
        }
    }

    pub fn silent(after: AfterReply) -> Self {
        Self {
            reply: None,
            after,
            tls: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Start serving a single connection; returns the port and the captured request
    pub async fn start(self) -> (u16, oneshot::Receiver<Vec<u8>>) {
        let listener = TokioTcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock proxy");
        let port = listener.local_addr().expect("Failed to get local addr").port();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            match self.tls.clone() {
                Some(acceptor) => {
                    if let Ok(tls_stream) = acceptor.accept(socket).await {
                        serve_connect(tls_stream, self, tx).await;
                    }
                }
                None => serve_connect(socket, self, tx).await,
            }
        });

        (port, rx)
    }
}

async fn serve_connect<S>(mut stream: S, proxy: MockProxy, tx: oneshot::Sender<Vec<u8>>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }
    let _ = tx.send(request);

    if let Some(reply) = proxy.reply {
        if stream.write_all(&reply).await.is_err() {
            return;
        }
        let _ = stream.flush().await;
    }

    match proxy.after {
        AfterReply::Hold => tokio::time::sleep(Duration::from_secs(30)).await,
        AfterReply::Close => {
            let _ = stream.shutdown().await;
        }
        AfterReply::Echo => echo(stream).await,
        AfterReply::TlsEcho(acceptor) => {
            if let Ok(tls_stream) = acceptor.accept(stream).await {
                echo(tls_stream).await;
            }
        }
        AfterReply::AwaitClose(report) => {
            let mut buf = [0u8; 64];
            let closed = matches!(
                tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await,
                Ok(Ok(0))
            );
            let _ = report.send(closed).await;
        }
    }
}

/// Echo until the peer closes
pub async fn echo<S>(mut stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 8192];
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
}

/// Minimal SOCKS5 server (no auth, CONNECT only) that echoes after the handshake.
/// Returns the port and the requested (host, port).
pub async fn start_mock_socks5() -> (u16, oneshot::Receiver<(String, u16)>) {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind mock SOCKS5 server");
    let port = listener.local_addr().expect("Failed to get local addr").port();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };

        // greeting: VER NMETHODS METHODS...
        let mut head = [0u8; 2];
        if socket.read_exact(&mut head).await.is_err() {
            return;
        }
        let mut methods = vec![0u8; head[1] as usize];
        if socket.read_exact(&mut methods).await.is_err() {
            return;
        }
        if socket.write_all(&[0x05, 0x00]).await.is_err() {
            return;
        }

        // request: VER CMD RSV ATYP ADDR PORT
        let mut req = [0u8; 4];
        if socket.read_exact(&mut req).await.is_err() {
            return;
        }
        let host = match req[3] {
            0x01 => {
                let mut ip = [0u8; 4];
                if socket.read_exact(&mut ip).await.is_err() {
                    return;
                }
                std::net::Ipv4Addr::from(ip).to_string()
            }
            0x03 => {
                let mut len = [0u8; 1];
                if socket.read_exact(&mut len).await.is_err() {
                    return;
                }
                let mut name = vec![0u8; len[0] as usize];
                if socket.read_exact(&mut name).await.is_err() {
                    return;
                }
                String::from_utf8_lossy(&name).into_owned()
            }
            0x04 => {
                let mut ip = [0u8; 16];
                if socket.read_exact(&mut ip).await.is_err() {
                    return;
                }
                std::net::Ipv6Addr::from(ip).to_string()
            }
            _ => return,
        };
        let mut port_buf = [0u8; 2];
        if socket.read_exact(&mut port_buf).await.is_err() {
            return;
        }
        let _ = tx.send((host, u16::from_be_bytes(port_buf)));

        let reply = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        if socket.write_all(&reply).await.is_err() {
            return;
        }
        echo(socket).await;
    });

    (port, rx)
}
