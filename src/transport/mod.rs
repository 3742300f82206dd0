mod tls;

pub use tls::{connect_tls, wrap_tls};

use crate::config::ProxyEndpoint;
use crate::error::{AgentError, Result};
use socket2::{SockRef, TcpKeepalive};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Keepalive 首次探测时间的默认值
const DEFAULT_KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// 传输层连接抽象
///
/// 统一封装到代理的明文 TCP、TLS 以及隧道内的 TLS 连接
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

// 为所有满足条件的类型自动实现 Transport
impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 装箱后的传输层连接
pub type BoxedTransport = Pin<Box<dyn Transport>>;

/// 建立到代理服务器的 TCP 连接
///
/// 连接过程受握手超时约束，避免不可达的代理让调用方无限等待
pub async fn connect_tcp(endpoint: &ProxyEndpoint) -> Result<TcpStream> {
    let addr = endpoint.addr();
    let timeout = endpoint.handshake_timeout();

    debug!("Connecting to proxy {} via TCP", addr);
    let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| AgentError::timeout(timeout))?
        .map_err(|e| AgentError::connection_failed(&addr, e))?;

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY on {}: {}", addr, e);
    }

    if endpoint.keep_alive {
        apply_keepalive(&stream, endpoint.keep_alive_interval_secs.map(Duration::from_secs));
    }

    Ok(stream)
}

/// 打开到代理服务器的传输层连接
///
/// 代理协议为 https 时在 TCP 之上协商 TLS（SNI 为代理主机名），否则返回明文 TCP
pub async fn open_proxy_transport(
    endpoint: &ProxyEndpoint,
    connector: &TlsConnector,
) -> Result<BoxedTransport> {
    let tcp_stream = connect_tcp(endpoint).await?;

    if endpoint.proxy_protocol.is_tls() {
        let timeout = endpoint.handshake_timeout();
        let tls_stream = tokio::time::timeout(
            timeout,
            connect_tls(connector, &endpoint.proxy_hostname, tcp_stream),
        )
        .await
        .map_err(|_| AgentError::timeout(timeout))??;
        debug!("TLS connection established to proxy {}", endpoint.addr());
        return Ok(Box::pin(tls_stream));
    }

    Ok(Box::pin(tcp_stream))
}

/// 设置 TCP keepalive
pub fn apply_keepalive(stream: &TcpStream, interval: Option<Duration>) {
    let mut keepalive = TcpKeepalive::new().with_time(DEFAULT_KEEPALIVE_TIME);
    if let Some(interval) = interval {
        keepalive = keepalive.with_interval(interval);
    }

    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!(
            "Failed to set TCP keepalive on {}: {}",
            stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".into()),
            e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyEndpointBuilder;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_tcp_applies_keepalive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.map(|(s, _)| s) });

        let endpoint = ProxyEndpointBuilder::new()
            .proxy_hostname("127.0.0.1")
            .proxy_port(port)
            .keep_alive(true)
            .keep_alive_interval_secs(5)
            .build()
            .unwrap();

        let stream = connect_tcp(&endpoint).await.unwrap();
        assert!(SockRef::from(&stream).keepalive().unwrap());
        assert!(accept.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_connect_tcp_refused() {
        // 绑定后立即释放，得到一个大概率无人监听的端口
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let endpoint = ProxyEndpointBuilder::new()
            .proxy_hostname("127.0.0.1")
            .proxy_port(port)
            .build()
            .unwrap();

        let err = connect_tcp(&endpoint).await.unwrap_err();
        assert!(matches!(err, AgentError::ConnectionFailed { .. }));
    }
}
