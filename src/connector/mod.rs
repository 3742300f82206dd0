mod forward;
pub mod handshake;
mod socks5;
mod tunnel;

pub use forward::ForwardConnector;
pub use handshake::{HandshakeOutcome, HandshakeSession, SessionState};
pub use socks5::Socks5Connector;
pub use tunnel::TunnelConnector;

use crate::config::{ProxyEndpoint, ProxyMode, ProxyProtocol};
use crate::error::{AgentError, Result};
use crate::stream::{StreamKind, TunnelStream};
use crate::target::TargetRequest;
use crate::transport::{wrap_tls, BoxedTransport};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsConnector;

/// 连接器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorKind {
    /// HTTP CONNECT 隧道
    Tunnel,
    /// SOCKS5
    Socks5,
    /// 明文 HTTP 转发（未实现）
    Forward,
}

impl std::fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectorKind::Tunnel => write!(f, "tunnel"),
            ConnectorKind::Socks5 => write!(f, "socks5"),
            ConnectorKind::Forward => write!(f, "forward"),
        }
    }
}

/// 经代理到达目标的连接器接口
#[async_trait]
pub trait Connector: Send + Sync {
    /// 通过代理打开到目标的连接
    async fn connect(&self, endpoint: &ProxyEndpoint, target: &TargetRequest)
        -> Result<TunnelStream>;

    /// 获取连接器类型
    fn kind(&self) -> ConnectorKind;
}

/// 根据端点配置选择连接器
///
/// 选择只在创建 agent 时发生一次
pub fn create_connector(
    endpoint: &ProxyEndpoint,
    tls: TlsConnector,
) -> Result<Arc<dyn Connector>> {
    let connector: Arc<dyn Connector> = match (endpoint.mode, endpoint.proxy_protocol) {
        (ProxyMode::Forward, ProxyProtocol::Http) => Arc::new(ForwardConnector),
        (ProxyMode::Forward, other) => {
            return Err(AgentError::config_error(format!(
                "forward mode requires an http proxy, got {}",
                other
            )));
        }
        (ProxyMode::Tunnel, ProxyProtocol::Http | ProxyProtocol::Https) => {
            Arc::new(TunnelConnector::new(tls))
        }
        (ProxyMode::Tunnel, ProxyProtocol::Socks5) => Arc::new(Socks5Connector::new(tls)),
    };

    Ok(connector)
}

/// 隧道打开后，按目标协议决定是否再协商一层 TLS
pub(crate) async fn finish_tunnel(
    tls: &TlsConnector,
    target: &TargetRequest,
    tunnel: BoxedTransport,
    timeout: Duration,
) -> Result<TunnelStream> {
    if !target.scheme.is_tls() {
        return Ok(TunnelStream::new(tunnel, StreamKind::Plain));
    }

    let stream = tokio::time::timeout(timeout, wrap_tls(tls, target.server_name(), tunnel))
        .await
        .map_err(|_| AgentError::timeout(timeout))??;
    Ok(TunnelStream::new(stream, StreamKind::Tls))
}
