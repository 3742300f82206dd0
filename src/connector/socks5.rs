use super::{finish_tunnel, Connector, ConnectorKind};
use crate::config::ProxyEndpoint;
use crate::error::{AgentError, Result};
use crate::stream::TunnelStream;
use crate::target::TargetRequest;
use crate::transport::{connect_tcp, BoxedTransport};
use async_trait::async_trait;
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, info};

/// SOCKS5 连接器
///
/// 目标地址以域名形式交给代理解析；目标为 https 时在隧道内协商 TLS
pub struct Socks5Connector {
    tls: TlsConnector,
}

impl Socks5Connector {
    pub fn new(tls: TlsConnector) -> Self {
        Self { tls }
    }
}

#[async_trait]
impl Connector for Socks5Connector {
    async fn connect(
        &self,
        endpoint: &ProxyEndpoint,
        target: &TargetRequest,
    ) -> Result<TunnelStream> {
        let tcp_stream = connect_tcp(endpoint).await?;
        let timeout = endpoint.handshake_timeout();

        debug!(
            "Negotiating SOCKS5 with {} for {}",
            endpoint.addr(),
            target.authority()
        );
        let socks_stream = tokio::time::timeout(
            timeout,
            Socks5Stream::connect_with_socket(
                tcp_stream,
                (target.server_name(), target.port),
            ),
        )
        .await
        .map_err(|_| AgentError::timeout(timeout))?
        .map_err(|e| AgentError::Socks(e.to_string()))?;

        let tunnel: BoxedTransport = Box::pin(socks_stream.into_inner());
        let stream = finish_tunnel(&self.tls, target, tunnel, timeout).await?;
        info!(
            "SOCKS5 tunnel to {} established via {}",
            target.authority(),
            endpoint.addr()
        );
        Ok(stream)
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Socks5
    }
}
