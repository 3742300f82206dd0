use super::handshake::{HandshakeOutcome, HandshakeSession};
use super::{finish_tunnel, Connector, ConnectorKind};
use crate::config::ProxyEndpoint;
use crate::error::Result;
use crate::stream::TunnelStream;
use crate::target::TargetRequest;
use crate::transport::open_proxy_transport;
use async_trait::async_trait;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// HTTP CONNECT 隧道连接器
///
/// 代理本身可以是明文 http 或 https；隧道建立后目标为 https 时再协商一层 TLS
pub struct TunnelConnector {
    tls: TlsConnector,
}

impl TunnelConnector {
    pub fn new(tls: TlsConnector) -> Self {
        Self { tls }
    }
}

#[async_trait]
impl Connector for TunnelConnector {
    async fn connect(
        &self,
        endpoint: &ProxyEndpoint,
        target: &TargetRequest,
    ) -> Result<TunnelStream> {
        let transport = open_proxy_transport(endpoint, &self.tls).await?;
        debug!(
            "Proxy {} connected ({}), sending CONNECT {}",
            endpoint.addr(),
            endpoint.proxy_protocol,
            target.authority()
        );

        let timeout = endpoint.handshake_timeout();
        let session = HandshakeSession::new(transport, target, timeout);

        match session.run().await? {
            HandshakeOutcome::Leftover(data) => {
                // 代理提前发来了数据：原连接已关闭，只交出这些字节
                if target.scheme.is_tls() {
                    warn!(
                        "Proxy {} sent {} bytes after CONNECT {}, TLS to target skipped",
                        endpoint.addr(),
                        data.len(),
                        target.authority()
                    );
                } else {
                    warn!(
                        "Proxy {} sent {} bytes after CONNECT {}, returning read-only stream",
                        endpoint.addr(),
                        data.len(),
                        target.authority()
                    );
                }
                Ok(TunnelStream::leftover(data))
            }
            HandshakeOutcome::Open(tunnel) => {
                let stream = finish_tunnel(&self.tls, target, tunnel, timeout).await?;
                info!(
                    "Tunnel to {} established via {} ({:?})",
                    target.authority(),
                    endpoint.addr(),
                    stream.kind()
                );
                Ok(stream)
            }
        }
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Tunnel
    }
}
