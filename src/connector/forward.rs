use super::{Connector, ConnectorKind};
use crate::config::ProxyEndpoint;
use crate::error::{AgentError, Result};
use crate::stream::TunnelStream;
use crate::target::TargetRequest;
use async_trait::async_trait;

/// 明文 HTTP 转发连接器
///
/// 还没有实现：每次调用都立即失败，不做任何 I/O
pub struct ForwardConnector;

#[async_trait]
impl Connector for ForwardConnector {
    async fn connect(
        &self,
        endpoint: &ProxyEndpoint,
        target: &TargetRequest,
    ) -> Result<TunnelStream> {
        Err(AgentError::not_implemented(format!(
            "plain HTTP forwarding to {} via {}",
            target.authority(),
            endpoint.addr()
        )))
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Forward
    }
}
