use super::{BoxedTransport, Transport};
use crate::error::{AgentError, Result};
use rustls::pki_types::ServerName;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// 在任意传输层连接上协商 TLS 客户端会话
pub async fn connect_tls<S>(
    connector: &TlsConnector,
    server_name: &str,
    stream: S,
) -> Result<TlsStream<S>>
where
    S: Transport,
{
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|e| AgentError::tls(format!("Invalid server name {}: {}", server_name, e)))?;

    debug!("Starting TLS handshake with {}", server_name);
    connector
        .connect(name, stream)
        .await
        .map_err(|e| AgentError::tls(format!("TLS handshake with {} failed: {}", server_name, e)))
}

/// 在已经打开的隧道上协商到最终目标的 TLS
pub async fn wrap_tls(
    connector: &TlsConnector,
    server_name: &str,
    tunnel: BoxedTransport,
) -> Result<BoxedTransport> {
    let tls_stream = connect_tls(connector, server_name, tunnel).await?;
    info!("TLS session established with {} through tunnel", server_name);
    Ok(Box::pin(tls_stream))
}
