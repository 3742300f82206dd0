//! 代理 agent
//!
//! 持有一个代理端点、创建时选定的连接器，以及可选的内部连接池。
//! 每次 [`ProxyAgent::create_connection`] 都通过连接器打开一条新的隧道。

use crate::config::{AgentConfig, ProxyEndpoint};
use crate::connection_pool::{ExpiringPool, PoolConfig};
use crate::connector::{create_connector, Connector, ConnectorKind};
use crate::error::{AgentError, Result};
use crate::stream::TunnelStream;
use crate::target::RequestOptions;
use crate::tls::build_connector;
use std::sync::Arc;
use tracing::{debug, error, info};

/// 经代理建立出站连接的 agent
pub struct ProxyAgent {
    endpoint: ProxyEndpoint,
    connector: Arc<dyn Connector>,
    pool: Option<ExpiringPool<TunnelStream>>,
}

impl ProxyAgent {
    /// 使用默认连接池配置创建 agent
    pub fn new(endpoint: ProxyEndpoint) -> Result<Self> {
        Self::with_pool_config(endpoint, PoolConfig::default())
    }

    /// 创建 agent
    ///
    /// 端点配置在这里验证，不支持的协议组合立即报错；
    /// `internal_pool` 为 true 时按 `pool_config` 创建内部连接池
    pub fn with_pool_config(endpoint: ProxyEndpoint, pool_config: PoolConfig) -> Result<Self> {
        endpoint
            .validate()
            .map_err(|e| AgentError::config_error(format!("{:#}", e)))?;

        let tls = build_connector(&endpoint.tls)
            .map_err(|e| AgentError::config_error(format!("{:#}", e)))?;
        let connector = create_connector(&endpoint, tls)?;

        Ok(Self::with_connector(endpoint, connector, pool_config))
    }

    /// 从配置文件内容创建 agent
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        Self::with_pool_config(config.proxy.clone(), config.pool.clone())
    }

    /// 使用外部提供的连接器创建 agent（不做端点验证）
    pub fn with_connector(
        endpoint: ProxyEndpoint,
        connector: Arc<dyn Connector>,
        pool_config: PoolConfig,
    ) -> Self {
        let pool = endpoint
            .internal_pool
            .then(|| ExpiringPool::new(pool_config));

        info!(
            "Proxy agent ready: {}://{} ({} connector, pool {})",
            endpoint.proxy_protocol,
            endpoint.addr(),
            connector.kind(),
            if pool.is_some() { "enabled" } else { "disabled" }
        );

        Self {
            endpoint,
            connector,
            pool,
        }
    }

    pub fn endpoint(&self) -> &ProxyEndpoint {
        &self.endpoint
    }

    pub fn connector_kind(&self) -> ConnectorKind {
        self.connector.kind()
    }

    /// 内部连接池（`internal_pool` 关闭时为 `None`）
    pub fn pool(&self) -> Option<&ExpiringPool<TunnelStream>> {
        self.pool.as_ref()
    }

    /// 通过代理打开到目标的连接
    pub async fn create_connection(&self, options: &RequestOptions) -> Result<TunnelStream> {
        let target = options.to_target()?;
        debug!(
            "Creating {} connection to {} via {}",
            target.scheme,
            target.authority(),
            self.endpoint.addr()
        );
        self.connector.connect(&self.endpoint, &target).await
    }

    /// 回调形式的 [`create_connection`](Self::create_connection)
    ///
    /// 成功与失败都只通过回调交付，且回调恰好被调用一次
    pub async fn create_connection_with<F>(&self, options: &RequestOptions, callback: F)
    where
        F: FnOnce(Result<TunnelStream>),
    {
        let result = self.create_connection(options).await;
        if let Err(ref e) = result {
            error!("Failed to create connection via {}: {}", self.endpoint.addr(), e);
        }
        callback(result);
    }

    /// 把用完的连接交还给内部连接池
    ///
    /// 没有连接池、连接已销毁或只读时直接丢弃，返回是否被保留
    pub fn release(&self, stream: TunnelStream) -> bool {
        let Some(pool) = self.pool.as_ref() else {
            return false;
        };
        if !stream.is_writable() {
            debug!("Dropping unusable connection ({:?})", stream.kind());
            return false;
        }

        let before = pool.len();
        pool.alloc(stream);
        pool.len() > before
    }

    /// 从内部连接池取出一个闲置连接
    pub fn reuse(&self) -> Option<TunnelStream> {
        self.pool.as_ref().and_then(|pool| pool.take())
    }
}

impl std::fmt::Debug for ProxyAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyAgent")
            .field("endpoint", &self.endpoint)
            .field("connector", &self.connector.kind())
            .field("pool", &self.pool.as_ref().map(|p| p.len()))
            .finish()
    }
}
