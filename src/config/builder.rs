use anyhow::{Context, Result};
use std::path::PathBuf;

use super::{
    validator::ConfigValidator, ProxyEndpoint, ProxyMode, ProxyProtocol, TlsOptions,
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_PROXY_PORT,
};

/// ProxyEndpoint Builder
#[derive(Debug, Default)]
pub struct ProxyEndpointBuilder {
    proxy_hostname: Option<String>,
    proxy_port: Option<u16>,
    proxy_protocol: Option<ProxyProtocol>,
    proxy_connect_timeout: Option<u64>,
    keep_alive: bool,
    keep_alive_interval_secs: Option<u64>,
    internal_pool: bool,
    mode: ProxyMode,
    tls: TlsOptions,
}

impl ProxyEndpointBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置代理主机名
    pub fn proxy_hostname(mut self, host: impl Into<String>) -> Self {
        self.proxy_hostname = Some(host.into());
        self
    }

    /// 设置代理端口
    pub fn proxy_port(mut self, port: u16) -> Self {
        self.proxy_port = Some(port);
        self
    }

    /// 设置代理协议
    pub fn proxy_protocol(mut self, protocol: ProxyProtocol) -> Self {
        self.proxy_protocol = Some(protocol);
        self
    }

    /// 设置握手超时（毫秒）
    pub fn proxy_connect_timeout(mut self, millis: u64) -> Self {
        self.proxy_connect_timeout = Some(millis);
        self
    }

    /// 设置是否开启 keepalive
    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = enabled;
        self
    }

    /// 设置 keepalive 探测间隔（秒）
    pub fn keep_alive_interval_secs(mut self, secs: u64) -> Self {
        self.keep_alive_interval_secs = Some(secs);
        self
    }

    /// 设置是否启用内部连接池
    pub fn internal_pool(mut self, enabled: bool) -> Self {
        self.internal_pool = enabled;
        self
    }

    pub fn mode(mut self, mode: ProxyMode) -> Self {
        self.mode = mode;
        self
    }

    /// 设置 CA 证书路径
    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls.ca_cert_path = Some(path.into());
        self
    }

    /// 设置是否跳过证书验证
    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.tls.skip_verify = skip;
        self
    }

    /// 构建 ProxyEndpoint 并验证
    pub fn build(self) -> Result<ProxyEndpoint> {
        let endpoint = ProxyEndpoint {
            proxy_hostname: self
                .proxy_hostname
                .context("proxy_hostname is required")?,
            proxy_port: self.proxy_port.unwrap_or(DEFAULT_PROXY_PORT),
            proxy_protocol: self.proxy_protocol.unwrap_or_default(),
            proxy_connect_timeout: self
                .proxy_connect_timeout
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            keep_alive: self.keep_alive,
            keep_alive_interval_secs: self.keep_alive_interval_secs,
            internal_pool: self.internal_pool,
            mode: self.mode,
            tls: self.tls,
        };

        // 验证配置
        ConfigValidator::validate_endpoint(&endpoint)?;

        Ok(endpoint)
    }
}
