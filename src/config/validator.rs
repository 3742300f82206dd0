use anyhow::{bail, Result};
use tracing::warn;

use super::{AgentConfig, ProxyEndpoint, ProxyMode, ProxyProtocol};
use crate::connection_pool::PoolConfig;

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证代理端点配置
    pub fn validate_endpoint(endpoint: &ProxyEndpoint) -> Result<()> {
        Self::validate_address(&endpoint.proxy_hostname, "proxy_hostname")?;
        Self::validate_port(endpoint.proxy_port, "proxy_port")?;

        if endpoint.proxy_connect_timeout == 0 {
            bail!("proxy_connect_timeout must be greater than 0");
        }

        // 明文转发只对 http 代理有意义
        if endpoint.mode == ProxyMode::Forward && endpoint.proxy_protocol != ProxyProtocol::Http {
            bail!(
                "forward mode is only valid with the http proxy protocol (got {})",
                endpoint.proxy_protocol
            );
        }

        if let Some(0) = endpoint.keep_alive_interval_secs {
            bail!("keep_alive_interval_secs must be greater than 0");
        }

        if endpoint.keep_alive_interval_secs.is_some() && !endpoint.keep_alive {
            warn!("keep_alive_interval_secs is set but keep_alive is disabled, ignoring");
        }

        if endpoint.tls.skip_verify {
            warn!("TLS certificate verification is disabled, use only for testing");
        }

        Ok(())
    }

    /// 验证连接池配置
    pub fn validate_pool_config(config: &PoolConfig) -> Result<()> {
        // max_size 只作为配置接受，连接池本身不执行容量限制
        if config.max_size == 0 {
            bail!("pool.max_size must be greater than 0");
        }
        Ok(())
    }

    /// 验证完整配置
    pub fn validate_agent_config(config: &AgentConfig) -> Result<()> {
        Self::validate_endpoint(&config.proxy)?;
        Self::validate_pool_config(&config.pool)?;

        if config.pool != PoolConfig::default() && !config.proxy.internal_pool {
            warn!("[pool] section is configured but proxy.internal_pool is disabled");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_port() {
        assert!(ConfigValidator::validate_port(3128, "test").is_ok());
        assert!(ConfigValidator::validate_port(0, "test").is_err());
    }

    #[test]
    fn test_validate_address() {
        assert!(ConfigValidator::validate_address("proxy.local", "test").is_ok());
        assert!(ConfigValidator::validate_address("  ", "test").is_err());
    }

    #[test]
    fn test_validate_endpoint() {
        let mut endpoint = ProxyEndpoint::new("proxy.local");
        assert!(ConfigValidator::validate_endpoint(&endpoint).is_ok());

        endpoint.proxy_connect_timeout = 0;
        assert!(ConfigValidator::validate_endpoint(&endpoint).is_err());

        endpoint.proxy_connect_timeout = 1000;
        endpoint.mode = ProxyMode::Forward;
        assert!(ConfigValidator::validate_endpoint(&endpoint).is_ok());

        endpoint.proxy_protocol = ProxyProtocol::Https;
        assert!(ConfigValidator::validate_endpoint(&endpoint).is_err());
    }

    #[test]
    fn test_validate_pool_config() {
        let mut config = PoolConfig::default();
        assert!(ConfigValidator::validate_pool_config(&config).is_ok());

        config.max_size = 0;
        assert!(ConfigValidator::validate_pool_config(&config).is_err());
    }
}
