// 配置管理模块 - 使用模块化设计

mod builder;
mod validator;

// 重新导出 builder 和 validator
pub use builder::ProxyEndpointBuilder;
pub use validator::ConfigValidator;

use crate::connection_pool::PoolConfig;
use crate::error::AgentError;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 默认代理端口
pub const DEFAULT_PROXY_PORT: u16 = 80;
/// 默认握手超时（毫秒）
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;

/// 代理协议
///
/// 决定到代理服务器的传输方式以及使用哪个连接器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "String", into = "String")]
pub enum ProxyProtocol {
    /// 明文 TCP 连接到代理
    #[default]
    Http,
    /// TLS 连接到代理
    Https,
    /// SOCKS5 代理
    Socks5,
}

impl ProxyProtocol {
    /// 到代理服务器本身是否需要 TLS
    pub fn is_tls(self) -> bool {
        matches!(self, ProxyProtocol::Https)
    }
}

impl std::fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyProtocol::Http => write!(f, "http"),
            ProxyProtocol::Https => write!(f, "https"),
            ProxyProtocol::Socks5 => write!(f, "socks5"),
        }
    }
}

impl std::str::FromStr for ProxyProtocol {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // 兼容 "http:" 这种带冒号的写法
        match s.trim().trim_end_matches(':').to_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "socks5" => Ok(Self::Socks5),
            _ => Err(AgentError::UnsupportedProtocol(s.to_string())),
        }
    }
}

impl TryFrom<String> for ProxyProtocol {
    type Error = AgentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProxyProtocol> for String {
    fn from(value: ProxyProtocol) -> Self {
        value.to_string()
    }
}

/// 代理工作模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// 通过 CONNECT / SOCKS5 建立隧道
    #[default]
    Tunnel,
    /// 明文 HTTP 转发代理（未实现）
    Forward,
}

/// 客户端 TLS 选项
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsOptions {
    /// CA 证书路径（可选，缺省使用系统证书）
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    /// 是否跳过证书验证（仅用于测试）
    #[serde(default)]
    pub skip_verify: bool,
}

/// 代理服务器端点配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    /// 代理服务器主机名
    pub proxy_hostname: String,
    /// 代理服务器端口
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
    /// 代理协议
    #[serde(default)]
    pub proxy_protocol: ProxyProtocol,
    /// 握手超时（毫秒）
    #[serde(
        default = "default_connect_timeout",
        alias = "proxy_connnect_timeout"
    )]
    pub proxy_connect_timeout: u64,
    /// 是否开启 TCP keepalive
    #[serde(default)]
    pub keep_alive: bool,
    /// Keepalive 探测间隔（秒）
    #[serde(default)]
    pub keep_alive_interval_secs: Option<u64>,
    /// 是否为 agent 创建内部连接池
    #[serde(default)]
    pub internal_pool: bool,
    /// 工作模式
    #[serde(default)]
    pub mode: ProxyMode,
    /// TLS 选项（代理为 https 或目标为 https 时使用）
    #[serde(default)]
    pub tls: TlsOptions,
}

fn default_proxy_port() -> u16 {
    DEFAULT_PROXY_PORT
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

impl ProxyEndpoint {
    /// 使用默认值创建端点
    pub fn new(proxy_hostname: impl Into<String>) -> Self {
        Self {
            proxy_hostname: proxy_hostname.into(),
            proxy_port: DEFAULT_PROXY_PORT,
            proxy_protocol: ProxyProtocol::default(),
            proxy_connect_timeout: DEFAULT_CONNECT_TIMEOUT_MS,
            keep_alive: false,
            keep_alive_interval_secs: None,
            internal_pool: false,
            mode: ProxyMode::default(),
            tls: TlsOptions::default(),
        }
    }

    pub fn builder() -> ProxyEndpointBuilder {
        ProxyEndpointBuilder::new()
    }

    /// "host:port" 形式的代理地址
    pub fn addr(&self) -> String {
        format!("{}:{}", self.proxy_hostname, self.proxy_port)
    }

    /// 握手超时
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy_connect_timeout)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_endpoint(self)
    }
}

/// 完整配置文件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub proxy: ProxyEndpoint,
    #[serde(default)]
    pub pool: PoolConfig,
}

impl AgentConfig {
    /// 从 TOML 字符串解析并验证
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let mut config: AgentConfig =
            toml::from_str(content).context("Failed to parse agent configuration")?;

        // 展开证书路径中的 ~ 和环境变量
        if let Some(path) = config.proxy.tls.ca_cert_path.take() {
            let raw = path.to_string_lossy().into_owned();
            let expanded = shellexpand::full(&raw)
                .with_context(|| format!("Failed to expand path: {}", raw))?;
            config.proxy.tls.ca_cert_path = Some(PathBuf::from(expanded.as_ref()));
        }

        ConfigValidator::validate_agent_config(&config)
            .context("Configuration validation failed")?;
        Ok(config)
    }

    /// 从文件加载配置
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        Self::from_toml(&content)
    }
}
