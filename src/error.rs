/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，调用者可以区分握手超时、
/// 代理拒绝、对端提前关闭等情况并分别处理
use std::io;
use std::time::Duration;
use thiserror::Error;

/// 代理连接器的主要错误类型
#[derive(Error, Debug)]
pub enum AgentError {
    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// 不支持的代理协议
    #[error("Proxy protocol not supported: {0}")]
    UnsupportedProtocol(String),

    /// 连接代理服务器失败
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 握手超时
    #[error("Handshake timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// 代理返回了无法识别或非 200 的响应
    #[error("Proxy server returned bad data: {response}")]
    HandshakeRejected { response: String },

    /// 握手完成前对端关闭
    #[error("Peer closed before handshake")]
    PeerClosed,

    /// 会话已经结束，后续事件被拒绝
    #[error("Handshake session already resolved")]
    AlreadyResolved,

    /// TLS 协商失败
    #[error("TLS error: {0}")]
    Tls(String),

    /// SOCKS5 协商失败
    #[error("SOCKS5 error: {0}")]
    Socks(String),

    /// 尚未实现的连接器
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// 请求参数无效
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// 创建连接失败错误
    pub fn connection_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 创建握手被拒绝错误，保留原始响应字节用于诊断
    pub fn handshake_rejected(raw: &[u8]) -> Self {
        Self::HandshakeRejected {
            response: String::from_utf8_lossy(raw).into_owned(),
        }
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    pub fn not_implemented(what: impl Into<String>) -> Self {
        Self::NotImplemented(what.into())
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 检查是否为握手被拒绝
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::HandshakeRejected { .. })
    }

    /// 检查是否为配置错误
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigError(_) | Self::UnsupportedProtocol(_))
    }
}
