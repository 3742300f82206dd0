/// 目标请求：调用方的请求参数到隧道目标的转换
use crate::error::{AgentError, Result};
use url::Url;

/// 目标协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    /// 协议默认端口
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn is_tls(self) -> bool {
        matches!(self, Scheme::Https)
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scheme::Http => write!(f, "http"),
            Scheme::Https => write!(f, "https"),
        }
    }
}

/// 调用方提供的请求参数
///
/// 字段都是可选的，缺省值在 [`RequestOptions::to_target`] 中推导
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub hostname: Option<String>,
    /// 可能带端口的主机，如 "example.com:443"
    pub host: Option<String>,
    pub port: Option<u16>,
    pub default_port: Option<u16>,
    /// "http" / "https"，允许带结尾的冒号
    pub protocol: Option<String>,
    pub path: Option<String>,
}

impl RequestOptions {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: Some(hostname.into()),
            ..Default::default()
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// 从 URL 构造请求参数
    pub fn from_url(url: &Url) -> Result<Self> {
        let hostname = url
            .host_str()
            .ok_or_else(|| AgentError::InvalidRequest(format!("URL has no host: {}", url)))?;

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            hostname: Some(hostname.to_string()),
            host: None,
            port: url.port(),
            default_port: None,
            protocol: Some(format!("{}:", url.scheme())),
            path: Some(path),
        })
    }

    /// 推导目标是否为 https
    ///
    /// 依次使用：显式协议；端口（或默认端口）是否为 443；
    /// host 字符串是否以 ":443" 结尾
    pub fn is_https(&self) -> bool {
        if let Some(protocol) = self.protocol.as_deref() {
            return protocol.trim_end_matches(':').eq_ignore_ascii_case("https");
        }
        if let Some(port) = self.port.or(self.default_port) {
            return port == 443;
        }
        self.host
            .as_deref()
            .or(self.hostname.as_deref())
            .is_some_and(|host| host.ends_with(":443"))
    }

    /// 转换为隧道目标
    pub fn to_target(&self) -> Result<TargetRequest> {
        let hostname = self
            .hostname
            .as_deref()
            .filter(|h| !h.is_empty())
            .or_else(|| {
                self.host
                    .as_deref()
                    .map(strip_port)
                    .filter(|h| !h.is_empty())
            })
            .ok_or_else(|| AgentError::InvalidRequest("missing hostname".to_string()))?;

        let scheme = if self.is_https() {
            Scheme::Https
        } else {
            Scheme::Http
        };

        Ok(TargetRequest {
            hostname: hostname.to_string(),
            port: self
                .port
                .or(self.default_port)
                .unwrap_or(scheme.default_port()),
            scheme,
            path: self.path.clone(),
        })
    }
}

/// 去掉 host 中的端口，IPv6 地址保留方括号
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.parse::<u16>().is_ok() => name,
        _ => host,
    }
}

/// 隧道的最终目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRequest {
    pub hostname: String,
    pub port: u16,
    pub scheme: Scheme,
    /// 隧道本身不使用
    pub path: Option<String>,
}

impl TargetRequest {
    pub fn new(hostname: impl Into<String>, port: u16, scheme: Scheme) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            scheme,
            path: None,
        }
    }

    /// CONNECT 请求中使用的 "host:port"
    pub fn authority(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// TLS SNI 使用的主机名（去掉 IPv6 的方括号）
    pub fn server_name(&self) -> &str {
        self.hostname.trim_start_matches('[').trim_end_matches(']')
    }
}
