/// Proxy Agent 库入口
///
/// 通过 HTTP CONNECT / SOCKS5 代理建立出站连接，并提供按过期时间管理的连接池
pub mod agent;
pub mod cli;
pub mod config;
pub mod connection_pool;
pub mod connector;
pub mod error;
pub mod stream;
pub mod target;
pub mod tls;
pub mod transport;

// 重新导出常用类型
pub use agent::ProxyAgent;
pub use config::{AgentConfig, ProxyEndpoint, ProxyMode, ProxyProtocol};
pub use connection_pool::{Eviction, ExpiringPool, ExpiryPolicy, PoolConfig, Poolable};
pub use connector::{Connector, ConnectorKind};
pub use error::{AgentError, Result};
pub use stream::{LinkHandle, StreamKind, TunnelStream};
pub use target::{RequestOptions, Scheme, TargetRequest};
