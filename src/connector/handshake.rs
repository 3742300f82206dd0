//! CONNECT 握手状态机
//!
//! 一次握手对应一个 [`HandshakeSession`]：写出 CONNECT 请求后，数据、对端关闭、
//! I/O 错误、超时四种事件竞争，第一个到达的事件决定结果，会话随即进入
//! `Resolved` 状态，之后的任何事件都会被拒绝。

use crate::error::{AgentError, Result};
use crate::target::TargetRequest;
use crate::transport::BoxedTransport;
use bytes::{Bytes, BytesMut};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, warn};

/// 响应头结束标记
pub const SEGMENT_END: &[u8] = b"\r\n\r\n";

/// 第一次读取的缓冲区大小
const READ_BUFFER_SIZE: usize = 8192;

/// 构造 CONNECT 请求，按写出顺序分段
pub fn connect_request_segments(target: &TargetRequest) -> [Vec<u8>; 4] {
    let authority = target.authority();
    [
        format!("CONNECT {} HTTP/1.1", authority).into_bytes(),
        b"\r\n".to_vec(),
        format!("Host: {}", authority).into_bytes(),
        SEGMENT_END.to_vec(),
    ]
}

/// 代理对 CONNECT 的应答
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectReply {
    /// 隧道已建立，没有多余数据
    Established,
    /// 隧道已建立，但代理在响应头之后提前发送了数据
    EstablishedWithLeftover(Bytes),
}

/// 解析代理返回的第一段数据
///
/// 只做最小检查：必须有 `\r\n\r\n`，响应头非空且包含字面量 `200`。
/// 这里是子串匹配而不是状态行解析，其他头部里的 `200` 也会命中。
pub fn parse_connect_reply(buf: &[u8]) -> Result<ConnectReply> {
    let Some(head_end) = find_segment_end(buf) else {
        return Err(AgentError::handshake_rejected(buf));
    };

    let head = &buf[..head_end];
    if head.is_empty() || !contains(head, b"200") {
        return Err(AgentError::handshake_rejected(buf));
    }

    let rest = &buf[head_end + SEGMENT_END.len()..];
    if rest.is_empty() {
        Ok(ConnectReply::Established)
    } else {
        Ok(ConnectReply::EstablishedWithLeftover(Bytes::copy_from_slice(rest)))
    }
}

fn find_segment_end(buf: &[u8]) -> Option<usize> {
    buf.windows(SEGMENT_END.len())
        .position(|window| window == SEGMENT_END)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Resolved,
}

/// 能够结束会话的事件
#[derive(Debug)]
pub enum HandshakeEvent {
    Data(Bytes),
    End,
    Error(io::Error),
    Timeout,
}

/// 握手成功的结果
pub enum HandshakeOutcome {
    /// 隧道已打开，可以直接使用（或继续协商 TLS）
    Open(BoxedTransport),
    /// 代理提前发送的数据；原始连接已经关闭
    Leftover(Bytes),
}

impl std::fmt::Debug for HandshakeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeOutcome::Open(_) => write!(f, "Open"),
            HandshakeOutcome::Leftover(data) => write!(f, "Leftover({} bytes)", data.len()),
        }
    }
}

/// 一次 CONNECT 握手
pub struct HandshakeSession {
    transport: Option<BoxedTransport>,
    authority: String,
    segments: [Vec<u8>; 4],
    timeout: Duration,
    deadline: Instant,
    state: SessionState,
}

impl HandshakeSession {
    /// 创建会话并立即设置超时期限（传输层连接已经建立）
    pub fn new(transport: BoxedTransport, target: &TargetRequest, timeout: Duration) -> Self {
        Self {
            transport: Some(transport),
            authority: target.authority(),
            segments: connect_request_segments(target),
            timeout,
            deadline: Instant::now() + timeout,
            state: SessionState::Pending,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 写出 CONNECT 请求，每段单独写入
    pub async fn send_request(&mut self) -> io::Result<()> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport closed"))?;

        for segment in &self.segments {
            transport.write_all(segment).await?;
        }
        transport.flush().await
    }

    /// 等待下一个结束事件：第一段数据、对端关闭、错误或超时
    pub async fn next_event(&mut self) -> HandshakeEvent {
        let Some(transport) = self.transport.as_mut() else {
            return HandshakeEvent::Error(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport closed",
            ));
        };

        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        tokio::select! {
            result = transport.read_buf(&mut buf) => match result {
                Ok(0) => HandshakeEvent::End,
                Ok(_) => HandshakeEvent::Data(buf.freeze()),
                Err(e) => HandshakeEvent::Error(e),
            },
            _ = tokio::time::sleep_until(self.deadline) => HandshakeEvent::Timeout,
        }
    }

    /// 用一个事件结束会话
    ///
    /// 只有第一次调用生效；失败时传输层连接被关闭
    pub fn resolve(&mut self, event: HandshakeEvent) -> Result<HandshakeOutcome> {
        if self.state == SessionState::Resolved {
            debug!("Ignoring {:?} for resolved handshake to {}", event, self.authority);
            return Err(AgentError::AlreadyResolved);
        }
        self.state = SessionState::Resolved;

        // 先拿走连接，任何失败路径都会在这里把它丢弃
        let transport = self.transport.take();

        let data = match event {
            HandshakeEvent::Data(data) => data,
            HandshakeEvent::End => return Err(AgentError::PeerClosed),
            HandshakeEvent::Error(e) => return Err(AgentError::Io(e)),
            HandshakeEvent::Timeout => return Err(AgentError::timeout(self.timeout)),
        };

        match parse_connect_reply(&data)? {
            ConnectReply::Established => transport
                .map(HandshakeOutcome::Open)
                .ok_or(AgentError::PeerClosed),
            ConnectReply::EstablishedWithLeftover(leftover) => {
                drop(transport);
                Ok(HandshakeOutcome::Leftover(leftover))
            }
        }
    }

    /// 执行完整握手
    pub async fn run(mut self) -> Result<HandshakeOutcome> {
        let deadline = self.deadline;
        let event = tokio::select! {
            result = self.send_request() => match result {
                Ok(()) => None,
                Err(e) => Some(HandshakeEvent::Error(e)),
            },
            _ = tokio::time::sleep_until(deadline) => Some(HandshakeEvent::Timeout),
        };

        let event = match event {
            Some(event) => event,
            None => self.next_event().await,
        };

        let result = self.resolve(event);
        if let Err(ref e) = result {
            warn!("CONNECT {} failed: {}", self.authority, e);
        }
        result
    }
}
