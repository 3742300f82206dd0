/// 交给调用方的隧道连接
///
/// `TunnelStream` 包装任意传输层连接，并额外记录生命周期状态
/// （对端关闭、错误、主动销毁、空闲超时），供连接池在连接闲置时观察
use crate::connection_pool::{Eviction, Poolable};
use crate::transport::BoxedTransport;
use bytes::{Buf, Bytes, BytesMut};
use futures::task::AtomicWaker;
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

/// 闲置探测单次读取大小
const PROBE_CHUNK_SIZE: usize = 4096;
/// 闲置期间最多缓存的字节数，超过后停止探测
const MAX_PENDING_BYTES: usize = 64 * 1024;

/// 连接种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// 隧道内的明文连接
    Plain,
    /// 隧道内与目标协商了 TLS
    Tls,
    /// 只读连接，内容为代理在握手响应之后提前发送的数据
    Leftover,
}

struct LinkState {
    destroyed: AtomicBool,
    idle_timeout: Mutex<Option<Duration>>,
    last_activity: Mutex<Instant>,
    waker: AtomicWaker,
}

impl LinkState {
    fn new() -> Self {
        Self {
            destroyed: AtomicBool::new(false),
            idle_timeout: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            waker: AtomicWaker::new(),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }
}

/// 连接的生命周期句柄
///
/// 连接交给连接池之后，调用方仍可以通过句柄销毁连接或设置空闲超时
#[derive(Clone)]
pub struct LinkHandle {
    state: Arc<LinkState>,
}

impl LinkHandle {
    /// 销毁连接：之后的读写都会失败，连接池会立即将其移除
    pub fn destroy(&self) {
        self.state.destroyed.store(true, Ordering::SeqCst);
        self.state.waker.wake();
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.destroyed.load(Ordering::SeqCst)
    }

    /// 设置空闲超时，`None` 表示关闭
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        *self.state.idle_timeout.lock() = timeout;
        self.state.touch();
        self.state.waker.wake();
    }
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle")
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// 只读的预加载数据源，读完后返回 EOF，拒绝写入
struct LeftoverReader {
    data: Bytes,
}

impl AsyncRead for LeftoverReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let n = self.data.len().min(buf.remaining());
        buf.put_slice(&self.data[..n]);
        self.data.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for LeftoverReader {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "socket is not writable",
        )))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// 隧道连接
pub struct TunnelStream {
    inner: BoxedTransport,
    kind: StreamKind,
    /// 闲置期间探测读到的数据，下次读取时优先返回
    pending: BytesMut,
    idle_sleep: Option<Pin<Box<Sleep>>>,
    link: Arc<LinkState>,
}

impl TunnelStream {
    pub fn new(inner: BoxedTransport, kind: StreamKind) -> Self {
        Self {
            inner,
            kind,
            pending: BytesMut::new(),
            idle_sleep: None,
            link: Arc::new(LinkState::new()),
        }
    }

    /// 创建预加载数据的只读连接
    pub fn leftover(data: Bytes) -> Self {
        Self::new(Box::pin(LeftoverReader { data }), StreamKind::Leftover)
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn is_writable(&self) -> bool {
        self.kind != StreamKind::Leftover && !self.is_destroyed()
    }

    /// 获取生命周期句柄
    pub fn handle(&self) -> LinkHandle {
        LinkHandle {
            state: self.link.clone(),
        }
    }

    pub fn destroy(&self) {
        self.handle().destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.link.destroyed.load(Ordering::SeqCst)
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.handle().set_timeout(timeout);
    }

    fn destroyed_error() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "socket has been destroyed")
    }

    /// 检查空闲超时，到期返回 true
    fn poll_idle_timeout(&mut self, cx: &mut Context<'_>) -> bool {
        let timeout = *self.link.idle_timeout.lock();
        let Some(timeout) = timeout else {
            self.idle_sleep = None;
            return false;
        };

        let deadline = *self.link.last_activity.lock() + timeout;
        match self.idle_sleep.as_mut() {
            Some(sleep) if sleep.deadline() == deadline => {}
            Some(sleep) => sleep.as_mut().reset(deadline),
            None => self.idle_sleep = Some(Box::pin(tokio::time::sleep_until(deadline))),
        }

        match self.idle_sleep.as_mut() {
            Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
            None => false,
        }
    }
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream")
            .field("kind", &self.kind)
            .field("pending", &self.pending.len())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Poolable for TunnelStream {
    fn poll_evicted(&mut self, cx: &mut Context<'_>) -> Poll<Eviction> {
        self.link.waker.register(cx.waker());

        if self.is_destroyed() {
            return Poll::Ready(Eviction::Close);
        }

        if self.poll_idle_timeout(cx) {
            return Poll::Ready(Eviction::Timeout);
        }

        // 探测读：数据缓存下来，EOF 和错误都意味着连接不可再用
        let mut chunk = [0u8; PROBE_CHUNK_SIZE];
        while self.pending.len() < MAX_PENDING_BYTES {
            let mut buf = ReadBuf::new(&mut chunk);
            match self.inner.as_mut().poll_read(cx, &mut buf) {
                Poll::Ready(Ok(())) if buf.filled().is_empty() => {
                    return Poll::Ready(Eviction::End);
                }
                Poll::Ready(Ok(())) => {
                    self.pending.extend_from_slice(buf.filled());
                    self.link.touch();
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Eviction::Error(e.to_string())),
                Poll::Pending => break,
            }
        }

        Poll::Pending
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.is_destroyed() {
            return Poll::Ready(Err(Self::destroyed_error()));
        }

        if !self.pending.is_empty() {
            let n = self.pending.len().min(buf.remaining());
            let chunk = self.pending.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        let result = self.inner.as_mut().poll_read(cx, buf);
        if matches!(result, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            self.link.touch();
        }
        result
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.is_destroyed() {
            return Poll::Ready(Err(Self::destroyed_error()));
        }

        let result = self.inner.as_mut().poll_write(cx, buf);
        if matches!(result, Poll::Ready(Ok(n)) if n > 0) {
            self.link.touch();
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::poll_fn;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_leftover_stream_is_read_only() {
        let mut stream = TunnelStream::leftover(Bytes::from_static(b"hello"));
        assert_eq!(stream.kind(), StreamKind::Leftover);
        assert!(!stream.is_writable());

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");

        let err = stream.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn test_destroyed_stream_rejects_io() {
        let (client, _server) = tokio::io::duplex(64);
        let mut stream = TunnelStream::new(Box::pin(client), StreamKind::Plain);
        let handle = stream.handle();
        handle.destroy();

        assert!(stream.is_destroyed());
        let mut buf = [0u8; 4];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_probe_buffers_data_then_reports_end() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = TunnelStream::new(Box::pin(client), StreamKind::Plain);

        server.write_all(b"early").await.unwrap();
        drop(server);

        let eviction = poll_fn(|cx| stream.poll_evicted(cx)).await;
        assert_eq!(eviction, Eviction::End);

        // 探测期间读到的数据不会丢失
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"early");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_reported() {
        let (client, _server) = tokio::io::duplex(64);
        let mut stream = TunnelStream::new(Box::pin(client), StreamKind::Plain);
        stream.set_timeout(Some(Duration::from_millis(200)));

        let started = Instant::now();
        let eviction = poll_fn(|cx| stream.poll_evicted(cx)).await;
        assert_eq!(eviction, Eviction::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }
}
