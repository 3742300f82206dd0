//! 带过期时间的连接池
//!
//! 连接按过期时间升序存放在一个环形双向链表中（永不过期时退化为 FIFO）。
//! 链表节点放在 arena 里，用下标代替指针，下标 0 是哨兵节点：
//! 哨兵的 next 指向最早过期的连接，prev 指向最晚的连接，空池时两者都指向自身。
//!
//! 任意时刻最多只有一个过期定时器，且总是对准链表头部的过期时间。
//! 每个驻留的连接有一个观察任务，连接在池中闲置期间出现 end / error /
//! close / timeout 时立即将其移除。

use futures::future::poll_fn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 哨兵节点下标
const SENTINEL: usize = 0;

/// 连接过期策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum ExpiryPolicy {
    /// 永不过期（配置值 -1）
    #[default]
    Never,
    /// 立即过期，连接不会被保留（配置值 0）
    Immediate,
    /// 放入连接池后经过指定时间过期
    After(Duration),
}

impl ExpiryPolicy {
    /// 从毫秒配置值转换：负数永不过期，0 立即过期
    pub fn from_millis(millis: i64) -> Self {
        match millis {
            m if m < 0 => Self::Never,
            0 => Self::Immediate,
            m => Self::After(Duration::from_millis(m as u64)),
        }
    }
}

impl From<i64> for ExpiryPolicy {
    fn from(value: i64) -> Self {
        Self::from_millis(value)
    }
}

impl From<ExpiryPolicy> for i64 {
    fn from(value: ExpiryPolicy) -> Self {
        match value {
            ExpiryPolicy::Never => -1,
            ExpiryPolicy::Immediate => 0,
            ExpiryPolicy::After(d) => d.as_millis().min(i64::MAX as u128) as i64,
        }
    }
}

/// 连接池配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// 最大连接数（仅作为配置接受，不做容量限制）
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// 过期策略（毫秒，-1 永不过期，0 立即过期）
    #[serde(default)]
    pub timeout: ExpiryPolicy,
}

fn default_max_size() -> usize {
    2
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            timeout: ExpiryPolicy::Never,
        }
    }
}

/// 连接闲置期间失去可用性的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eviction {
    /// 对端关闭
    End,
    /// I/O 错误
    Error(String),
    /// 连接被主动销毁
    Close,
    /// 连接自身的空闲超时
    Timeout,
}

impl std::fmt::Display for Eviction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Eviction::End => write!(f, "peer end"),
            Eviction::Error(e) => write!(f, "error: {}", e),
            Eviction::Close => write!(f, "closed"),
            Eviction::Timeout => write!(f, "timeout"),
        }
    }
}

/// 可以放入连接池的连接
pub trait Poolable: Send + 'static {
    /// 在连接闲置期间轮询其生命周期事件
    ///
    /// 返回 `Ready` 表示连接已不可用，应从池中移除
    fn poll_evicted(&mut self, cx: &mut Context<'_>) -> Poll<Eviction>;
}

/// 过期时间。`At` 排在 `Never` 之前
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Expiry {
    At(Instant),
    Never,
}

struct Node<S> {
    prev: usize,
    next: usize,
    seq: u64,
    expiry: Expiry,
    socket: Option<S>,
    watcher: Option<AbortHandle>,
}

impl<S> Node<S> {
    fn vacant(index: usize) -> Self {
        Self {
            prev: index,
            next: index,
            seq: 0,
            expiry: Expiry::Never,
            socket: None,
            watcher: None,
        }
    }
}

struct ArmedTimer {
    id: u64,
    deadline: Instant,
    handle: AbortHandle,
}

/// 环形链表本体
struct Ring<S> {
    nodes: Vec<Node<S>>,
    free: Vec<usize>,
    next_seq: u64,
    next_timer_id: u64,
    len: usize,
    timer: Option<ArmedTimer>,
}

impl<S> Ring<S> {
    fn new() -> Self {
        Self {
            nodes: vec![Node::vacant(SENTINEL)],
            free: Vec::new(),
            next_seq: 1,
            next_timer_id: 1,
            len: 0,
            timer: None,
        }
    }

    fn head(&self) -> Option<usize> {
        let first = self.nodes[SENTINEL].next;
        (first != SENTINEL).then_some(first)
    }

    fn head_deadline(&self) -> Option<Instant> {
        match self.head().map(|index| self.nodes[index].expiry) {
            Some(Expiry::At(deadline)) => Some(deadline),
            _ => None,
        }
    }

    /// 插入到第一个过期时间严格更晚的节点之前；`fifo` 时直接插到尾部
    fn insert(&mut self, socket: S, expiry: Expiry, fifo: bool) -> (usize, u64) {
        let mut before = SENTINEL;
        if !fifo {
            before = self.nodes[SENTINEL].next;
            while before != SENTINEL && self.nodes[before].expiry <= expiry {
                before = self.nodes[before].next;
            }
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.nodes.push(Node::vacant(self.nodes.len()));
                self.nodes.len() - 1
            }
        };

        let seq = self.next_seq;
        self.next_seq += 1;

        let prev = self.nodes[before].prev;
        let node = &mut self.nodes[index];
        node.prev = prev;
        node.next = before;
        node.seq = seq;
        node.expiry = expiry;
        node.socket = Some(socket);
        node.watcher = None;
        self.nodes[prev].next = index;
        self.nodes[before].prev = index;
        self.len += 1;

        (index, seq)
    }

    fn contains(&self, index: usize, seq: u64) -> bool {
        index != SENTINEL
            && self
                .nodes
                .get(index)
                .is_some_and(|node| node.seq == seq && node.socket.is_some())
    }

    /// 解除链接并停止观察任务，返回连接
    fn remove(&mut self, index: usize) -> Option<S> {
        let node = &mut self.nodes[index];
        let socket = node.socket.take()?;
        if let Some(watcher) = node.watcher.take() {
            watcher.abort();
        }
        let (prev, next) = (node.prev, node.next);
        node.prev = index;
        node.next = index;

        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
        self.free.push(index);
        self.len -= 1;
        Some(socket)
    }

    /// 从头部开始移除所有已经过期的连接，返回移除数量
    fn sweep(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some(head) = self.head() {
            match self.nodes[head].expiry {
                Expiry::At(deadline) if now >= deadline => {
                    self.remove(head);
                    removed += 1;
                }
                _ => break,
            }
        }
        removed
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }

    /// 移除全部连接并回收 arena，序号计数器继续递增
    fn clear(&mut self) -> usize {
        self.cancel_timer();
        let count = self.len;
        while let Some(head) = self.head() {
            self.remove(head);
        }
        self.nodes.truncate(1);
        self.nodes[SENTINEL] = Node::vacant(SENTINEL);
        self.free.clear();
        self.len = 0;
        count
    }

    /// 按先后顺序列出驻留连接的序号
    #[cfg(test)]
    fn seqs(&self) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.nodes[SENTINEL].next;
        while cursor != SENTINEL {
            out.push(self.nodes[cursor].seq);
            cursor = self.nodes[cursor].next;
        }
        out
    }
}

type Shared<S> = Arc<Mutex<Ring<S>>>;

/// 保证定时器对准链表头部的过期时间；头部未变化时不重新设置
fn reschedule<S: Poolable>(ring: &mut Ring<S>, weak: &Weak<Mutex<Ring<S>>>) {
    let Some(deadline) = ring.head_deadline() else {
        ring.cancel_timer();
        return;
    };

    if ring.timer.as_ref().is_some_and(|t| t.deadline == deadline) {
        return;
    }
    ring.cancel_timer();

    let id = ring.next_timer_id;
    ring.next_timer_id += 1;

    let weak = weak.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;

        let Some(inner) = weak.upgrade() else {
            return;
        };
        let mut ring = inner.lock();
        // 已被新的定时器取代
        if ring.timer.as_ref().map(|t| t.id) != Some(id) {
            return;
        }
        ring.timer = None;

        let removed = ring.sweep(Instant::now());
        if removed > 0 {
            debug!("Expired {} pooled connections ({} left)", removed, ring.len);
        }
        reschedule(&mut ring, &weak);
    })
    .abort_handle();

    ring.timer = Some(ArmedTimer {
        id,
        deadline,
        handle,
    });
}

/// 为驻留的连接启动观察任务
fn spawn_watcher<S: Poolable>(weak: Weak<Mutex<Ring<S>>>, index: usize, seq: u64) -> AbortHandle {
    tokio::spawn(async move {
        poll_fn(|cx| {
            let Some(inner) = weak.upgrade() else {
                return Poll::Ready(());
            };
            let mut ring = inner.lock();
            if !ring.contains(index, seq) {
                return Poll::Ready(());
            }

            let reason = match ring.nodes[index].socket.as_mut() {
                Some(socket) => match socket.poll_evicted(cx) {
                    Poll::Ready(reason) => reason,
                    Poll::Pending => return Poll::Pending,
                },
                None => return Poll::Ready(()),
            };

            match &reason {
                Eviction::Error(_) => {
                    warn!("Pooled connection #{} removed with {}", seq, reason)
                }
                _ => debug!("Pooled connection #{} removed: {}", seq, reason),
            }
            // 观察任务自己的 abort 句柄在这里被取走，不影响当前这次返回
            ring.remove(index);
            reschedule(&mut ring, &weak);
            Poll::Ready(())
        })
        .await
    })
    .abort_handle()
}

/// 带过期时间的连接池
///
/// `alloc`/`take` 需要在 tokio 运行时中调用（观察任务和定时器都是 spawn 出来的任务）
pub struct ExpiringPool<S: Poolable> {
    inner: Shared<S>,
    config: PoolConfig,
}

impl<S: Poolable> ExpiringPool<S> {
    /// 创建新的连接池
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Ring::new())),
            config,
        }
    }

    /// 使用默认配置创建连接池（永不过期）
    pub fn with_defaults() -> Self {
        Self::new(PoolConfig::default())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// 放入一个可复用的连接
    pub fn alloc(&self, socket: S) {
        let (expiry, fifo) = match self.config.timeout {
            ExpiryPolicy::Immediate => {
                debug!("Pool timeout is 0, connection is not retained");
                return;
            }
            ExpiryPolicy::Never => (Expiry::Never, true),
            ExpiryPolicy::After(timeout) => (Expiry::At(Instant::now() + timeout), false),
        };

        let weak = Arc::downgrade(&self.inner);
        let mut ring = self.inner.lock();
        let (index, seq) = ring.insert(socket, expiry, fifo);
        ring.nodes[index].watcher = Some(spawn_watcher(weak.clone(), index, seq));
        reschedule(&mut ring, &weak);

        debug!("Pooled connection #{} (pool size: {})", seq, ring.len);
    }

    /// 取出最早过期（或最早放入）的连接，所有权转移给调用方
    pub fn take(&self) -> Option<S> {
        let mut ring = self.inner.lock();
        // 定时器可能还没来得及执行，先清掉已经到期的
        ring.sweep(Instant::now());

        let head = ring.head()?;
        let seq = ring.nodes[head].seq;
        let socket = ring.remove(head);
        reschedule(&mut ring, &Arc::downgrade(&self.inner));

        debug!("Reusing pooled connection #{} (pool size: {})", seq, ring.len);
        socket
    }

    /// 取消定时器，停止所有观察任务并清空连接池
    pub fn destroy(&self) {
        let count = self.inner.lock().clear();

        if count > 0 {
            info!("Connection pool destroyed, dropped {} connections", count);
        }
    }

    /// 当前驻留的连接数
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 是否有已设置的过期定时器
    pub fn has_timer(&self) -> bool {
        self.inner.lock().timer.is_some()
    }
}

impl<S: Poolable> Drop for ExpiringPool<S> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 永远不会失效的测试连接
    #[derive(Debug, PartialEq, Eq)]
    struct Idle(u32);

    impl Poolable for Idle {
        fn poll_evicted(&mut self, _cx: &mut Context<'_>) -> Poll<Eviction> {
            Poll::Pending
        }
    }

    #[test]
    fn test_expiry_policy_from_millis() {
        assert_eq!(ExpiryPolicy::from_millis(-1), ExpiryPolicy::Never);
        assert_eq!(ExpiryPolicy::from_millis(-50), ExpiryPolicy::Never);
        assert_eq!(ExpiryPolicy::from_millis(0), ExpiryPolicy::Immediate);
        assert_eq!(
            ExpiryPolicy::from_millis(500),
            ExpiryPolicy::After(Duration::from_millis(500))
        );
        assert_eq!(i64::from(ExpiryPolicy::After(Duration::from_millis(500))), 500);
    }

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_size, 2);
        assert_eq!(config.timeout, ExpiryPolicy::Never);
    }

    #[test]
    fn test_ring_orders_by_expiry() {
        let now = Instant::now();
        let mut ring: Ring<Idle> = Ring::new();
        let (_, a) = ring.insert(Idle(1), Expiry::At(now + Duration::from_secs(3)), false);
        let (_, b) = ring.insert(Idle(2), Expiry::At(now + Duration::from_secs(1)), false);
        let (_, c) = ring.insert(Idle(3), Expiry::At(now + Duration::from_secs(2)), false);
        // 相同过期时间按到达顺序
        let (_, d) = ring.insert(Idle(4), Expiry::At(now + Duration::from_secs(1)), false);

        assert_eq!(ring.seqs(), vec![b, d, c, a]);
        assert_eq!(ring.head_deadline(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_ring_sweep_and_slot_reuse() {
        let now = Instant::now();
        let mut ring: Ring<Idle> = Ring::new();
        ring.insert(Idle(1), Expiry::At(now), false);
        ring.insert(Idle(2), Expiry::At(now + Duration::from_secs(5)), false);
        ring.insert(Idle(3), Expiry::Never, true);

        assert_eq!(ring.sweep(now), 1);
        assert_eq!(ring.len, 2);

        // 被释放的槽位会被复用，序号继续递增
        let (index, seq) = ring.insert(Idle(4), Expiry::Never, true);
        assert_eq!(index, 1);
        assert_eq!(seq, 4);
        assert!(ring.contains(index, seq));
        assert!(!ring.contains(index, 1));

        assert_eq!(ring.sweep(now + Duration::from_secs(10)), 1);
        assert_eq!(ring.head_deadline(), None);
    }

    #[test]
    fn test_ring_empty_links_to_sentinel() {
        let mut ring: Ring<Idle> = Ring::new();
        let (index, _) = ring.insert(Idle(1), Expiry::Never, true);
        assert_eq!(ring.remove(index), Some(Idle(1)));
        assert_eq!(ring.nodes[SENTINEL].next, SENTINEL);
        assert_eq!(ring.nodes[SENTINEL].prev, SENTINEL);
        assert!(ring.head().is_none());
        assert_eq!(ring.remove(index), None);
    }

    #[tokio::test]
    async fn test_fifo_when_never_expire() {
        let pool = ExpiringPool::with_defaults();
        for i in 1..=4 {
            pool.alloc(Idle(i));
        }
        assert!(!pool.has_timer());

        for i in 1..=4 {
            assert_eq!(pool.take(), Some(Idle(i)));
        }
        assert_eq!(pool.take(), None);
    }

    #[tokio::test]
    async fn test_immediate_expiry_retains_nothing() {
        let pool = ExpiringPool::new(PoolConfig {
            max_size: 2,
            timeout: ExpiryPolicy::Immediate,
        });
        for i in 1..=4 {
            pool.alloc(Idle(i));
        }
        for _ in 0..6 {
            assert_eq!(pool.take(), None);
        }
        assert!(pool.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_tracks_head() {
        let pool = ExpiringPool::new(PoolConfig {
            max_size: 2,
            timeout: ExpiryPolicy::After(Duration::from_millis(500)),
        });
        pool.alloc(Idle(1));
        assert!(pool.has_timer());

        tokio::time::sleep(Duration::from_millis(300)).await;
        pool.alloc(Idle(2));

        // 第一个到期后只剩第二个，定时器重新对准它
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(pool.len(), 1);
        assert!(pool.has_timer());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(pool.is_empty());
        assert!(!pool.has_timer());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_cancels_timer() {
        let pool = ExpiringPool::new(PoolConfig {
            max_size: 2,
            timeout: ExpiryPolicy::After(Duration::from_secs(1)),
        });
        pool.alloc(Idle(1));
        pool.alloc(Idle(2));
        pool.destroy();

        assert!(pool.is_empty());
        assert!(!pool.has_timer());
        assert_eq!(pool.take(), None);

        // 销毁后仍可继续使用
        pool.alloc(Idle(3));
        assert_eq!(pool.take(), Some(Idle(3)));
    }

    #[tokio::test]
    async fn test_sequence_keeps_growing_across_destroy() {
        let pool = ExpiringPool::new(PoolConfig::default());
        pool.alloc(Idle(1));
        pool.alloc(Idle(2));
        let before = pool.inner.lock().seqs();

        pool.destroy();
        pool.alloc(Idle(3));
        let after = pool.inner.lock().seqs();

        assert_eq!(before, vec![1, 2]);
        assert_eq!(after.len(), 1);
        // 复用的槽位不能与销毁前的观察任务序号重合
        assert!(after[0] > *before.last().unwrap());
        assert!(!pool.inner.lock().contains(1, 1));
    }
}
