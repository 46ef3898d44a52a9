/// 连接池
///
/// 维护一个有界的空闲会话集合：按需惰性拨号，逻辑流结束后回收复用，
/// 空闲超时或损坏的会话永久淘汰。空闲集中的会话保证已成功 reset，
/// 取出后在归还前不会被第二个调用方拿到
use crate::error::Result;
use crate::protocol::ForwardMeta;
use crate::session::PackSession;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// 建立新传输连接的拨号函数
pub type SessionDialer = Arc<dyn Fn() -> BoxFuture<'static, Result<PackSession>> + Send + Sync>;

/// 连接池配置
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// 空闲集合容量，归还时已满则直接断开
    pub max_conns: usize,
    /// 连接最大空闲时间，超过后由后台任务断开
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_conns: 200,
            idle_timeout: Duration::from_secs(600),
        }
    }
}

struct IdleEntry {
    session: PackSession,
    last_used: Instant,
}

impl IdleEntry {
    fn is_expired(&self, idle_timeout: Duration) -> bool {
        self.last_used.elapsed() > idle_timeout
    }
}

#[derive(Default)]
struct Counters {
    dials: AtomicU64,
    streams: AtomicU64,
    recovers: AtomicU64,
    disconnects: AtomicU64,
}

/// 计数器快照，仅用于观测，不参与正确性
#[derive(Debug, Clone, Copy)]
pub struct PoolCounters {
    /// 新建的传输连接数
    pub dials: u64,
    /// 绑定过的逻辑流数
    pub streams: u64,
    /// 归还回池的次数
    pub recovers: u64,
    /// 断开的传输连接数
    pub disconnects: u64,
    /// 当前空闲会话数
    pub idle: usize,
}

pub struct ConnPool {
    config: PoolConfig,
    dialer: SessionDialer,
    idle: Mutex<VecDeque<IdleEntry>>,
    /// 唤醒空闲淘汰任务：有新条目入队时重算最早到期时间
    notify: Arc<Notify>,
    counters: Counters,
}

impl ConnPool {
    /// 创建连接池并启动空闲淘汰后台任务（随池一同存活）
    pub fn new(config: PoolConfig, dialer: SessionDialer) -> Arc<Self> {
        let pool = Arc::new(Self {
            config,
            dialer,
            idle: Mutex::new(VecDeque::new()),
            notify: Arc::new(Notify::new()),
            counters: Counters::default(),
        });
        Self::spawn_eviction(&pool);
        pool
    }

    /// 取一个会话并把它绑定到目标：优先复用空闲会话，否则拨号一次
    ///
    /// 空闲集为空时总是直接拨号而不是阻塞等待归还，用连接数换延迟。
    /// 绑定失败的会话立刻断开，错误原样上抛，由调用方决定重试策略
    pub async fn dial_target(&self, meta: &ForwardMeta) -> Result<PackSession> {
        let session = match self.take_idle().await {
            Some(session) => session,
            None => {
                self.counters.dials.fetch_add(1, Ordering::Relaxed);
                (self.dialer)().await?
            }
        };

        if let Err(e) = session.bind(meta).await {
            self.disconnect(session, "bind error").await;
            return Err(e);
        }

        self.counters.streams.fetch_add(1, Ordering::Relaxed);
        let c = self.counters();
        debug!(
            target = %meta,
            idle = c.idle,
            streams = c.streams,
            dials = c.dials,
            recovers = c.recovers,
            disconnects = c.disconnects,
            "dial status"
        );
        Ok(session)
    }

    /// 逻辑流干净结束后归还会话
    ///
    /// 先 reset 再入队；损坏或 reset 失败的会话改走断开，绝不回池。
    /// 空闲集已满时断开而不是阻塞调用方
    pub async fn put(&self, session: PackSession) {
        self.counters.recovers.fetch_add(1, Ordering::Relaxed);

        if session.is_broken() {
            self.disconnect(session, "broken connection").await;
            return;
        }
        if let Err(e) = session.reset().await {
            debug!(session = %session.id(), error = %e, "reset failed");
            self.disconnect(session, "reset error").await;
            return;
        }

        let overflow = {
            let mut idle = self.idle.lock();
            if idle.len() >= self.config.max_conns {
                Some(session)
            } else {
                idle.push_back(IdleEntry {
                    session,
                    last_used: Instant::now(),
                });
                None
            }
        };
        match overflow {
            Some(session) => {
                self.disconnect(session, "pool is full").await;
            }
            None => {
                self.notify.notify_one();
            }
        }
    }

    /// 断开会话并保持计数一致，所有淘汰路径都走这里
    pub async fn disconnect(&self, session: PackSession, reason: &str) {
        self.counters.disconnects.fetch_add(1, Ordering::Relaxed);
        warn!(session = %session.id(), %reason, "disconnect pooled session");
        session.disconnect(reason).await.ok();
    }

    pub fn counters(&self) -> PoolCounters {
        PoolCounters {
            dials: self.counters.dials.load(Ordering::Relaxed),
            streams: self.counters.streams.load(Ordering::Relaxed),
            recovers: self.counters.recovers.load(Ordering::Relaxed),
            disconnects: self.counters.disconnects.load(Ordering::Relaxed),
            idle: self.idle.lock().len(),
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// 后进先出地取空闲会话；顺手淘汰取到的过期或损坏条目
    async fn take_idle(&self) -> Option<PackSession> {
        loop {
            let entry = self.idle.lock().pop_back()?;
            if entry.is_expired(self.config.idle_timeout) {
                self.disconnect(entry.session, "idle timeout").await;
                continue;
            }
            if entry.session.is_broken() {
                self.disconnect(entry.session, "broken connection").await;
                continue;
            }
            return Some(entry.session);
        }
    }

    /// 最老空闲条目的到期时刻
    fn oldest_deadline(&self) -> Option<Instant> {
        self.idle
            .lock()
            .front()
            .map(|e| e.last_used + self.config.idle_timeout)
    }

    async fn evict_expired(&self) {
        let expired: Vec<IdleEntry> = {
            let mut idle = self.idle.lock();
            let mut out = Vec::new();
            while let Some(front) = idle.front() {
                if !front.is_expired(self.config.idle_timeout) {
                    break;
                }
                if let Some(entry) = idle.pop_front() {
                    out.push(entry);
                }
            }
            out
        };
        for entry in expired {
            self.disconnect(entry.session, "idle timeout").await;
        }
    }

    /// 单个后台任务拥有淘汰逻辑：睡到最老条目到期，或被新条目唤醒后
    /// 重算等待时间，避免给每个连接单独起定时器
    fn spawn_eviction(pool: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(pool);
        let notify = pool.notify.clone();
        tokio::spawn(async move {
            loop {
                let deadline = match weak.upgrade() {
                    Some(pool) => pool.oldest_deadline(),
                    None => break,
                };
                match deadline {
                    Some(deadline) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(deadline) => {}
                            _ = notify.notified() => {}
                        }
                    }
                    None => notify.notified().await,
                }
                match weak.upgrade() {
                    Some(pool) => pool.evict_expired().await,
                    None => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// 拨号即得到一对内存会话，对端任务模拟隧道服务器：接受流、
    /// 读到 EOF、回 Close，循环往复
    fn memory_dialer(dial_count: Arc<AtomicUsize>) -> SessionDialer {
        Arc::new(move || {
            let dial_count = dial_count.clone();
            Box::pin(async move {
                dial_count.fetch_add(1, Ordering::SeqCst);
                let (a, b) = tokio::io::duplex(256 * 1024);
                let server = PackSession::accept(Box::pin(b));
                tokio::spawn(async move {
                    loop {
                        if server.accept_stream().await.is_err() {
                            return;
                        }
                        let mut buf = [0u8; 4096];
                        loop {
                            match server.read(&mut buf).await {
                                Ok(0) => break,
                                Ok(_) => continue,
                                Err(_) => return,
                            }
                        }
                        if server.close().await.is_err() {
                            return;
                        }
                    }
                });
                Ok(PackSession::connect(Box::pin(a)))
            })
        })
    }

    fn test_meta() -> ForwardMeta {
        ForwardMeta::tcp("example.com:80").unwrap()
    }

    #[tokio::test]
    async fn test_dial_and_put_reuses_session() {
        let dials = Arc::new(AtomicUsize::new(0));
        let pool = ConnPool::new(PoolConfig::default(), memory_dialer(dials.clone()));

        let session = pool.dial_target(&test_meta()).await.unwrap();
        session.write(b"one").await.unwrap();
        session.close().await.unwrap();
        pool.put(session).await;
        assert_eq!(pool.idle_count(), 1);

        let session = pool.dial_target(&test_meta()).await.unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert_eq!(session.stream_seq(), 1);
        session.close().await.unwrap();
        pool.put(session).await;

        let c = pool.counters();
        assert_eq!(c.streams, 2);
        assert_eq!(c.recovers, 2);
        assert_eq!(c.disconnects, 0);
    }

    #[tokio::test]
    async fn test_concurrent_cycles_bounded_by_pool() {
        const N: usize = 4;
        let dials = Arc::new(AtomicUsize::new(0));
        let pool = ConnPool::new(
            PoolConfig {
                max_conns: N,
                ..Default::default()
            },
            memory_dialer(dials.clone()),
        );

        for _wave in 0..2 {
            let mut tasks = Vec::new();
            for _ in 0..N {
                let pool = pool.clone();
                tasks.push(tokio::spawn(async move {
                    let session = pool.dial_target(&test_meta()).await.unwrap();
                    session.write(b"req").await.unwrap();
                    session.close().await.unwrap();
                    pool.put(session).await;
                }));
            }
            for task in tasks {
                task.await.unwrap();
            }
        }

        // 第二轮完全复用第一轮归还的连接
        assert!(dials.load(Ordering::SeqCst) <= N);
        assert_eq!(pool.counters().streams, (N * 2) as u64);
    }

    #[tokio::test]
    async fn test_put_broken_session_disconnects() {
        let dials = Arc::new(AtomicUsize::new(0));
        let pool = ConnPool::new(PoolConfig::default(), memory_dialer(dials.clone()));

        let session = pool.dial_target(&test_meta()).await.unwrap();
        session.disconnect("simulated failure").await.unwrap();
        assert!(session.is_broken());

        pool.put(session).await;
        assert_eq!(pool.idle_count(), 0);
        assert!(pool.counters().disconnects >= 1);
    }

    #[tokio::test]
    async fn test_put_over_capacity_disconnects() {
        let dials = Arc::new(AtomicUsize::new(0));
        let pool = ConnPool::new(
            PoolConfig {
                max_conns: 1,
                ..Default::default()
            },
            memory_dialer(dials.clone()),
        );

        let first = pool.dial_target(&test_meta()).await.unwrap();
        let second = pool.dial_target(&test_meta()).await.unwrap();
        first.close().await.unwrap();
        second.close().await.unwrap();

        pool.put(first).await;
        pool.put(second).await;

        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.counters().disconnects, 1);
    }

    #[tokio::test]
    async fn test_idle_eviction_by_background_task() {
        let dials = Arc::new(AtomicUsize::new(0));
        let pool = ConnPool::new(
            PoolConfig {
                max_conns: 4,
                idle_timeout: Duration::from_millis(50),
            },
            memory_dialer(dials.clone()),
        );

        let session = pool.dial_target(&test_meta()).await.unwrap();
        session.close().await.unwrap();
        pool.put(session).await;
        assert_eq!(pool.idle_count(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.counters().disconnects, 1);

        // 淘汰后再取必然重新拨号
        let _session = pool.dial_target(&test_meta()).await.unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dialer_error_is_surfaced() {
        let dialer: SessionDialer = Arc::new(|| {
            Box::pin(async {
                Err(crate::error::TunnelError::connection_failed(
                    "127.0.0.1:1",
                    std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
                ))
            })
        });
        let pool = ConnPool::new(PoolConfig::default(), dialer);
        assert!(pool.dial_target(&test_meta()).await.is_err());
    }
}
