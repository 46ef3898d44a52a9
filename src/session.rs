/// 隧道会话
///
/// 一条已认证的物理传输连接，按顺序承载多条逻辑流。同一时刻最多一条
/// 逻辑流处于活动状态，流之间通过 `reset` 轮换：复用前必须把上一条流
/// 的残留帧排空到 Close 帧为止，否则旧流的数据会被误记到新流头上。
/// 任何 I/O 或协议错误都会把会话置为 broken，此后所有操作直接失败，
/// 连接池据此把会话永久淘汰
use crate::error::{Result, TunnelError};
use crate::protocol::{ForwardMeta, Pack, PackCodec, PackType, PACK_MAX_DATA_LEN};
use crate::relay::{RelayRead, RelayWrite};
use crate::transport::BoxedTransport;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace};
use uuid::Uuid;

/// reset 排空上一条流时允许的最长等待时间
pub const RESET_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

struct ReadState {
    frames: FramedRead<ReadHalf<BoxedTransport>, PackCodec>,
    /// 尚未读完的数据帧及其消费偏移
    current: Option<Pack>,
    offset: usize,
    /// 对端已对当前流半关闭或关闭
    read_closed: bool,
    /// 已观察到当前流的 Close 帧，reset 可以免排空
    close_observed: bool,
}

struct WriteState {
    frames: FramedWrite<WriteHalf<BoxedTransport>, PackCodec>,
    /// 本端已为当前流发送 Close 帧
    closed: bool,
}

/// 帧会话，读写两半各由一把锁保护，中继的两个方向可以同时操作
pub struct PackSession {
    id: String,
    role: Role,
    stream_seq: AtomicU32,
    broken: AtomicBool,
    reader: Mutex<ReadState>,
    writer: Mutex<WriteState>,
}

impl PackSession {
    /// 客户端：包装一条刚拨号成功的传输连接
    pub fn connect(transport: BoxedTransport) -> Self {
        Self::new(transport, Role::Client)
    }

    /// 服务器端：包装一条刚接受的传输连接
    pub fn accept(transport: BoxedTransport) -> Self {
        Self::new(transport, Role::Server)
    }

    fn new(transport: BoxedTransport, role: Role) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(8);
        Self {
            id,
            role,
            stream_seq: AtomicU32::new(0),
            broken: AtomicBool::new(false),
            reader: Mutex::new(ReadState {
                frames: FramedRead::new(read_half, PackCodec),
                current: None,
                offset: 0,
                read_closed: false,
                close_observed: false,
            }),
            writer: Mutex::new(WriteState {
                frames: FramedWrite::new(write_half, PackCodec),
                closed: false,
            }),
        }
    }

    /// 日志用的会话标识
    pub fn id(&self) -> &str {
        &self.id
    }

    /// 当前逻辑流的序号
    pub fn stream_seq(&self) -> u32 {
        self.stream_seq.load(Ordering::SeqCst)
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.is_broken() {
            return Err(TunnelError::SessionBroken);
        }
        Ok(())
    }

    async fn recv_pack(&self, reader: &mut ReadState) -> Result<Pack> {
        match reader.frames.next().await {
            Some(Ok(pack)) => {
                trace!(session = %self.id, %pack, "recv pack");
                Ok(pack)
            }
            Some(Err(e)) => {
                self.mark_broken();
                Err(e)
            }
            None => {
                // 对端没有走协议收尾就关掉了底层连接
                self.mark_broken();
                Err(TunnelError::ConnectionReset)
            }
        }
    }

    /// 发送 Dial 帧，把当前逻辑流绑定到目标地址
    ///
    /// 不等待远端确认；远端连接失败只会表现为这条流没有数据就收到 Close
    pub async fn bind(&self, meta: &ForwardMeta) -> Result<()> {
        self.ensure_usable()?;
        let mut writer = self.writer.lock().await;
        if writer.closed {
            return Err(TunnelError::StreamClosed);
        }
        let pack = Pack::new(PackType::Dial, self.stream_seq(), meta.marshal())?;
        trace!(session = %self.id, target = %meta, "send dial");
        match writer.frames.send(pack).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.mark_broken();
                Err(e)
            }
        }
    }

    /// 写入当前逻辑流，超过单帧上限的数据按序拆成多个 Data 帧
    ///
    /// 不暴露部分写：要么全部送出，要么报错并把会话标记为 broken
    pub async fn write(&self, buf: &[u8]) -> Result<()> {
        self.ensure_usable()?;
        let mut writer = self.writer.lock().await;
        if writer.closed {
            return Err(TunnelError::StreamClosed);
        }
        let seq = self.stream_seq();
        for chunk in buf.chunks(PACK_MAX_DATA_LEN) {
            let pack = Pack::new(PackType::Data, seq, Bytes::copy_from_slice(chunk))?;
            if let Err(e) = writer.frames.feed(pack).await {
                self.mark_broken();
                return Err(e);
            }
        }
        if let Err(e) = writer.frames.flush().await {
            self.mark_broken();
            return Err(e);
        }
        Ok(())
    }

    /// 读取当前逻辑流的数据
    ///
    /// 对端半关闭（CloseWrite）或关闭（Close）后返回 Ok(0)；Disconnect、
    /// 序号不匹配和 I/O 错误都作为错误返回并把会话标记为 broken
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_usable()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let mut reader = self.reader.lock().await;
        if reader.read_closed {
            return Ok(0);
        }

        loop {
            if let Some(pack) = reader.current.take() {
                if reader.offset < pack.payload.len() {
                    let n = (pack.payload.len() - reader.offset).min(buf.len());
                    buf[..n].copy_from_slice(&pack.payload[reader.offset..reader.offset + n]);
                    reader.offset += n;
                    if reader.offset < pack.payload.len() {
                        reader.current = Some(pack);
                    } else {
                        reader.offset = 0;
                    }
                    return Ok(n);
                }
                reader.offset = 0;
            }

            let pack = self.recv_pack(&mut reader).await?;
            let expected = self.stream_seq();
            if pack.stream != expected {
                self.mark_broken();
                return Err(TunnelError::UnexpectedStream {
                    expected,
                    actual: pack.stream,
                });
            }
            match pack.pack_type {
                PackType::Data => {
                    reader.current = Some(pack);
                    reader.offset = 0;
                }
                PackType::CloseWrite => {
                    reader.read_closed = true;
                    return Ok(0);
                }
                PackType::Close => {
                    reader.read_closed = true;
                    reader.close_observed = true;
                    return Ok(0);
                }
                PackType::Disconnect => {
                    self.mark_broken();
                    return Err(TunnelError::Disconnected(
                        String::from_utf8_lossy(&pack.payload).into_owned(),
                    ));
                }
                PackType::Dial => {
                    self.mark_broken();
                    return Err(TunnelError::protocol("unexpected dial frame mid-stream"));
                }
            }
        }
    }

    /// 半关闭：告知对端本方向不再有数据，但仍可继续读
    pub async fn close_write(&self) -> Result<()> {
        self.ensure_usable()?;
        let mut writer = self.writer.lock().await;
        if writer.closed {
            return Err(TunnelError::StreamClosed);
        }
        let pack = Pack::control(PackType::CloseWrite, self.stream_seq());
        match writer.frames.send(pack).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.mark_broken();
                Err(e)
            }
        }
    }

    /// 结束当前逻辑流（幂等），不关闭底层连接
    pub async fn close(&self) -> Result<()> {
        self.ensure_usable()?;
        let mut writer = self.writer.lock().await;
        if writer.closed {
            return Ok(());
        }
        writer.closed = true;
        let pack = Pack::control(PackType::Close, self.stream_seq());
        match writer.frames.send(pack).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.mark_broken();
                Err(e)
            }
        }
    }

    /// 为复用做准备：排空上一条流的残留帧直到观察到它的 Close 帧，
    /// 然后递增流序号并清空流状态
    ///
    /// 排空失败（超时、错误、序号违例）时本方法报错，调用方必须改走
    /// `disconnect`，绝不能继续复用
    pub async fn reset(&self) -> Result<()> {
        self.reset_with_timeout(RESET_DRAIN_TIMEOUT).await
    }

    pub async fn reset_with_timeout(&self, drain_timeout: Duration) -> Result<()> {
        self.ensure_usable()?;
        let mut reader = self.reader.lock().await;

        if !reader.close_observed {
            let expected = self.stream_seq();
            let drain = async {
                loop {
                    let pack = self.recv_pack(&mut reader).await?;
                    if pack.stream != expected {
                        self.mark_broken();
                        return Err(TunnelError::UnexpectedStream {
                            expected,
                            actual: pack.stream,
                        });
                    }
                    match pack.pack_type {
                        PackType::Close => return Ok(()),
                        PackType::Disconnect => {
                            self.mark_broken();
                            return Err(TunnelError::Disconnected(
                                String::from_utf8_lossy(&pack.payload).into_owned(),
                            ));
                        }
                        _ => continue,
                    }
                }
            };
            match tokio::time::timeout(drain_timeout, drain).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    self.mark_broken();
                    return Err(TunnelError::timeout(drain_timeout));
                }
            }
        }

        reader.current = None;
        reader.offset = 0;
        reader.read_closed = false;
        reader.close_observed = false;

        let mut writer = self.writer.lock().await;
        writer.closed = false;
        drop(writer);

        let seq = self.stream_seq.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(session = %self.id, seq, "session reset for reuse");
        Ok(())
    }

    /// 永久断开底层连接（不可逆）
    ///
    /// 客户端先尽力发送 Disconnect 帧告知原因；服务器端从不发送该帧。
    /// 底层套接字在会话释放时完全关闭
    pub async fn disconnect(&self, reason: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if self.role == Role::Client && !self.is_broken() {
            let len = reason.len().min(PACK_MAX_DATA_LEN);
            let pack = Pack {
                pack_type: PackType::Disconnect,
                stream: self.stream_seq(),
                payload: Bytes::copy_from_slice(&reason.as_bytes()[..len]),
            };
            if let Err(e) = writer.frames.send(pack).await {
                debug!(session = %self.id, error = %e, "failed to send disconnect frame");
            }
        }
        self.mark_broken();
        writer.frames.get_mut().shutdown().await.ok();
        debug!(session = %self.id, %reason, "transport connection closed");
        Ok(())
    }

    /// 服务器端：等待下一条流的 Dial 帧并采用其序号，期间丢弃上一条流
    /// 的残留帧（这是服务器侧的排空路径）
    pub async fn accept_stream(&self) -> Result<ForwardMeta> {
        debug_assert!(self.role == Role::Server);
        self.ensure_usable()?;
        let mut reader = self.reader.lock().await;

        loop {
            let pack = self.recv_pack(&mut reader).await?;
            match pack.pack_type {
                PackType::Dial => {
                    let meta = match ForwardMeta::unmarshal(&pack.payload) {
                        Ok(meta) => meta,
                        Err(e) => {
                            self.mark_broken();
                            return Err(e);
                        }
                    };
                    self.stream_seq.store(pack.stream, Ordering::SeqCst);
                    reader.current = None;
                    reader.offset = 0;
                    reader.read_closed = false;
                    reader.close_observed = false;

                    let mut writer = self.writer.lock().await;
                    writer.closed = false;
                    return Ok(meta);
                }
                PackType::Disconnect => {
                    self.mark_broken();
                    return Err(TunnelError::Disconnected(
                        String::from_utf8_lossy(&pack.payload).into_owned(),
                    ));
                }
                _ => {
                    trace!(session = %self.id, %pack, "discard stale frame");
                }
            }
        }
    }

    /// 拆成中继用的读写两半，供两个方向同时泵数据
    pub fn split(&self) -> (SessionReadHalf<'_>, SessionWriteHalf<'_>) {
        (
            SessionReadHalf { session: self },
            SessionWriteHalf { session: self },
        )
    }
}

pub struct SessionReadHalf<'a> {
    session: &'a PackSession,
}

pub struct SessionWriteHalf<'a> {
    session: &'a PackSession,
}

#[async_trait]
impl RelayRead for SessionReadHalf<'_> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.session.read(buf).await
    }
}

#[async_trait]
impl RelayWrite for SessionWriteHalf<'_> {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.session.write(buf).await
    }

    async fn close_write(&mut self) -> Result<()> {
        match self.session.close_write().await {
            // Close 已发出，流已整体结束
            Err(TunnelError::StreamClosed) => Ok(()),
            other => other,
        }
    }
}
