/// 双向中继
///
/// 在两个连接之间并发泵送字节，任一方向到达 EOF 时向该方向的写端
/// 传播半关闭，让对端看到"请求体结束"而不是整条连接被拆掉；两个
/// 方向都结束后返回。连接本身的关闭/归还由调用方负责
use crate::error::Result;
use crate::protocol::PACK_MAX_DATA_LEN;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// 单次拷贝的缓冲区大小，与单帧负载对齐，一次读正好装满一个 Data 帧
const RELAY_BUFFER_SIZE: usize = PACK_MAX_DATA_LEN;

/// 中继源端能力：读
#[async_trait]
pub trait RelayRead: Send {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// 中继汇端能力：写与半关闭
#[async_trait]
pub trait RelayWrite: Send {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// 半关闭：本方向不再有数据（TCP 上对应发送 FIN）
    async fn close_write(&mut self) -> Result<()>;
}

/// 把任意 AsyncRead 接入中继
pub struct IoReader<R>(pub R);

#[async_trait]
impl<R> RelayRead for IoReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.0.read(buf).await?)
    }
}

/// 把任意 AsyncWrite 接入中继
pub struct IoWriter<W>(pub W);

#[async_trait]
impl<W> RelayWrite for IoWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        Ok(self.0.write_all(buf).await?)
    }

    async fn close_write(&mut self) -> Result<()> {
        Ok(self.0.shutdown().await?)
    }
}

/// 单次中继的流量统计
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayStats {
    /// 本地到远端的字节数
    pub uploaded: u64,
    /// 远端到本地的字节数
    pub downloaded: u64,
}

/// 在本地连接与远端连接之间双向拷贝，直到两个方向都结束
///
/// 拷贝错误不会 panic：记录日志并只停掉出错的方向，另一方向继续
/// 排空剩余数据
pub async fn relay<LR, LW, RR, RW>(
    mut local_read: LR,
    mut local_write: LW,
    mut remote_read: RR,
    mut remote_write: RW,
) -> RelayStats
where
    LR: RelayRead,
    LW: RelayWrite,
    RR: RelayRead,
    RW: RelayWrite,
{
    let upstream = copy_direction(&mut local_read, &mut remote_write, "upstream");
    let downstream = copy_direction(&mut remote_read, &mut local_write, "downstream");
    let (uploaded, downloaded) = tokio::join!(upstream, downstream);
    RelayStats {
        uploaded,
        downloaded,
    }
}

async fn copy_direction<R, W>(src: &mut R, dst: &mut W, direction: &str) -> u64
where
    R: RelayRead + ?Sized,
    W: RelayWrite + ?Sized,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = dst.write_all(&buf[..n]).await {
                    debug!(direction, error = %e, "relay write error");
                    break;
                }
                total += n as u64;
            }
            Err(e) => {
                debug!(direction, error = %e, "relay read error");
                break;
            }
        }
    }
    if let Err(e) = dst.close_write().await {
        debug!(direction, error = %e, "relay close-write error");
    }
    total
}
