use crate::protocol::ForwardMeta;
use crate::relay::{relay, IoReader, IoWriter};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// 规则引擎面向的处理器契约
///
/// 规则匹配（域名/GEOIP/CIDR）由外部协作者完成；匹配出的动作落到
/// 这里的某个实现上：拒绝、直连，或经转发客户端走隧道
#[async_trait]
pub trait RuleHandler: Send + Sync {
    /// 处理一条已接受的本地连接；目标由前端握手解析得出
    async fn handle_conn(&self, local: TcpStream, remote: &ForwardMeta);
}

/// 拒绝动作：记录并丢弃连接
pub struct RejectHandler;

#[async_trait]
impl RuleHandler for RejectHandler {
    async fn handle_conn(&self, local: TcpStream, remote: &ForwardMeta) {
        info!(target = %remote, "reject connect");
        drop(local);
    }
}

/// 直连动作：本机直接拨号目标并中继，不经过隧道
pub struct DirectHandler {
    pub connect_timeout: Duration,
}

impl Default for DirectHandler {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl RuleHandler for DirectHandler {
    async fn handle_conn(&self, mut local: TcpStream, remote: &ForwardMeta) {
        info!(target = %remote, "direct connect");
        let mut remote_conn = match tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(&remote.address),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!(target = %remote, error = %e, "direct dial failed");
                return;
            }
            Err(_) => {
                warn!(target = %remote, "direct dial timed out");
                return;
            }
        };

        let (local_read, local_write) = local.split();
        let (remote_read, remote_write) = remote_conn.split();
        let stats = relay(
            IoReader(local_read),
            IoWriter(local_write),
            IoReader(remote_read),
            IoWriter(remote_write),
        )
        .await;
        debug!(
            target = %remote,
            uploaded = stats.uploaded,
            downloaded = stats.downloaded,
            "direct connect finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_direct_handler_relays_to_destination() {
        // 目标：一个回显一次的服务
        let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = destination.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = destination.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).await.unwrap();
            conn.write_all(&buf[..n]).await.unwrap();
        });

        let entry = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let entry_addr = entry.local_addr().unwrap();
        let meta = ForwardMeta::tcp(dest_addr.to_string()).unwrap();
        tokio::spawn(async move {
            let (local, _) = entry.accept().await.unwrap();
            DirectHandler::default().handle_conn(local, &meta).await;
        });

        let mut conn = TcpStream::connect(entry_addr).await.unwrap();
        conn.write_all(b"echo me").await.unwrap();
        let mut buf = [0u8; 64];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"echo me");
    }

    #[tokio::test]
    async fn test_reject_handler_drops_connection() {
        let entry = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let entry_addr = entry.local_addr().unwrap();
        tokio::spawn(async move {
            let (local, _) = entry.accept().await.unwrap();
            let meta = ForwardMeta::tcp("example.com:80").unwrap();
            RejectHandler.handle_conn(local, &meta).await;
        });

        let mut conn = TcpStream::connect(entry_addr).await.unwrap();
        let mut buf = [0u8; 8];
        // 连接应当被直接关闭
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    }
}
