mod tls;

pub use tls::{TlsTransportClient, TlsTransportServer};

use crate::error::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

/// 传输层连接抽象
///
/// 会话层只要求一个有序字节流，具体由哪种安全传输承载（TLS over TCP、
/// QUIC 流等）由各绑定决定；帧发送前传输必须已完成认证
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

// 为所有满足条件的类型自动实现 Transport
impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 装箱的传输层连接
pub type BoxedTransport = Pin<Box<dyn Transport>>;

/// 传输层客户端接口
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// 连接到服务器并返回传输层连接
    async fn connect(&self) -> Result<BoxedTransport>;
}

/// 传输层服务器接口
#[async_trait]
pub trait TransportServer: Send + Sync {
    /// 接受新的传输层连接
    async fn accept(&self) -> Result<(BoxedTransport, SocketAddr)>;
}
