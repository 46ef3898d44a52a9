use super::{BoxedTransport, TransportClient, TransportServer};
use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

/// 建立传输连接的默认超时
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TLS 传输客户端
pub struct TlsTransportClient {
    server_addr: String,
    server_port: u16,
    /// TLS SNI 覆盖，缺省使用 server_addr
    server_name: Option<String>,
    connector: TlsConnector,
    connect_timeout: Duration,
}

impl TlsTransportClient {
    pub fn new(
        server_addr: String,
        server_port: u16,
        server_name: Option<String>,
        connector: TlsConnector,
    ) -> Self {
        Self {
            server_addr,
            server_port,
            server_name,
            connector,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl TransportClient for TlsTransportClient {
    async fn connect(&self) -> Result<BoxedTransport> {
        let addr = format!("{}:{}", self.server_addr, self.server_port);

        let tcp_stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TunnelError::timeout(self.connect_timeout))?
            .map_err(|e| TunnelError::connection_failed(&addr, e))?;

        apply_keepalive(&tcp_stream);

        let sni = self
            .server_name
            .clone()
            .unwrap_or_else(|| self.server_addr.clone());
        let server_name = ServerName::try_from(sni)
            .map_err(|e| TunnelError::protocol(format!("invalid server name: {e}")))?;

        let tls_stream = self.connector.connect(server_name, tcp_stream).await?;

        debug!(%addr, "TLS connection established");
        Ok(Box::pin(tls_stream))
    }
}

/// 给传输套接字打开 TCP keepalive，及早发现静默断开的对端
fn apply_keepalive(stream: &TcpStream) {
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));

    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!("Failed to set TCP keepalive: {}", e);
    }
}

/// TLS 传输服务器
pub struct TlsTransportServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsTransportServer {
    pub async fn bind(bind_addr: &str, bind_port: u16, acceptor: TlsAcceptor) -> Result<Self> {
        let addr = format!("{bind_addr}:{bind_port}");
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| TunnelError::connection_failed(&addr, e))?;

        info!("TLS transport server listening on {}", addr);

        Ok(Self { listener, acceptor })
    }

    /// 实际绑定到的地址（bind_port 为 0 时由内核分配）
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl TransportServer for TlsTransportServer {
    async fn accept(&self) -> Result<(BoxedTransport, SocketAddr)> {
        let (tcp_stream, peer_addr) = self.listener.accept().await?;

        apply_keepalive(&tcp_stream);

        let tls_stream = self.acceptor.accept(tcp_stream).await?;

        debug!(%peer_addr, "TLS handshake completed");
        Ok((Box::pin(tls_stream), peer_addr))
    }
}
