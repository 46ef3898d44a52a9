/// 隧道服务器
///
/// 接受双向 TLS 传输连接，每条连接一个任务；任务内按顺序处理逻辑流：
/// 等 Dial、拨号真实目标、中继、发 Close，再等下一个 Dial。客户端的
/// Disconnect 帧或任何协议违例都结束整条传输连接
use crate::config::ServerConfig;
use crate::error::Result;
use crate::relay::{relay, IoReader, IoWriter};
use crate::session::PackSession;
use crate::transport::{TlsTransportServer, TransportServer};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub async fn run_server(
    config: ServerConfig,
    acceptor: TlsAcceptor,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let server = TlsTransportServer::bind(&config.bind_addr, config.bind_port, acceptor).await?;
    run_server_with(server, config.dial_timeout(), shutdown).await
}

/// 用已绑定的监听器运行，端口 0 的测试场景由调用方先查询实际地址
pub async fn run_server_with(
    server: TlsTransportServer,
    dial_timeout: Duration,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("tunnel server shutting down");
                return Ok(());
            }
            accepted = server.accept() => {
                match accepted {
                    Ok((transport, peer_addr)) => {
                        debug!(%peer_addr, "transport connection accepted");
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            let session = PackSession::accept(transport);
                            tokio::select! {
                                result = serve_transport(&session, dial_timeout) => {
                                    if let Err(e) = result {
                                        debug!(session = %session.id(), %peer_addr, error = %e, "transport connection finished");
                                    }
                                }
                                _ = shutdown.cancelled() => {}
                            }
                            session.disconnect("connection finished").await.ok();
                        });
                    }
                    Err(e) => {
                        // 单次握手失败不影响后续连接
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
}

/// 一条传输连接上的逻辑流循环
async fn serve_transport(session: &PackSession, dial_timeout: Duration) -> Result<()> {
    loop {
        let meta = session.accept_stream().await?;
        debug!(
            session = %session.id(),
            target = %meta,
            seq = session.stream_seq(),
            "stream dial"
        );

        if meta.network != "tcp" {
            warn!(session = %session.id(), target = %meta, "unsupported network, refusing stream");
            session.close().await?;
            continue;
        }

        // Dial 不回执；拨号失败时对端只会看到没有数据就收到 Close
        let mut remote =
            match tokio::time::timeout(dial_timeout, TcpStream::connect(&meta.address)).await {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    debug!(session = %session.id(), target = %meta, error = %e, "destination dial failed");
                    session.close().await?;
                    continue;
                }
                Err(_) => {
                    debug!(session = %session.id(), target = %meta, "destination dial timed out");
                    session.close().await?;
                    continue;
                }
            };

        let stats = {
            let (remote_read, remote_write) = remote.split();
            let (session_read, session_write) = session.split();
            relay(
                session_read,
                session_write,
                IoReader(remote_read),
                IoWriter(remote_write),
            )
            .await
        };
        debug!(
            session = %session.id(),
            target = %meta,
            received = stats.uploaded,
            sent = stats.downloaded,
            "stream finished"
        );

        session.close().await?;
    }
}
