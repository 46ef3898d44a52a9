mod handler;
mod listener;

pub use handler::{DirectHandler, RejectHandler, RuleHandler};
pub use listener::ForwardListener;

use crate::config::ClientFullConfig;
use crate::error::Result;
use crate::pool::{ConnPool, PoolConfig, PoolCounters, SessionDialer};
use crate::protocol::ForwardMeta;
use crate::relay::{relay, IoReader, IoWriter};
use crate::session::PackSession;
use crate::transport::{TlsTransportClient, TransportClient};
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 转发客户端
///
/// 把连接池、传输拨号器和中继装配成"把这条本地连接隧道到目标"的
/// 操作；规则引擎通过 RuleHandler 契约使用它
pub struct ForwardClient {
    name: String,
    pool: Arc<ConnPool>,
    shutdown: CancellationToken,
}

impl ForwardClient {
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn TransportClient>,
        pool_config: PoolConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let dialer: SessionDialer = Arc::new(move || {
            let transport = transport.clone();
            Box::pin(async move {
                let stream = transport.connect().await?;
                let session = PackSession::connect(stream);
                debug!(session = %session.id(), "transport connection established");
                Ok(session)
            })
        });
        Self {
            name: name.into(),
            pool: ConnPool::new(pool_config, dialer),
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn counters(&self) -> PoolCounters {
        self.pool.counters()
    }

    /// 为一条逻辑流获取并绑定隧道会话
    ///
    /// 调用方用完后必须把会话交还连接池（put 或 disconnect）
    pub async fn dial(&self, meta: &ForwardMeta) -> Result<PackSession> {
        self.pool.dial_target(meta).await
    }

    /// 把一条本地连接经隧道转发到目标，结束后归还会话
    ///
    /// 客户端正在关停时中继被打断，状态不确定的会话直接断开、不回池
    pub async fn relay_conn(&self, mut local: TcpStream, meta: &ForwardMeta) -> Result<()> {
        let session = self.pool.dial_target(meta).await?;
        debug!(session = %session.id(), target = %meta, "forward stream opened");

        let mut cancelled = false;
        {
            let (local_read, local_write) = local.split();
            let (session_read, session_write) = session.split();
            let fut = relay(
                IoReader(local_read),
                IoWriter(local_write),
                session_read,
                session_write,
            );
            tokio::pin!(fut);
            tokio::select! {
                stats = &mut fut => {
                    debug!(
                        session = %session.id(),
                        target = %meta,
                        uploaded = stats.uploaded,
                        downloaded = stats.downloaded,
                        "forward stream finished"
                    );
                }
                _ = self.shutdown.cancelled() => {
                    cancelled = true;
                }
            }
        }

        if cancelled {
            self.pool.disconnect(session, "client shutting down").await;
            return Ok(());
        }

        if let Err(e) = session.close().await {
            debug!(session = %session.id(), error = %e, "close stream failed");
        }
        self.pool.put(session).await;
        Ok(())
    }
}

#[async_trait]
impl RuleHandler for ForwardClient {
    async fn handle_conn(&self, local: TcpStream, remote: &ForwardMeta) {
        info!(server = %self.name, target = %remote, "forward connect");
        if let Err(e) = self.relay_conn(local, remote).await {
            warn!(server = %self.name, target = %remote, error = %e, "forward failed");
        }
    }
}

/// 运行隧道客户端：装配转发客户端并启动全部本地入口
pub async fn run_client(
    config: ClientFullConfig,
    connector: TlsConnector,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let client_config = &config.client;
    info!(
        "Connecting to {}:{} via TLS",
        client_config.server_addr, client_config.server_port
    );

    let transport = Arc::new(TlsTransportClient::new(
        client_config.server_addr.clone(),
        client_config.server_port,
        client_config.server_name.clone(),
        connector,
    ));

    let forward = Arc::new(ForwardClient::new(
        format!("{}:{}", client_config.server_addr, client_config.server_port),
        transport,
        client_config.pool.to_pool_config(),
        shutdown.clone(),
    ));

    let mut tasks = Vec::new();
    for forward_config in &config.forwards {
        let listener = ForwardListener::new(
            forward_config.clone(),
            forward.clone() as Arc<dyn RuleHandler>,
        )
        .with_context(|| format!("Forward '{}' is invalid", forward_config.name))?;
        tasks.push(tokio::spawn(listener.run(shutdown.clone())));
    }

    info!("Client started with {} forward listeners", tasks.len());
    shutdown.cancelled().await;

    for task in tasks {
        task.await.ok();
    }
    info!("Client stopped");
    Ok(())
}
