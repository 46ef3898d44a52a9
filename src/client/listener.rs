use super::RuleHandler;
use crate::config::ForwardConfig;
use crate::protocol::ForwardMeta;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 本地转发入口
///
/// 监听一个本地地址，把每条接受的连接交给处理器送往固定目标。
/// HTTP/SOCKS 前端握手由外部协作者完成后走同一条路径
pub struct ForwardListener {
    config: ForwardConfig,
    meta: ForwardMeta,
    handler: Arc<dyn RuleHandler>,
}

impl ForwardListener {
    pub fn new(config: ForwardConfig, handler: Arc<dyn RuleHandler>) -> Result<Self> {
        let meta: ForwardMeta = config
            .target
            .parse()
            .with_context(|| format!("invalid target: {}", config.target))?;
        Ok(Self {
            config,
            meta,
            handler,
        })
    }

    /// 接受循环：每条本地连接一个任务
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("failed to listen on {}", self.config.listen_addr))?;
        info!(
            name = %self.config.name,
            listen = %self.config.listen_addr,
            target = %self.meta,
            "forward listener started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(name = %self.config.name, "forward listener stopped");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((conn, peer_addr)) => {
                            debug!(name = %self.config.name, %peer_addr, "local connection accepted");
                            let handler = self.handler.clone();
                            let meta = self.meta.clone();
                            tokio::spawn(async move {
                                handler.handle_conn(conn, &meta).await;
                            });
                        }
                        Err(e) => {
                            warn!(name = %self.config.name, error = %e, "accept failed");
                        }
                    }
                }
            }
        }
    }
}
