/// pack-tunnel 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;
pub mod tls;
pub mod transport;

// 重新导出常用类型
pub use client::{DirectHandler, ForwardClient, ForwardListener, RejectHandler, RuleHandler};
pub use config::{AppConfig, ClientConfig, ClientFullConfig, ForwardConfig, ServerConfig};
pub use error::{Result, TunnelError};
pub use pool::{ConnPool, PoolConfig, PoolCounters, SessionDialer};
pub use protocol::{ForwardMeta, Pack, PackCodec, PackType, PACK_MAX_DATA_LEN};
pub use relay::{relay, IoReader, IoWriter, RelayRead, RelayStats, RelayWrite};
pub use session::PackSession;
