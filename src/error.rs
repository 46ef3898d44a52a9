/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，替代泛型的 anyhow::Error，
/// 让调用者（中继、连接池）可以针对协议错误与瞬时错误分别处理
use std::io;
use std::time::Duration;
use thiserror::Error;

/// 隧道的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 连接失败
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 协议错误（非法帧头、未知帧类型等）
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 流在一个帧的中间结束
    #[error("Short read: transport ended inside a frame")]
    ShortRead,

    /// 帧负载超过上限
    #[error("Frame payload length {len} exceeds maximum {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// 帧携带了非当前逻辑流的序号
    #[error("Unexpected stream sequence: expected {expected}, got {actual}")]
    UnexpectedStream { expected: u32, actual: u32 },

    /// 会话已损坏，不可再使用
    #[error("Session is broken")]
    SessionBroken,

    /// 当前逻辑流已关闭
    #[error("Logical stream is closed")]
    StreamClosed,

    /// 对端发送了 Disconnect 帧
    #[error("Disconnected by peer: {0}")]
    Disconnected(String),

    /// 底层连接被对端直接关闭
    #[error("Connection reset by peer")]
    ConnectionReset,

    /// 目标描述不合法
    #[error("Invalid forward target: {0}")]
    InvalidMeta(String),

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: Duration },

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建连接失败错误
    pub fn connection_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建协议错误
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// 创建目标描述错误
    pub fn invalid_meta(msg: impl Into<String>) -> Self {
        Self::InvalidMeta(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 检查是否为协议违例（此类错误对所在会话是致命的）
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_)
                | Self::ShortRead
                | Self::PayloadTooLarge { .. }
                | Self::UnexpectedStream { .. }
        )
    }

    /// 检查是否为对端 Disconnect
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}
