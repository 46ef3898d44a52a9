/// 隧道帧协议
///
/// 定义承载逻辑流的 Pack 帧：12 字节定长帧头（类型、流序号、负载长度，
/// 均为大端 u32）加最多 PACK_MAX_DATA_LEN 字节负载。编解码通过
/// tokio-util 的 codec 接口实现，纯编解码，不含任何 I/O 策略
use crate::error::{Result, TunnelError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// 帧头长度（类型 + 流序号 + 负载长度）
pub const PACK_HEADER_LEN: usize = 12;
/// 单帧总长上限
pub const PACK_MAX_LEN: usize = 32 * 1024;
/// 单帧负载上限，超过时由会话层拆分为多个 Data 帧
pub const PACK_MAX_DATA_LEN: usize = PACK_MAX_LEN - PACK_HEADER_LEN;

/// 帧类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PackType {
    /// 绑定逻辑流的目标地址，负载为序列化后的 ForwardMeta
    Dial = 1,
    /// 数据帧
    Data = 2,
    /// 半关闭：本方向不再有数据
    CloseWrite = 3,
    /// 当前逻辑流结束
    Close = 4,
    /// 永久放弃整条传输连接，仅客户端发往服务器，负载为原因文本
    Disconnect = 5,
}

impl TryFrom<u32> for PackType {
    type Error = TunnelError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(PackType::Dial),
            2 => Ok(PackType::Data),
            3 => Ok(PackType::CloseWrite),
            4 => Ok(PackType::Close),
            5 => Ok(PackType::Disconnect),
            other => Err(TunnelError::protocol(format!(
                "unknown pack type: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for PackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackType::Dial => write!(f, "dial"),
            PackType::Data => write!(f, "data"),
            PackType::CloseWrite => write!(f, "close-write"),
            PackType::Close => write!(f, "close"),
            PackType::Disconnect => write!(f, "disconnect"),
        }
    }
}

/// 线路上的最小单元
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pack {
    pub pack_type: PackType,
    pub stream: u32,
    pub payload: Bytes,
}

impl Pack {
    /// 创建携带负载的帧，负载超限时返回错误（拆分由调用方负责）
    pub fn new(pack_type: PackType, stream: u32, payload: Bytes) -> Result<Self> {
        if payload.len() > PACK_MAX_DATA_LEN {
            return Err(TunnelError::PayloadTooLarge {
                len: payload.len(),
                max: PACK_MAX_DATA_LEN,
            });
        }
        Ok(Self {
            pack_type,
            stream,
            payload,
        })
    }

    /// 创建无负载的控制帧
    pub fn control(pack_type: PackType, stream: u32) -> Self {
        Self {
            pack_type,
            stream,
            payload: Bytes::new(),
        }
    }
}

impl std::fmt::Display for Pack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "type: {}, stream: {}, data length: {}",
            self.pack_type,
            self.stream,
            self.payload.len()
        )
    }
}

/// Pack 帧编解码器
///
/// 解码端对帧头不足的输入返回 None 等待更多数据；流在帧中间结束
/// 视为 ShortRead 而不是正常 EOF
#[derive(Debug, Default)]
pub struct PackCodec;

impl Decoder for PackCodec {
    type Item = Pack;
    type Error = TunnelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Pack>> {
        if src.len() < PACK_HEADER_LEN {
            src.reserve(PACK_HEADER_LEN - src.len());
            return Ok(None);
        }

        let mut header = &src[..PACK_HEADER_LEN];
        let raw_type = header.get_u32();
        let stream = header.get_u32();
        let len = header.get_u32() as usize;

        if len > PACK_MAX_DATA_LEN {
            return Err(TunnelError::PayloadTooLarge {
                len,
                max: PACK_MAX_DATA_LEN,
            });
        }
        if src.len() < PACK_HEADER_LEN + len {
            src.reserve(PACK_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        let pack_type = PackType::try_from(raw_type)?;
        src.advance(PACK_HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Pack {
            pack_type,
            stream,
            payload,
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Pack>> {
        match self.decode(src)? {
            Some(pack) => Ok(Some(pack)),
            None if src.is_empty() => Ok(None),
            None => Err(TunnelError::ShortRead),
        }
    }
}

impl Encoder<Pack> for PackCodec {
    type Error = TunnelError;

    fn encode(&mut self, pack: Pack, dst: &mut BytesMut) -> Result<()> {
        if pack.payload.len() > PACK_MAX_DATA_LEN {
            return Err(TunnelError::PayloadTooLarge {
                len: pack.payload.len(),
                max: PACK_MAX_DATA_LEN,
            });
        }
        dst.reserve(PACK_HEADER_LEN + pack.payload.len());
        dst.put_u32(pack.pack_type as u32);
        dst.put_u32(pack.stream);
        dst.put_u32(pack.payload.len() as u32);
        dst.extend_from_slice(&pack.payload);
        Ok(())
    }
}

/// 逻辑流的目标描述，作为 Dial 帧负载以 `network://address` 编码
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardMeta {
    /// 目前端到端只支持 tcp
    pub network: String,
    /// host:port 形式的目标地址
    pub address: String,
}

impl ForwardMeta {
    pub fn new(network: impl Into<String>, address: impl Into<String>) -> Result<Self> {
        let network = network.into();
        let address = address.into();
        if network.is_empty() {
            return Err(TunnelError::invalid_meta("network cannot be empty"));
        }
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| TunnelError::invalid_meta(format!("address must be host:port: {address}")))?;
        if host.is_empty() {
            return Err(TunnelError::invalid_meta(format!("address has no host: {address}")));
        }
        if port.parse::<u16>().is_err() {
            return Err(TunnelError::invalid_meta(format!("address has invalid port: {address}")));
        }
        Ok(Self { network, address })
    }

    pub fn tcp(address: impl Into<String>) -> Result<Self> {
        Self::new("tcp", address)
    }

    pub fn marshal(&self) -> Bytes {
        Bytes::from(format!("{}://{}", self.network, self.address))
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| TunnelError::invalid_meta("target is not valid UTF-8"))?;
        let (network, address) = text
            .split_once("://")
            .ok_or_else(|| TunnelError::invalid_meta(format!("missing network separator: {text}")))?;
        Self::new(network, address)
    }
}

impl std::str::FromStr for ForwardMeta {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::unmarshal(s.as_bytes())
    }
}

impl std::fmt::Display for ForwardMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.network, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(pack: Pack) -> Pack {
        let mut codec = PackCodec;
        let mut buf = BytesMut::new();
        codec.encode(pack, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let pack = Pack::new(PackType::Data, 7, Bytes::from_static(b"hello world")).unwrap();
        let decoded = round_trip(pack.clone());
        assert_eq!(decoded, pack);
    }

    #[test]
    fn test_control_frame_round_trip() {
        let pack = Pack::control(PackType::Close, 42);
        let decoded = round_trip(pack.clone());
        assert_eq!(decoded, pack);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_max_payload_round_trip() {
        let payload = Bytes::from(vec![0xabu8; PACK_MAX_DATA_LEN]);
        let pack = Pack::new(PackType::Data, 1, payload).unwrap();
        let decoded = round_trip(pack.clone());
        assert_eq!(decoded, pack);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let payload = Bytes::from(vec![0u8; PACK_MAX_DATA_LEN + 1]);
        assert!(matches!(
            Pack::new(PackType::Data, 0, payload),
            Err(TunnelError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_oversized_length_is_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(PackType::Data as u32);
        buf.put_u32(0);
        buf.put_u32((PACK_MAX_DATA_LEN + 1) as u32);
        let mut codec = PackCodec;
        assert!(matches!(
            codec.decode(&mut buf),
            Err(TunnelError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_unknown_type() {
        let mut buf = BytesMut::new();
        buf.put_u32(99);
        buf.put_u32(0);
        buf.put_u32(0);
        let mut codec = PackCodec;
        assert!(matches!(
            codec.decode(&mut buf),
            Err(TunnelError::Protocol(_))
        ));
    }

    #[test]
    fn test_partial_header_waits_for_more() {
        let mut codec = PackCodec;
        let mut buf = BytesMut::from(&[0u8, 0, 0, 2, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_partial_frame_at_eof_is_short_read() {
        let mut codec = PackCodec;

        // 半个帧头
        let mut buf = BytesMut::from(&[0u8, 0, 0, 2, 0, 0][..]);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(TunnelError::ShortRead)
        ));

        // 完整帧头但负载不足
        let mut buf = BytesMut::new();
        buf.put_u32(PackType::Data as u32);
        buf.put_u32(0);
        buf.put_u32(10);
        buf.extend_from_slice(b"abc");
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(TunnelError::ShortRead)
        ));
    }

    #[test]
    fn test_decode_eof_empty_is_clean() {
        let mut codec = PackCodec;
        let mut buf = BytesMut::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_multiple_frames_in_one_buffer() {
        let mut codec = PackCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Pack::new(PackType::Dial, 0, Bytes::from_static(b"tcp://a:1")).unwrap(), &mut buf)
            .unwrap();
        codec
            .encode(Pack::new(PackType::Data, 0, Bytes::from_static(b"xyz")).unwrap(), &mut buf)
            .unwrap();
        codec.encode(Pack::control(PackType::Close, 0), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().pack_type, PackType::Dial);
        let data = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(data.payload.as_ref(), b"xyz");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().pack_type, PackType::Close);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_meta_marshal_unmarshal() {
        let meta = ForwardMeta::tcp("example.com:443").unwrap();
        let bytes = meta.marshal();
        assert_eq!(bytes.as_ref(), b"tcp://example.com:443");
        let parsed = ForwardMeta::unmarshal(&bytes).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn test_meta_ipv6_address() {
        let meta = ForwardMeta::tcp("[::1]:8080").unwrap();
        assert_eq!(meta.to_string(), "tcp://[::1]:8080");
    }

    #[test]
    fn test_meta_invalid() {
        assert!(ForwardMeta::tcp("no-port").is_err());
        assert!(ForwardMeta::tcp(":443").is_err());
        assert!(ForwardMeta::tcp("host:notaport").is_err());
        assert!(ForwardMeta::new("", "a:1").is_err());
        assert!(ForwardMeta::unmarshal(b"example.com:80").is_err());
        assert!("tcp://example.com:80".parse::<ForwardMeta>().is_ok());
    }
}
