use crate::pool::PoolConfig;
use crate::protocol::ForwardMeta;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 本地转发入口配置：监听一个本地地址，把所有连接经隧道送往固定目标
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardConfig {
    /// 入口名称
    pub name: String,
    /// 本地监听地址，例如 127.0.0.1:8080
    pub listen_addr: String,
    /// 目标，例如 tcp://example.com:80
    pub target: String,
}

/// 连接池参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// 空闲连接上限
    #[serde(default = "default_max_conns")]
    pub max_conns: usize,
    /// 空闲超时（秒）
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_max_conns() -> usize {
    200
}

fn default_idle_timeout_secs() -> u64 {
    600
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_conns: default_max_conns(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl PoolSettings {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_conns: self.max_conns,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

/// 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// 隧道服务器地址
    pub server_addr: String,
    /// 隧道服务器端口
    pub server_port: u16,
    /// TLS SNI 覆盖（缺省使用 server_addr）
    #[serde(default)]
    pub server_name: Option<String>,
    /// 客户端证书路径（双向 TLS）
    pub cert_path: PathBuf,
    /// 客户端私钥路径
    pub key_path: PathBuf,
    /// 校验服务器证书用的 CA（缺省使用系统信任库）
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    /// 是否跳过服务器证书验证（仅用于测试）
    #[serde(default)]
    pub skip_verify: bool,
    /// 连接池参数
    #[serde(default)]
    pub pool: PoolSettings,
}

/// 客户端完整配置（包含转发入口列表）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFullConfig {
    pub client: ClientConfig,
    /// 转发入口列表
    #[serde(default)]
    pub forwards: Vec<ForwardConfig>,
}

/// 服务器端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 服务器监听地址
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 服务器监听端口
    pub bind_port: u16,
    /// TLS 证书路径（与 key_path 同时缺省时自动生成自签名证书）
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// TLS 私钥路径
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// 校验客户端证书用的 CA；给出后要求双向 TLS
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    /// 连接真实目标的超时（秒）
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_dial_timeout_secs() -> u64 {
    5
}

impl ServerConfig {
    /// 确保证书路径配置成对出现或同时缺省
    pub fn validate(&self) -> anyhow::Result<()> {
        match (&self.cert_path, &self.key_path) {
            (Some(_), Some(_)) | (None, None) => Ok(()),
            _ => bail!("cert_path and key_path must both be set, or both omitted to auto-generate"),
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

impl ClientFullConfig {
    /// 验证配置的有效性
    pub fn validate(&self) -> anyhow::Result<()> {
        use std::collections::HashSet;

        if self.forwards.is_empty() {
            bail!("No forward entries defined");
        }

        let mut seen_names = HashSet::new();
        let mut seen_listen = HashSet::new();

        for forward in &self.forwards {
            if forward.name.trim().is_empty() {
                bail!("Forward name cannot be empty");
            }
            if !seen_names.insert(&forward.name) {
                bail!(
                    "Duplicate forward name '{}': each entry must have a unique name",
                    forward.name
                );
            }
            if !seen_listen.insert(&forward.listen_addr) {
                bail!(
                    "Duplicate listen_addr {}: each entry must bind a different address",
                    forward.listen_addr
                );
            }
            forward
                .listen_addr
                .parse::<std::net::SocketAddr>()
                .with_context(|| {
                    format!(
                        "Forward '{}': invalid listen_addr {}",
                        forward.name, forward.listen_addr
                    )
                })?;

            let meta: ForwardMeta = forward
                .target
                .parse()
                .with_context(|| format!("Forward '{}': invalid target", forward.name))?;
            if meta.network != "tcp" {
                bail!(
                    "Forward '{}': network '{}' is not supported, only tcp",
                    forward.name,
                    meta.network
                );
            }
        }

        if self.client.pool.max_conns == 0 {
            bail!("pool.max_conns cannot be 0");
        }

        Ok(())
    }
}

/// 应用配置
pub struct AppConfig;

impl AppConfig {
    /// 从文件加载服务器配置
    pub fn load_server_config(path: &str) -> anyhow::Result<ServerConfig> {
        #[derive(Deserialize)]
        struct ServerConfigWrapper {
            server: ServerConfig,
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        let wrapper: ServerConfigWrapper =
            toml::from_str(&content).context("Failed to parse server configuration")?;
        wrapper
            .server
            .validate()
            .context("Server configuration validation failed")?;
        Ok(wrapper.server)
    }

    /// 从文件加载客户端配置
    pub fn load_client_config(path: &str) -> anyhow::Result<ClientFullConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        let config: ClientFullConfig =
            toml::from_str(&content).context("Failed to parse client configuration")?;
        config
            .validate()
            .context("Configuration validation failed")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_client_config() -> ClientFullConfig {
        toml::from_str(
            r#"
            [client]
            server_addr = "proxy.example.com"
            server_port = 8899
            cert_path = "client.crt"
            key_path = "client.key"

            [[forwards]]
            name = "web"
            listen_addr = "127.0.0.1:8080"
            target = "tcp://example.com:80"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_client_config_defaults() {
        let config = sample_client_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.client.pool.max_conns, 200);
        assert_eq!(config.client.pool.idle_timeout_secs, 600);
        assert!(!config.client.skip_verify);
    }

    #[test]
    fn test_client_config_rejects_duplicate_names() {
        let mut config = sample_client_config();
        let mut dup = config.forwards[0].clone();
        dup.listen_addr = "127.0.0.1:8081".to_string();
        config.forwards.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_client_config_rejects_bad_target() {
        let mut config = sample_client_config();
        config.forwards[0].target = "example.com:80".to_string();
        assert!(config.validate().is_err());

        config.forwards[0].target = "udp://example.com:80".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_client_config_requires_forwards() {
        let mut config = sample_client_config();
        config.forwards.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_config_cert_pairing() {
        let config: ServerConfig = toml::from_str(
            r#"
            bind_port = 8899
            cert_path = "server.crt"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());

        let config: ServerConfig = toml::from_str("bind_port = 8899").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_addr, "0.0.0.0");
        assert_eq!(config.dial_timeout(), Duration::from_secs(5));
    }
}
