use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "pack-tunnel",
    version,
    about = "Forward proxy tunnel over mutual TLS"
)]
pub struct Cli {
    /// 日志详细程度（-v debug，-vv trace）
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 运行隧道客户端
    Client {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,
    },

    /// 运行隧道服务器
    Server {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,
    },

    /// 校验配置文件
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,
        /// 配置类型
        #[arg(short, long, value_parser = ["client", "server"])]
        mode: String,
    },

    /// 生成自签名证书
    Cert {
        /// 证书输出路径
        #[arg(long, default_value = "cert.pem")]
        cert_out: PathBuf,
        /// 私钥输出路径
        #[arg(long, default_value = "key.pem")]
        key_out: PathBuf,
        /// 证书 CN
        #[arg(long, default_value = "localhost")]
        common_name: String,
        /// 附加 SAN，可重复
        #[arg(long)]
        alt_names: Vec<String>,
    },
}

/// 展开配置路径中的 ~
pub fn expand_path(path: &str) -> Result<String> {
    Ok(shellexpand::tilde(path).into_owned())
}
