use anyhow::{Context, Result};
use clap::Parser;
use pack_tunnel::cli::{expand_path, Cli, Commands};
use pack_tunnel::config::{AppConfig, ServerConfig};
use pack_tunnel::{client, server, tls};
use std::path::PathBuf;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(false)
        .init();

    info!("pack-tunnel v{}", env!("CARGO_PKG_VERSION"));

    match &cli.command {
        Commands::Client { config } => run_client(config).await,
        Commands::Server { config } => run_server(config).await,
        Commands::Check { config, mode } => check_config(config, mode),
        Commands::Cert {
            cert_out,
            key_out,
            common_name,
            alt_names,
        } => {
            tls::generate_self_signed_cert(common_name, alt_names, cert_out, key_out)?;
            info!("Certificate written to {:?}, key to {:?}", cert_out, key_out);
            Ok(())
        }
    }
}

/// ctrl-c 触发取消令牌，转发中的会话断开而不是回池
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            trigger.cancel();
        }
    });
    token
}

async fn run_client(config: &str) -> Result<()> {
    let config_path = expand_path(config)?;
    info!("Loading client configuration from: {}", config_path);
    let client_config = AppConfig::load_client_config(&config_path)?;

    let tls_config = tls::load_client_config(
        &client_config.client.cert_path,
        &client_config.client.key_path,
        client_config.client.ca_cert_path.as_deref(),
        client_config.client.skip_verify,
    )?;
    let connector = TlsConnector::from(tls_config);

    client::run_client(client_config, connector, shutdown_token()).await
}

async fn run_server(config: &str) -> Result<()> {
    let config_path = expand_path(config)?;
    info!("Loading server configuration from: {}", config_path);
    let server_config = AppConfig::load_server_config(&config_path)?;

    let (cert_path, key_path) = ensure_server_certs(&server_config)?;
    let tls_config = tls::load_server_config(
        &cert_path,
        &key_path,
        server_config.ca_cert_path.as_deref(),
    )?;
    let acceptor = TlsAcceptor::from(tls_config);

    server::run_server(server_config, acceptor, shutdown_token()).await
}

/// 证书未配置时生成一次性自签名证书
fn ensure_server_certs(config: &ServerConfig) -> Result<(PathBuf, PathBuf)> {
    match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => Ok((cert.clone(), key.clone())),
        _ => {
            let dir = std::env::temp_dir();
            let cert = dir.join(format!("pack-tunnel-{}.crt", std::process::id()));
            let key = dir.join(format!("pack-tunnel-{}.key", std::process::id()));
            tls::generate_self_signed_cert(
                "localhost",
                &["localhost".to_string(), config.bind_addr.clone()],
                &cert,
                &key,
            )?;
            info!("Generated self-signed certificate at {:?}", cert);
            Ok((cert, key))
        }
    }
}

fn check_config(config: &str, mode: &str) -> Result<()> {
    let config_path = expand_path(config)?;
    match mode {
        "client" => {
            AppConfig::load_client_config(&config_path).context("Client configuration invalid")?;
        }
        "server" => {
            AppConfig::load_server_config(&config_path).context("Server configuration invalid")?;
        }
        other => anyhow::bail!("Unknown mode: {}", other),
    }
    info!("Configuration OK: {}", config_path);
    Ok(())
}
