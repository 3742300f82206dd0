use anyhow::{Context, Result};
use clap::Parser;
use proxy_agent::cli::{Cli, Commands};
use proxy_agent::{AgentConfig, ProxyAgent, RequestOptions, TunnelStream};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use url::Url;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG 优先，其次是 -v 的次数
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!("Proxy Agent v{}", env!("CARGO_PKG_VERSION"));

    match &cli.command {
        Commands::Check { config } => check_config(config),
        Commands::Probe {
            config,
            url,
            request,
        } => probe(config, url, *request).await,
    }
}

/// 检查配置文件
fn check_config(path: &str) -> Result<()> {
    let config = AgentConfig::from_file(path)?;
    let proxy = &config.proxy;

    println!("✓ Configuration is valid: {}", path);
    println!("  Proxy:      {}://{}", proxy.proxy_protocol, proxy.addr());
    println!("  Mode:       {:?}", proxy.mode);
    println!("  Timeout:    {} ms", proxy.proxy_connect_timeout);
    println!("  Keep-alive: {}", proxy.keep_alive);
    if proxy.internal_pool {
        println!(
            "  Pool:       max_size={} timeout={} ms",
            config.pool.max_size,
            i64::from(config.pool.timeout)
        );
    } else {
        println!("  Pool:       disabled");
    }
    Ok(())
}

/// 通过代理打开到 URL 的连接
async fn probe(config_path: &str, url: &str, request: bool) -> Result<()> {
    let config = AgentConfig::from_file(config_path)?;
    let agent = ProxyAgent::from_config(&config)?;

    let url = Url::parse(url).with_context(|| format!("Invalid URL: {}", url))?;
    let options = RequestOptions::from_url(&url)?;
    let target = options.to_target()?;

    let stream = agent
        .create_connection(&options)
        .await
        .with_context(|| {
            format!(
                "Failed to reach {} via {}",
                target.authority(),
                agent.endpoint().addr()
            )
        })?;
    println!(
        "✓ Connected to {} via {} ({:?})",
        target.authority(),
        agent.endpoint().addr(),
        stream.kind()
    );

    if request {
        let path = target.path.as_deref().unwrap_or("/");
        let status = send_get(stream, &target.hostname, path).await?;
        println!("  {}", status);
    }
    Ok(())
}

/// 发送 GET 请求并返回响应状态行
async fn send_get(mut stream: TunnelStream, host: &str, path: &str) -> Result<String> {
    if stream.is_writable() {
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, host
        );
        stream
            .write_all(request.as_bytes())
            .await
            .context("Failed to send request")?;
        stream.flush().await?;
    }

    let mut reader = BufReader::new(stream);
    let mut status = String::new();
    reader
        .read_line(&mut status)
        .await
        .context("Failed to read response")?;
    Ok(status.trim_end().to_string())
}
