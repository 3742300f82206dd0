use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "proxy-agent")]
#[command(author, version, about = "Outbound connections through HTTP CONNECT / SOCKS5 proxies", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志详细程度（-v info，-vv debug，-vvv trace）
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long, default_value = "agent.toml")]
        config: String,
    },
    /// 通过代理打开到目标 URL 的连接
    Probe {
        /// 配置文件路径
        #[arg(short, long, default_value = "agent.toml")]
        config: String,

        /// 目标 URL，如 https://example.com/
        url: String,

        /// 连接建立后发送 GET 请求并打印状态行
        #[arg(long)]
        request: bool,
    },
}

impl Cli {
    /// 根据 -v 的次数得到日志过滤级别
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
