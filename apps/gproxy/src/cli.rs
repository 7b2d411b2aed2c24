use clap::Parser;

/// Local HTTP gateway translating Protocol-A (Anthropic Messages API)
/// traffic to OpenAI, Gemini, and Protocol-A-compatible upstreams (§1).
#[derive(Debug, Parser)]
#[command(name = "gproxy", version, about)]
pub struct Cli {
    /// Bind port. Falls back to `CLAUDE_PROXY_PORT` in the dotenv config,
    /// then 17870 (§4.9).
    #[arg(long, env = "CLAUDE_PROXY_PORT")]
    pub port: Option<u16>,

    /// Config/data directory (§6). Falls back to `CLAUDE_PROXY_CONFIG_DIR`,
    /// then `~/.claude-proxy`.
    #[arg(long, env = "CLAUDE_PROXY_CONFIG_DIR")]
    pub config_dir: Option<String>,

    /// `tracing`/`RUST_LOG`-style filter directive, e.g. `info` or
    /// `gproxy_core=debug,gproxy_provider_impl=trace`.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}
