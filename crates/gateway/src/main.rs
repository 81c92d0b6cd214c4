use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use p3394_domain::config::{Config, ConfigSeverity};
use p3394_domain::error::Error;
use p3394_gateway::bootstrap;
use p3394_gateway::channels::{
    http_api::HttpApiAdapter, llm_compat::LlmCompatAdapter, mcp_server::McpAdapter,
    terminal::TerminalAdapter, ChannelAdapter, ChannelCapabilities,
};
use p3394_providers::mock::MockLlm;
use p3394_providers::LlmClient;

// Exit codes: 0 clean shutdown, 1 startup error, 2 invalid configuration,
// 3 port or socket in use.
const EXIT_STARTUP: i32 = 1;
const EXIT_CONFIG: i32 = 2;
const EXIT_BIND: i32 = 3;

/// P3394 exemplar agent — a protocol-agnostic message gateway.
#[derive(Debug, Parser)]
#[command(name = "p3394-agent", version, about)]
struct Cli {
    /// Start as a long-running service.
    #[arg(long)]
    daemon: bool,

    /// Override the terminal channel's Unix socket path.
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Enable the LLM-compatible /v1/messages endpoint.
    #[arg(long)]
    anthropic_api: bool,

    /// HTTP-native channel port override.
    #[arg(long, value_name = "N")]
    api_port: Option<u16>,

    /// Agent-to-agent (P3394 server) port override.
    #[arg(long, value_name = "N")]
    p3394_port: Option<u16>,

    /// Comma-separated API keys accepted by the LLM-compatible endpoint.
    #[arg(long, value_name = "k1,k2")]
    api_keys: Option<String>,

    /// Expose every capability over stdio-RPC (MCP-compatible).
    #[arg(long)]
    mcp_server: bool,

    /// Stdio-RPC transport flavor.
    #[arg(long, value_parser = ["stdio", "sse"], default_value = "stdio")]
    mcp_transport: String,

    /// Verbose logging.
    #[arg(long)]
    debug: bool,

    /// Config file path (also via P3394_CONFIG).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("startup error: {e}");
            std::process::exit(EXIT_STARTUP);
        }
    };

    if let Err(e) = runtime.block_on(run(cli, Arc::new(config))) {
        let code = if e.to_string().contains("bind") {
            EXIT_BIND
        } else {
            EXIT_STARTUP
        };
        eprintln!("startup error: {e}");
        std::process::exit(code);
    }
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("P3394_LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .init();
}

/// Load config.toml (or `P3394_CONFIG`), apply env overrides, then CLI
/// overrides, then validate.
fn load_config(cli: &Cli) -> Result<Config, Error> {
    let path = cli
        .config
        .clone()
        .or_else(|| std::env::var("P3394_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let mut config: Config = if path.exists() {
        let raw = std::fs::read_to_string(&path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))?
    } else {
        Config::default()
    };
    config.apply_env();

    // CLI flags win over file and env.
    if let Some(ref socket) = cli.socket {
        config.terminal.socket_path = socket.clone();
    }
    if let Some(port) = cli.api_port {
        config.server.api_port = port;
    }
    if let Some(port) = cli.p3394_port {
        config.server.p3394_port = port;
    }
    if cli.anthropic_api {
        config.llm_compat.enabled = true;
    }
    if let Some(ref keys) = cli.api_keys {
        config.llm_compat.api_keys = keys
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_owned)
            .collect();
    }
    if cli.mcp_server {
        config.mcp.enabled = true;
        config.mcp.transport = cli.mcp_transport.clone();
    }

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        return Err(Error::Config(format!(
            "{} validation error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        )));
    }
    Ok(config)
}

fn build_llm(config: &Config) -> Arc<dyn LlmClient> {
    match p3394_providers::create_client(&config.llm) {
        Ok(client) => Arc::from(client),
        Err(e) => {
            tracing::warn!(
                error = %e,
                "LLM provider unavailable — falling back to the mock client"
            );
            Arc::new(MockLlm::default())
        }
    }
}

async fn run(cli: Cli, config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!(
        agent_id = %config.agent.agent_id,
        "P3394 exemplar agent starting"
    );

    let llm = build_llm(&config);

    // ── Assemble adapters first so their capabilities are discoverable ──
    let mut channel_caps: Vec<ChannelCapabilities> = vec![
        TerminalAdapter::channel_capabilities(),
        p3394_gateway::channels::http_api::native_capabilities(),
        p3394_gateway::channels::http_api::agent_capabilities(),
    ];
    if config.llm_compat.enabled {
        channel_caps.push(p3394_gateway::channels::llm_compat::channel_capabilities());
    }
    if config.mcp.enabled {
        channel_caps.push(p3394_gateway::channels::mcp_server::channel_capabilities());
    }

    let gateway = bootstrap::build_gateway(config.clone(), llm, &channel_caps)?;

    // ── Channels ─────────────────────────────────────────────────────
    let terminal = TerminalAdapter::new(gateway.clone(), config.terminal.socket_path.clone());
    terminal.start().await?;

    let native = HttpApiAdapter::native(
        gateway.clone(),
        config.server.host.clone(),
        config.server.api_port,
    );
    native.start().await?;

    let agent_rpc = HttpApiAdapter::agent(
        gateway.clone(),
        config.server.host.clone(),
        config.server.p3394_port,
    );
    agent_rpc.start().await?;

    if config.llm_compat.enabled {
        let compat = LlmCompatAdapter::new(
            gateway.clone(),
            config.server.host.clone(),
            config.llm_compat.port,
            gateway.state().api_key_hashes.clone(),
            config.llm_compat.chars_per_token,
        );
        compat.start().await?;
    }

    // ── Periodic maintenance ─────────────────────────────────────────
    {
        let state = gateway.state().clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                interval.tick().await;
                let expired = state.sessions.cleanup_expired();
                if expired > 0 {
                    tracing::info!(expired, "expired sessions cleaned up");
                }
                state.session_locks.prune_idle();
                state.router.probe_all().await;
            }
        });
    }

    // ── Foreground surface ───────────────────────────────────────────
    if config.mcp.enabled && config.mcp.transport == "stdio" && !cli.daemon {
        // Stdio-RPC owns the process's stdin; serve until EOF.
        let mcp = McpAdapter::new(gateway.clone());
        mcp.server().run().await?;
    } else {
        if config.mcp.enabled {
            if config.mcp.transport == "stdio" {
                let mcp = McpAdapter::new(gateway.clone());
                mcp.start().await?;
            } else {
                tracing::warn!(
                    transport = %config.mcp.transport,
                    "stdio is the only supported mcp transport for now"
                );
            }
        }
        tokio::signal::ctrl_c().await?;
        tracing::info!("shutdown signal received");
    }

    terminal.stop().await;
    tracing::info!("clean shutdown");
    Ok(())
}
