use anyhow::Context;
use openai_limiter::{LimitedClient, config, gateway, ledger::QuotaLedger};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load();

    init_tracing(&cfg);

    let ledger = Arc::new(QuotaLedger::new());
    let client =
        LimitedClient::from_config(&cfg, ledger.clone()).context("初始化上游客户端失败")?;

    if cfg.api_keys.is_empty() {
        tracing::info!("未配置 API_KEYS，将透传客户端请求中的 Bearer key");
    } else {
        tracing::info!("已加载 {} 个 API key", cfg.api_keys.len());
    }

    let state = Arc::new(gateway::GatewayState {
        client,
        log_level: cfg.log_level(),
    });
    let app = gateway::router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!(
        upstream = %cfg.upstream_base_url,
        "Server listening on http://{addr}"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    Ok(())
}

fn init_tracing(cfg: &config::Config) {
    // 依赖库默认只输出 warn，本项目日志至少为 info。
    let debug = cfg.debug.trim().to_lowercase();
    let filter = if debug == "off" {
        let env = std::env::var("RUST_LOG").unwrap_or_default();
        let env = env.trim();
        if env.is_empty() {
            EnvFilter::new("warn,openai_limiter=info")
        } else if env.contains("openai_limiter") {
            EnvFilter::new(env)
        } else {
            EnvFilter::new(format!("{env},openai_limiter=info"))
        }
    } else {
        EnvFilter::new("warn,openai_limiter=debug")
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
