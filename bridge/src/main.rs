use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use deskchat_backend::mock::LoopbackDriver;
use deskchat_backend::Driver;
use deskchat_core::{BridgeConfig, BridgeRuntime, DriverFactory};
use deskchat_observability::{emit_event, init_bridge_logging, ObservabilityEvent};
use deskchat_server::{serve, AppState};
use deskchat_types::{Op, Variant};

#[derive(Parser, Debug)]
#[command(name = "deskchat-bridge")]
#[command(about = "HTTP bridge for desktop chat client automation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge server.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Backend variant: standard (a) or plus (b).
        #[arg(long)]
        variant: Option<String>,
        #[arg(long)]
        api_token: Option<String>,
    },
    /// End-to-end check against the loopback backend: watch a conversation,
    /// send one message, and drain the echoed reply.
    Smoke {
        #[arg(long, default_value = "Echo Test")]
        target: String,
        #[arg(long, default_value = "ping")]
        text: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            host,
            port,
            variant,
            api_token,
        } => {
            let config = apply_overrides(BridgeConfig::from_env()?, host, port, variant, api_token)?;
            let (_log_guard, log_info) =
                init_bridge_logging(&config.logs_dir, config.log_retention_days)?;
            emit_event(
                tracing::Level::INFO,
                ObservabilityEvent {
                    event: "logging_initialized",
                    component: "bridge.main",
                    target: None,
                    op: None,
                    variant: Some(config.variant.as_str()),
                    status: Some("ok"),
                    error_code: None,
                    detail: Some(&log_info.logs_dir),
                },
            );
            info!("bridge logging initialized: {log_info:?}");

            let addr: SocketAddr = format!("{}:{}", config.host, config.port)
                .parse()
                .context("invalid host or port")?;
            let runtime = BridgeRuntime::new(config, loopback_factory());
            info!("starting deskchat-bridge on http://{addr}");
            serve(addr, AppState::new(runtime)).await?;
        }
        Command::Smoke { target, text } => {
            let config = BridgeConfig {
                warmup_target: String::new(),
                warmup_delay: Duration::ZERO,
                ..BridgeConfig::from_env()?
            };
            run_smoke(config, &target, &text).await?;
        }
    }

    Ok(())
}

fn apply_overrides(
    mut config: BridgeConfig,
    host: Option<String>,
    port: Option<u16>,
    variant: Option<String>,
    api_token: Option<String>,
) -> anyhow::Result<BridgeConfig> {
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(variant) = variant {
        config.variant = variant.parse::<Variant>().map_err(anyhow::Error::msg)?;
    }
    if let Some(token) = api_token {
        if !token.trim().is_empty() {
            config.api_token = Some(token);
        }
    }
    Ok(config)
}

fn loopback_factory() -> DriverFactory {
    Arc::new(|variant| Arc::new(LoopbackDriver::new(variant)) as Arc<dyn Driver>)
}

async fn run_smoke(config: BridgeConfig, target: &str, text: &str) -> anyhow::Result<()> {
    let runtime = BridgeRuntime::new(config, loopback_factory());
    runtime.initialize().await?;
    runtime
        .execute(Op::AddWatch, serde_json::json!({ "target": target }))
        .await?;
    runtime
        .execute(
            Op::SendText,
            serde_json::json!({ "target": target, "text": text }),
        )
        .await?;

    // The echo arrives through the dispatch channel; give it a moment.
    let mut drained = serde_json::Value::Null;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let data = runtime
            .execute(Op::Drain, serde_json::json!({ "target": target }))
            .await?;
        if data.as_object().is_some_and(|m| !m.is_empty()) {
            drained = data;
            break;
        }
    }
    runtime.shutdown().await;

    if drained.is_null() {
        anyhow::bail!("no echo received from loopback backend");
    }
    println!("{}", serde_json::to_string_pretty(&drained)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_take_precedence() {
        let config = apply_overrides(
            BridgeConfig::default(),
            Some("0.0.0.0".to_string()),
            Some(9100),
            Some("b".to_string()),
            Some("tk_live".to_string()),
        )
        .expect("config");

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9100);
        assert_eq!(config.variant, Variant::Plus);
        assert_eq!(config.api_token.as_deref(), Some("tk_live"));
    }

    #[test]
    fn unknown_variant_is_rejected() {
        let err = apply_overrides(
            BridgeConfig::default(),
            None,
            None,
            Some("deluxe".to_string()),
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown backend variant"));
    }

    #[test]
    fn blank_token_override_is_ignored() {
        let config =
            apply_overrides(BridgeConfig::default(), None, None, None, Some("  ".to_string()))
                .expect("config");
        assert!(config.api_token.is_none());
    }

    #[tokio::test]
    async fn smoke_round_trip_echoes_through_the_cache() {
        let config = BridgeConfig {
            warmup_target: String::new(),
            warmup_delay: Duration::ZERO,
            artifact_dir: std::env::temp_dir().join("deskchat-test"),
            ..BridgeConfig::default()
        };
        run_smoke(config, "Echo Test", "ping").await.expect("smoke");
    }
}
