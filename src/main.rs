//! rpc-runtime demo server.
//!
//! Serves an echo service over gRPC, gRPC-Web and a small JSON gateway, all
//! on one listener.
//!
//! ```text
//! rpc-runtime --config runtime.toml --address 127.0.0.1:8080
//! ```

use std::path::PathBuf;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::Json;
use bytes::Bytes;
use clap::Parser;
use http::{HeaderMap, StatusCode};

use rpc_runtime::config::{load_config, RuntimeConfig};
use rpc_runtime::observability::{logging, metrics};
use rpc_runtime::{Invoker, Runtime, ServiceDesc};

#[derive(Parser, Debug)]
#[command(name = "rpc-runtime", version, about = "Unified RPC + HTTP service runtime")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind target, `host:port` or `unix://path`. Overrides the config file.
    #[arg(short, long)]
    address: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => RuntimeConfig::default(),
    };

    logging::init_logging(&config.observability.log_level)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rpc-runtime starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let mut builder = Runtime::builder(config).gateway(|router, invoker| {
        Ok(router.route("/echo/{word}", get(echo_gateway).with_state(invoker)))
    });
    if let Some(address) = args.address {
        builder = builder.address(address);
    }

    let runtime = builder.build()?;
    runtime.register_service(echo_service())?;
    runtime.run().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

fn echo_service() -> ServiceDesc {
    ServiceDesc::new("echo.Echo")
        .unary("Say", |ctx, request| async move {
            tracing::debug!(origin = ctx.origin().as_str(), bytes = request.len(), "Echo");
            Ok(request)
        })
        .stream("Chat", true, true, |_ctx, input| async move { Ok(input) })
}

async fn echo_gateway(
    State(invoker): State<Invoker>,
    Path(word): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let reply = invoker
        .unary("/echo.Echo/Say", HeaderMap::new(), Bytes::from(word))
        .await
        .map_err(|status| (StatusCode::BAD_GATEWAY, status.to_string()))?;
    Ok(Json(serde_json::json!({ "echo": String::from_utf8_lossy(&reply) })))
}
