use clap::Parser;
use relay_server::{Hub, HubOptions, ServerConfig};
use serde_json::json;

/// Persistent-connection messaging server.
#[derive(Parser, Debug)]
#[command(name = "relay", version)]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 3001)]
    port: u16,

    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Heartbeat timeout in seconds.
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    /// Probe grace margin in seconds.
    #[arg(long, default_value_t = 5)]
    grace_secs: u64,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let options = HubOptions {
        timeout_ms: args.timeout_secs * 1_000,
        grace_ms: args.grace_secs * 1_000,
    };
    let mut hub = Hub::new(options);

    // Built-in echo handler so a bare server is probeable end to end.
    hub.on(
        "echo",
        Box::new(|reg, conn, value, reply| match reply {
            Some(reply) => reply.send(reg, conn, value),
            None => reg.emit(conn, "echo", value),
        }),
    );
    hub.on(
        "whoami",
        Box::new(|reg, conn, _value, _reply| {
            let meta = reg.connection(conn).map(|c| c.meta.clone()).unwrap_or_default();
            reg.emit(conn, "whoami", json!({ "id": conn, "ip": meta.ip }));
        }),
    );

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        timeout_ms: options.timeout_ms,
        grace_ms: options.grace_ms,
        ..Default::default()
    };

    let handle = match relay_server::start(config, hub).await {
        Ok(handle) => handle,
        Err(err) => {
            tracing::error!(%err, "failed to start server");
            std::process::exit(1);
        }
    };

    tracing::info!(port = handle.port, "relay ready");

    // Wait for shutdown signal
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to listen for ctrl+c");
    }

    tracing::info!("shutting down");
}
