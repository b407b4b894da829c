use std::io::ErrorKind;
use std::net::SocketAddr;

use parley_gateway::{GatewayConfig, GatewayState};
use tokio::net::TcpListener;

fn chat_url_for_bound_addr(bound_addr: SocketAddr) -> String {
    let host = if bound_addr.ip().is_unspecified() {
        "127.0.0.1".to_string()
    } else {
        bound_addr.ip().to_string()
    };
    format!("ws://{}:{}/chat", host, bound_addr.port())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    parley_common::init_tracing_with_default("parley_gateway=info,tower_http=info");

    let config = GatewayConfig::from_env()?;
    let addr = config.bind_addr;
    config.check_public_bind_allowed(addr)?;

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) if err.kind() == ErrorKind::AddrInUse => {
            let fallback_addr = SocketAddr::new(addr.ip(), 0);
            tracing::warn!(
                "gateway bind {} is already in use, falling back to {}",
                addr,
                fallback_addr
            );
            TcpListener::bind(fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };
    let bound_addr = listener.local_addr()?;
    tracing::info!("gateway listening on {}", bound_addr);
    tracing::info!("chat url {}", chat_url_for_bound_addr(bound_addr));

    parley_gateway::serve(listener, GatewayState::new(config)).await
}
