use std::sync::Arc;

use hostgate::modules;
use hostgate::proxy;

#[tokio::main]
async fn main() -> Result<(), String> {
    modules::logger::init_logger();

    let opts = proxy::Options::from_env().map_err(|e| format!("configuration error: {}", e))?;

    let bind_address =
        std::env::var("HOSTGATE_BIND").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = match std::env::var("HOSTGATE_PORT") {
        Ok(value) => value
            .parse()
            .map_err(|_| format!("invalid HOSTGATE_PORT: {}", value))?,
        Err(_) => 8080,
    };

    let proxy = Arc::new(
        proxy::Proxy::new(&opts).map_err(|e| format!("failed to build proxy: {}", e))?,
    );
    tracing::info!(
        "forwarding {} routes; authenticate service: {}",
        proxy.route_count(),
        proxy.authenticate_client().service_url()
    );

    let (server, handle) = proxy::AxumServer::start(bind_address.clone(), port, proxy)
        .await
        .map_err(|e| format!("failed to start proxy server: {}", e))?;

    tracing::info!("hostgate listening on http://{}:{}", bind_address, port);

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("failed to listen for shutdown signal: {}", e))?;

    tracing::info!("shutdown requested, stopping server...");
    server.stop();
    let _ = handle.await;

    Ok(())
}
