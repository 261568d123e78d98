use clap::Parser;
use env_logger::{Builder, Env};
use fleet_gateway::{server, GatewayConfig};
use std::error::Error;

fn init_logging() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .format_module_path(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // .env first so RUST_LOG and the gateway options can come from it
    dotenvy::dotenv().ok();
    init_logging();

    let config = GatewayConfig::parse();
    log::info!(
        "Starting fleet-gateway {} ({:?} addresses, {} attempts/key, concurrency {})",
        env!("CARGO_PKG_VERSION"),
        config.address_format,
        config.max_attempts,
        config.max_concurrency
    );

    server::serve(config).await
}
