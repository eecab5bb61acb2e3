//! Connects to the Deribit test environment, subscribes to a public ticker
//! channel and prints everything pushed by the server until CTRL+C.
//!
//! Credentials are optional for public data; export `DERIBIT_CLIENT_ID` and
//! `DERIBIT_CLIENT_SECRET` to exercise the authenticated bootstrap as well.

use deribit_client::{DeribitClientConfig, DeribitWebSocketClient};
use serde_json::json;
use tokio::{pin, signal};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    let mut config = DeribitClientConfig::from_env();
    config.authenticate = config.has_credentials();

    let client = DeribitWebSocketClient::new(config)?;
    let mut stream = client.take_message_stream().expect("stream already taken");
    client.connect().await?;

    client
        .subscribe("ticker.BTC-PERPETUAL.100ms", json!({}))
        .await?;

    let sigint = signal::ctrl_c();
    pin!(sigint);

    loop {
        tokio::select! {
            Some(message) = stream.recv() => {
                tracing::debug!("{message:?}");
            }
            _ = &mut sigint => {
                tracing::info!("Received SIGINT, closing connection...");
                client.disconnect().await?;
                break;
            }
            else => break,
        }
    }

    Ok(())
}
