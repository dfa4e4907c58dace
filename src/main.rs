mod config;
mod error;
mod forwarder;
mod listener;
mod log_entry;
mod logging;
mod loki_client;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use log::{error, info};
use std::net::{Ipv4Addr, SocketAddr};

#[tokio::main]
async fn main() {
    logging::init();

    let cli = config::Cli::parse();

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, listener::PORT));
    let listener = match listener::Listener::bind(addr)
        .await
        .with_context(|| format!("failed to bind UDP socket on {}", addr))
    {
        Ok(listener) => listener,
        Err(e) => {
            let reason = format!("{:#}", e);
            error!(error:% = reason; "unable to listen");
            std::process::exit(1);
        }
    };
    if let Ok(local) = listener.local_addr() {
        info!(addr:% = local; "listening for weatherflow broadcasts");
    }

    let client = loki_client::LokiClient::new(cli.into());
    if let Err(ref e) = client {
        error!(error:% = e; "failed to create client");
    }

    let forwarder = forwarder::Forwarder::new(client, Utc::now());
    forwarder::run(listener, forwarder).await;
}
