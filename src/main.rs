use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use cinder::config::Config;
use cinder::replica;
use cinder::server::Server;

fn main() {
    let config = Arc::new(Config::parse());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let server = match Server::bind(config.clone()) {
        Ok(server) => server,
        Err(err) => {
            error!("failed to bind port {}: {}", config.port, err);
            process::exit(1);
        }
    };

    if let Some(master) = config.replicaof.clone() {
        if let Err(err) = replica::start_replication(server.executor().clone(), master, config.port)
        {
            error!("failed to start replication: {}", err);
            process::exit(1);
        }
    }

    if let Err(err) = server.run() {
        error!("server loop failed: {}", err);
        process::exit(1);
    }
}
