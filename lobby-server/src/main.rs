use log::{error, info};

use lobby_room::server::{LobbyServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    info!("Starting lobby server on {}...", config.bind_addr);
    let server = LobbyServer::new(config).await;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let evicted = server.room().group().close().await;
            info!("Shutting down, evicted {} members", evicted.len());
        }
    }
}
