use std::sync::Arc;

use log::info;

use blockfab_server::Server;
use blockfab_transport::AltServerRegistry;

use crate::cli::ServeCmd;

pub async fn run(cmd: ServeCmd) -> Result<(), Box<dyn std::error::Error>> {
    let altservers = Arc::new(AltServerRegistry::new());
    for &host in &cmd.alt_servers {
        altservers.add(host, "configured", false, false);
    }

    let handle = Server::bind(cmd.make_server_config(), altservers, cmd.bind).await?;
    info!("server ready on {}", handle.local_addr);

    tokio::signal::ctrl_c().await?;
    handle.shutdown().await;
    Ok(())
}
