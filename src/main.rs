use std::net::TcpListener;

use dserverd::config::{get_config, ConnectionMode};
use dserverd::startup::{
    get_unix_listener, init_tracing, start_dserver, start_server_tcp, start_server_uds,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = get_config();

    init_tracing(std::io::stdout)?;

    tracing::info!("{:?}", config);

    let dserver = start_dserver(
        config.polling_settings(),
        config.property_file.as_deref(),
        &config.devices,
    )?;

    let num_workers = config.num_workers.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    });
    let server = match config.mode {
        ConnectionMode::UDS => {
            let listener = get_unix_listener(
                &config.socket_path,
                u32::from_str_radix(&config.socket_permissions, 8)?,
            )?;
            tracing::info!("Listening on {}", &config.socket_path);
            start_server_uds(listener, dserver.clone(), num_workers)?
        }
        ConnectionMode::TCP => {
            let listener = TcpListener::bind(&config.tcp_bind_address)?;
            tracing::info!("Listening on {}", &listener.local_addr()?);
            start_server_tcp(listener, dserver.clone(), num_workers)?
        }
    };

    server.await?;

    dserver.shutdown();

    Ok(())
}
