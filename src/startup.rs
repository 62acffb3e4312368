//! Startup logic.

use std::fs;
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::sync::Arc;

use actix_web::dev::Server;
use actix_web::{web, App, HttpServer};
use tracing::subscriber::set_global_default;
use tracing_log::LogTracer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::devices::sim::SimDevice;
use crate::dserver::{DServer, PollingSettings};
use crate::properties::{FilePropertyStore, MemoryPropertyStore, PropertyStore};
use crate::routes::{admin_routes, device_routes, event_routes, server_routes};

/// IDL version declared by the simulated devices.
pub const SIM_DEVICE_IDL: u32 = 5;

/// Initialize tracing with the given where to write logs to.
pub fn init_tracing<S>(sink: S) -> anyhow::Result<()>
where
    S: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    LogTracer::init()?;

    let formatter = tracing_subscriber::fmt::layer().with_writer(sink);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(formatter).with(env_filter);
    set_global_default(subscriber)?;

    Ok(())
}

/// Create a socket at the given path and bind a UnixListener to it.
pub fn get_unix_listener(socket_path: &str, permissions: u32) -> anyhow::Result<UnixListener> {
    if fs::metadata(socket_path).is_ok() {
        tracing::error!(
            "Socket file {} already exists. Please remove it and restart dserverd.",
            socket_path,
        );
        anyhow::bail!("Socket file already exists");
    }
    let listener = UnixListener::bind(socket_path)?;
    fs::set_permissions(socket_path, fs::Permissions::from_mode(permissions))?;
    Ok(listener)
}

/// Build the server context and register the simulated devices.
///
/// With a property file, polling configuration changes are written back to
/// it. Without one, an empty in-memory store is used and nothing persists.
pub fn start_dserver(
    settings: PollingSettings,
    property_file: Option<&str>,
    devices: &[String],
) -> anyhow::Result<Arc<DServer>> {
    let (store, with_db): (Arc<dyn PropertyStore>, bool) = match property_file {
        Some(path) => {
            tracing::info!("Loading device properties from {}", path);
            (Arc::new(FilePropertyStore::open(path)?), true)
        }
        None => (Arc::new(MemoryPropertyStore::new()), false),
    };
    let dserver = DServer::new(settings, store, with_db)?;
    for name in devices {
        dserver.add_device(name, SIM_DEVICE_IDL, Box::new(SimDevice::new()))?;
    }
    dserver.configure_polling();
    Ok(dserver)
}

/// Build an `HttpServer` with every route and the shared server context.
macro_rules! configure_server {
    ($dserver:expr, $workers:expr) => {
        HttpServer::new(move || {
            App::new()
                .wrap(tracing_actix_web::TracingLogger::default())
                .configure(server_routes)
                .service(web::scope("/admin").configure(admin_routes))
                .service(web::scope("/device").configure(device_routes))
                .service(web::scope("/events").configure(event_routes))
                .app_data(web::Data::from($dserver.clone()))
        })
        .workers($workers)
    };
}

/// Set up routing and start the server on a unix domain socket.
pub fn start_server_uds(
    listener: UnixListener,
    dserver: Arc<DServer>,
    num_workers: usize,
) -> std::io::Result<Server> {
    Ok(configure_server!(dserver, num_workers)
        .listen_uds(listener)?
        .run())
}

/// Set up routing and start the server over TCP.
pub fn start_server_tcp(
    listener: TcpListener,
    dserver: Arc<DServer>,
    num_workers: usize,
) -> std::io::Result<Server> {
    Ok(configure_server!(dserver, num_workers)
        .listen(listener)?
        .run())
}
