//! Configuration.

use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::dserver::PollingSettings;

/// The device server daemon serves a set of devices and keeps a cache of
/// their polled commands and attributes, refreshed by background polling
/// threads and read by clients over HTTP.
#[derive(Parser, Debug)]
#[command(version)]
pub struct Config {
    /// Operating mode: UDS or TCP.
    #[clap(long, default_value = "uds")]
    pub mode: ConnectionMode,

    /// [UDS mode] Path to the socket the daemon will listen on.
    #[clap(long, default_value = "/var/run/dserverd.sock")]
    pub socket_path: String,

    /// [UDS mode] Permissions for the socket file to be created.
    #[clap(long, default_value = "666")]
    pub socket_permissions: String,

    /// [TCP mode] Address to bind to.
    #[clap(long, default_value = "127.0.0.1:4939")]
    pub tcp_bind_address: String,

    /// Number of worker threads to use. Default is the number of logical CPUs.
    #[clap(long)]
    pub num_workers: Option<usize>,

    /// JSON file holding device properties. Without it, polling
    /// configuration changes are not persisted.
    #[clap(long)]
    pub property_file: Option<String>,

    /// Name of a simulated device to serve. Can be repeated.
    #[clap(long = "device", default_value = "sim/test/1")]
    pub devices: Vec<String>,

    /// Name of the administration device.
    #[clap(long, default_value = "dserver/dserverd/1")]
    pub admin_name: String,

    /// Default depth of the polling ring buffers.
    #[clap(long, default_value = "10")]
    pub poll_ring_depth: usize,

    /// Data older than this many polling periods is reported as stale.
    #[clap(long, default_value = "4")]
    pub poll_old_factor: u32,

    /// Minimum polling period for devices without their own. 0 for none.
    #[clap(long, default_value = "0")]
    pub min_poll_period_ms: u32,

    /// Maximum number of polling threads.
    #[clap(long, default_value = "1")]
    pub polling_threads_pool_size: usize,

    /// How long to wait for a polling thread to take a command.
    #[clap(long, default_value = "3200")]
    pub cmd_timeout_ms: u64,

    /// Read every polled attribute separately instead of grouping the
    /// attributes polled with the same period.
    #[clap(long, default_value = "false")]
    pub polling_before_9: bool,
}

impl Config {
    pub fn polling_settings(&self) -> PollingSettings {
        PollingSettings {
            ring_depth: self.poll_ring_depth,
            poll_old_factor: self.poll_old_factor,
            min_poll_period_ms: self.min_poll_period_ms,
            pool_size: self.polling_threads_pool_size.max(1),
            cmd_timeout: Duration::from_millis(self.cmd_timeout_ms),
            polling_before_9: self.polling_before_9,
            admin_name: self.admin_name.clone(),
        }
    }
}

pub fn get_config() -> Config {
    Config::parse()
}

/// The mode of connection to use for the daemon.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum ConnectionMode {
    /// Unix domain socket.
    UDS,
    /// TCP.
    TCP,
}
