//! Routes and handlers for interacting with the server and its devices

pub mod admin;
pub mod device;
pub mod events;
pub mod server;

pub use admin::admin_routes;
pub use device::device_routes;
pub use events::event_routes;
pub use server::{server_routes, DeviceInfo, DiscoveryInfo};
