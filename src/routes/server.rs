//! Server-level routes (discovery, time).

use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};

use crate::data::now_ms;
use crate::dserver::DServer;

/// One served device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub idl_version: u32,
}

/// Discovery information returned by `GET /discover`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveryInfo {
    pub admin_device: String,
    pub devices: Vec<DeviceInfo>,
}

#[actix_web::get("/discover")]
async fn discover_handler(dserver: web::Data<DServer>) -> HttpResponse {
    let mut devices: Vec<DeviceInfo> = dserver
        .registry()
        .all()
        .iter()
        .map(|d| DeviceInfo {
            name: d.name().to_string(),
            idl_version: d.idl_version(),
        })
        .collect();
    devices.sort_by(|a, b| a.name.cmp(&b.name));
    HttpResponse::Ok().json(DiscoveryInfo {
        admin_device: dserver.settings().admin_name.clone(),
        devices,
    })
}

/// Response for `GET /time`.
#[derive(Serialize, Deserialize)]
pub struct TimeResponse {
    pub timestamp_ms: u64,
}

/// Return the daemon's current Unix timestamp in milliseconds.
#[actix_web::get("/time")]
async fn time_handler() -> HttpResponse {
    HttpResponse::Ok().json(TimeResponse {
        timestamp_ms: now_ms(),
    })
}

/// Register discovery and time routes at the server root.
pub fn server_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(discover_handler).service(time_handler);
}
