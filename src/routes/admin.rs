//! Routes for the administration commands of the server

use std::time::Instant;

use actix_web::{web, HttpResponse};
use paste::paste;
use serde::{Deserialize, Serialize};

use crate::data::{CmdValue, LongStringArray};
use crate::dserver::{AdminCommand, DServer};
use crate::error::DsError;

fn reply(value: CmdValue) -> HttpResponse {
    match value {
        CmdValue::StringArray(lines) => HttpResponse::Ok().json(lines),
        _ => HttpResponse::Ok().finish(),
    }
}

macro_rules! impl_handler_for_admin_command {
    ($action:ident, $path:expr, $($field:ident),*) => {
        // Implement conversion to the AdminCommand variant.
        paste! {
        impl From<[<$action:camel>]> for AdminCommand {
            // Prefixing with underscore to avoid lint errors when $field is empty.
            fn from(_request: [<$action:camel>]) -> Self {
                AdminCommand::[<$action:camel>] {
                    $($field: _request.$field),*
                }
            }
        }

        // Generate the request handler.
        #[actix_web::post($path)]
        #[tracing::instrument(
            skip(request, dserver),
            fields(
                client_id = ?request.client_id,
                $($field = ?request.$field),*
            )
        )]
        pub async fn [<$action:snake _handler>](
            request: web::Json<[<$action:camel>]>,
            dserver: web::Data<DServer>,
        ) -> Result<HttpResponse, DsError> {
            let now = Instant::now();
            let request = request.into_inner();
            tracing::info!("Received request ({:?})", request);

            let client = request.client_id.clone();
            let command = AdminCommand::from(request);
            let dserver = dserver.into_inner();
            let value = web::block(move || command.execute(&dserver, client.as_deref(), now)).await??;

            Ok(reply(value))
        }
        }
    };
}

#[derive(Serialize, Deserialize, Debug)]
pub struct AddObjPolling {
    #[serde(flatten)]
    pub argin: LongStringArray,
    #[serde(default)]
    pub client_id: Option<String>,
}

impl_handler_for_admin_command!(add_obj_polling, "/add_obj_polling", argin);

#[derive(Serialize, Deserialize, Debug)]
pub struct UpdObjPollingPeriod {
    #[serde(flatten)]
    pub argin: LongStringArray,
    #[serde(default)]
    pub client_id: Option<String>,
}

impl_handler_for_admin_command!(upd_obj_polling_period, "/upd_obj_polling_period", argin);

#[derive(Serialize, Deserialize, Debug)]
pub struct RemObjPolling {
    #[serde(rename = "svalue")]
    pub argin: Vec<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

impl_handler_for_admin_command!(rem_obj_polling, "/rem_obj_polling", argin);

#[derive(Serialize, Deserialize, Debug)]
pub struct TriggerPolling {
    #[serde(rename = "svalue")]
    pub argin: Vec<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

impl_handler_for_admin_command!(trigger_polling, "/trigger_polling", argin);

#[derive(Serialize, Deserialize, Debug)]
pub struct DevPollStatus {
    pub device: String,
    #[serde(default)]
    pub client_id: Option<String>,
}

impl_handler_for_admin_command!(dev_poll_status, "/dev_poll_status", device);

#[actix_web::get("/polled_device")]
#[tracing::instrument(skip(dserver))]
async fn polled_device_handler(dserver: web::Data<DServer>) -> Result<HttpResponse, DsError> {
    let now = Instant::now();
    tracing::info!("Received request");
    let dserver = dserver.into_inner();
    let value = web::block(move || AdminCommand::PolledDevice.execute(&dserver, None, now)).await??;
    Ok(reply(value))
}

#[actix_web::post("/start_polling")]
#[tracing::instrument(skip(dserver))]
async fn start_polling_handler(dserver: web::Data<DServer>) -> Result<HttpResponse, DsError> {
    let now = Instant::now();
    tracing::info!("Received request");
    let dserver = dserver.into_inner();
    let value = web::block(move || AdminCommand::StartPolling.execute(&dserver, None, now)).await??;
    Ok(reply(value))
}

#[actix_web::post("/stop_polling")]
#[tracing::instrument(skip(dserver))]
async fn stop_polling_handler(dserver: web::Data<DServer>) -> Result<HttpResponse, DsError> {
    let now = Instant::now();
    tracing::info!("Received request");
    let dserver = dserver.into_inner();
    let value = web::block(move || AdminCommand::StopPolling.execute(&dserver, None, now)).await??;
    Ok(reply(value))
}

/// Response for `GET /admin/status`.
#[derive(Serialize, Deserialize, Debug)]
pub struct StatusResponse {
    pub status: String,
    pub polling: bool,
}

#[actix_web::get("/status")]
async fn status_handler(dserver: web::Data<DServer>) -> HttpResponse {
    HttpResponse::Ok().json(StatusResponse {
        status: dserver.status(),
        polling: dserver.is_polling_on(),
    })
}

pub fn admin_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(add_obj_polling_handler)
        .service(upd_obj_polling_period_handler)
        .service(rem_obj_polling_handler)
        .service(trigger_polling_handler)
        .service(dev_poll_status_handler)
        .service(polled_device_handler)
        .service(start_polling_handler)
        .service(stop_polling_handler)
        .service(status_handler);
}
