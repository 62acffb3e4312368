//! Routes for the requests served by one device

use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};

use crate::data::{CmdValue, DevSource};
use crate::dserver::DServer;
use crate::error::DsError;
use crate::events::EventKind;

// Device names carry slashes (`domain/family/member`), hence the regex segment.

#[derive(Serialize, Deserialize, Debug)]
pub struct CommandInoutRequest {
    pub name: String,
    #[serde(default)]
    pub argin: CmdValue,
    pub source: DevSource,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[actix_web::post("/{device:.+}/command_inout_2")]
#[tracing::instrument(
    skip(device, request, dserver),
    fields(
        device = %device,
        command = %request.name,
        source = ?request.source,
    )
)]
async fn command_inout_handler(
    device: web::Path<String>,
    request: web::Json<CommandInoutRequest>,
    dserver: web::Data<DServer>,
) -> Result<HttpResponse, DsError> {
    tracing::info!("Received request");
    let device = device.into_inner();
    let request = request.into_inner();
    let dserver = dserver.into_inner();

    let value = web::block(move || {
        dserver.command_inout_2(
            &device,
            &request.name,
            &request.argin,
            request.source,
            request.client_id.as_deref(),
        )
    })
    .await??;

    Ok(HttpResponse::Ok().json(value))
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ReadAttributesRequest {
    pub names: Vec<String>,
    pub source: DevSource,
}

#[actix_web::post("/{device:.+}/read_attributes_2")]
#[tracing::instrument(
    skip(device, request, dserver),
    fields(
        device = %device,
        names = ?request.names,
        source = ?request.source,
    )
)]
async fn read_attributes_handler(
    device: web::Path<String>,
    request: web::Json<ReadAttributesRequest>,
    dserver: web::Data<DServer>,
) -> Result<HttpResponse, DsError> {
    tracing::info!("Received request");
    let device = device.into_inner();
    let request = request.into_inner();
    let dserver = dserver.into_inner();

    let values =
        web::block(move || dserver.read_attributes_2(&device, &request.names, request.source))
            .await??;

    Ok(HttpResponse::Ok().json(values))
}

#[derive(Serialize, Deserialize, Debug)]
pub struct HistoryRequest {
    pub name: String,
    pub n: usize,
}

#[actix_web::post("/{device:.+}/command_inout_history_2")]
#[tracing::instrument(
    skip(device, request, dserver),
    fields(device = %device, command = %request.name, n = request.n)
)]
async fn command_history_handler(
    device: web::Path<String>,
    request: web::Json<HistoryRequest>,
    dserver: web::Data<DServer>,
) -> Result<HttpResponse, DsError> {
    tracing::info!("Received request");
    let device = device.into_inner();
    let request = request.into_inner();
    let dserver = dserver.into_inner();

    let history = web::block(move || {
        dserver.command_inout_history_2(&device, &request.name, request.n)
    })
    .await??;

    Ok(HttpResponse::Ok().json(history))
}

#[actix_web::post("/{device:.+}/read_attribute_history_2")]
#[tracing::instrument(
    skip(device, request, dserver),
    fields(device = %device, attribute = %request.name, n = request.n)
)]
async fn attribute_history_handler(
    device: web::Path<String>,
    request: web::Json<HistoryRequest>,
    dserver: web::Data<DServer>,
) -> Result<HttpResponse, DsError> {
    tracing::info!("Received request");
    let device = device.into_inner();
    let request = request.into_inner();
    let dserver = dserver.into_inner();

    let history = web::block(move || {
        dserver.read_attribute_history_2(&device, &request.name, request.n)
    })
    .await??;

    Ok(HttpResponse::Ok().json(history))
}

#[derive(Serialize, Deserialize, Debug)]
pub struct LockRequest {
    pub client_id: String,
}

#[actix_web::post("/{device:.+}/lock")]
#[tracing::instrument(skip(device, request, dserver), fields(device = %device, client_id = %request.client_id))]
async fn lock_handler(
    device: web::Path<String>,
    request: web::Json<LockRequest>,
    dserver: web::Data<DServer>,
) -> Result<HttpResponse, DsError> {
    tracing::info!("Received request");
    dserver.registry().get(&device)?.lock(&request.client_id)?;
    Ok(HttpResponse::Ok().finish())
}

#[actix_web::post("/{device:.+}/unlock")]
#[tracing::instrument(skip(device, request, dserver), fields(device = %device, client_id = %request.client_id))]
async fn unlock_handler(
    device: web::Path<String>,
    request: web::Json<LockRequest>,
    dserver: web::Data<DServer>,
) -> Result<HttpResponse, DsError> {
    tracing::info!("Received request");
    dserver.registry().get(&device)?.unlock(&request.client_id)?;
    Ok(HttpResponse::Ok().finish())
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SubscriptionRequest {
    pub attribute: String,
    pub kind: EventKind,
}

#[actix_web::post("/{device:.+}/subscribe")]
#[tracing::instrument(
    skip(device, request, dserver),
    fields(device = %device, attribute = %request.attribute, kind = ?request.kind)
)]
async fn subscribe_handler(
    device: web::Path<String>,
    request: web::Json<SubscriptionRequest>,
    dserver: web::Data<DServer>,
) -> Result<HttpResponse, DsError> {
    tracing::info!("Received request");
    let dev = dserver.registry().get(&device)?;
    let info = dev.attr_info(&request.attribute)?;
    dserver.events().subscribe(dev.name(), &info.name, request.kind);
    Ok(HttpResponse::Ok().finish())
}

#[actix_web::post("/{device:.+}/unsubscribe")]
#[tracing::instrument(
    skip(device, request, dserver),
    fields(device = %device, attribute = %request.attribute, kind = ?request.kind)
)]
async fn unsubscribe_handler(
    device: web::Path<String>,
    request: web::Json<SubscriptionRequest>,
    dserver: web::Data<DServer>,
) -> Result<HttpResponse, DsError> {
    tracing::info!("Received request");
    let dev = dserver.registry().get(&device)?;
    if !dserver
        .events()
        .unsubscribe(dev.name(), &request.attribute, request.kind)
    {
        tracing::warn!("No {:?} subscription on {}", request.kind, request.attribute);
    }
    Ok(HttpResponse::Ok().finish())
}

pub fn device_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(command_inout_handler)
        .service(read_attributes_handler)
        .service(command_history_handler)
        .service(attribute_history_handler)
        .service(lock_handler)
        .service(unlock_handler)
        .service(subscribe_handler)
        .service(unsubscribe_handler);
}
