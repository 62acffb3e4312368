//! Server-sent event stream of attribute events.

use actix_web::web::Bytes;
use actix_web::{web, HttpResponse};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::dserver::DServer;

/// SSE stream of every event fired by the polling engine.
///
/// Events missed by a lagging consumer are dropped from its stream.
#[actix_web::get("/stream")]
async fn event_stream_handler(dserver: web::Data<DServer>) -> HttpResponse {
    let guard = dserver.events().add_stream();
    tracing::info!(
        "Event stream opened ({} active)",
        dserver.events().stream_count()
    );
    let rx = dserver.events().receiver();
    let stream = BroadcastStream::new(rx).filter_map(move |event| {
        let _ = &guard;
        let event = event.ok()?;
        let json = serde_json::to_string(&event).unwrap_or_default();
        Some(Ok::<_, actix_web::Error>(Bytes::from(format!("data: {json}\n\n"))))
    });
    HttpResponse::Ok()
        .insert_header(("Content-Type", "text/event-stream"))
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(stream)
}

pub fn event_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(event_stream_handler);
}
