use actix_web::dev::ServiceRequest;
use actix_web::error::ErrorUnauthorized;
use actix_web::{web, App, HttpResponse, HttpServer};
use actix_web_httpauth::extractors::bearer::BearerAuth;
use actix_web_httpauth::middleware::HttpAuthentication;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};

use kale_common::api::notify::{ApiErrorBody, NotifyResponse, PlantedFarmersPayload};

use crate::scheduler::{SchedulerCommand, WorkJob};

// Inbound surface of the executor: the discoverer posts the planted set
// here. Receipt is idempotent per block; a duplicate simply replaces the
// pending schedule for that block.

pub struct ServerState {
    pub scheduler_tx: mpsc::Sender<SchedulerCommand>,
    pub bearer_token: String,
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health)).service(
        web::scope("/backend")
            .wrap(HttpAuthentication::bearer(validate_bearer))
            .route("/planted-farmers", web::post().to(planted_farmers)),
    );
}

pub async fn run_server(
    bind_address: String,
    state: web::Data<ServerState>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .app_data(json_config())
            .configure(routes)
    })
    .bind(&bind_address)?
    .disable_signals()
    .run();

    info!("executor listening on {bind_address}");
    let handle = server.handle();
    tokio::spawn(async move {
        let _ = shutdown.changed().await;
        handle.stop(true).await;
    });
    server.await
}

// Malformed bodies come back as a structured 400 instead of actix's
// default error page
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _| {
        let body = ApiErrorBody {
            code: "BAD_REQUEST".into(),
            message: err.to_string(),
        };
        actix_web::error::InternalError::from_response(
            err,
            HttpResponse::BadRequest().json(body),
        )
        .into()
    })
}

async fn validate_bearer(
    req: ServiceRequest,
    credentials: BearerAuth,
) -> Result<ServiceRequest, (actix_web::Error, ServiceRequest)> {
    let expected = req
        .app_data::<web::Data<ServerState>>()
        .map(|state| state.bearer_token.as_str());
    match expected {
        Some(expected) if credentials.token() == expected => Ok(req),
        _ => {
            warn!("rejected notification with a bad bearer token");
            Err((ErrorUnauthorized("invalid bearer token"), req))
        }
    }
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

async fn planted_farmers(
    state: web::Data<ServerState>,
    payload: web::Json<PlantedFarmersPayload>,
) -> HttpResponse {
    let payload = payload.into_inner();

    if let Err(err) = payload.validate() {
        debug!("rejected malformed notification: {err}");
        return HttpResponse::BadRequest().json(ApiErrorBody {
            code: "BAD_REQUEST".into(),
            message: err.to_string(),
        });
    }

    let farmers_scheduled = payload.planted_farmers.len();
    let block_index = payload.block_index;
    let job = WorkJob::from_payload(payload);

    if state
        .scheduler_tx
        .send(SchedulerCommand::ScheduleWork(job))
        .await
        .is_err()
    {
        warn!("scheduler channel closed, cannot accept block {block_index}");
        return HttpResponse::InternalServerError().json(ApiErrorBody {
            code: "INTERNAL_ERROR".into(),
            message: "scheduler unavailable".into(),
        });
    }

    info!("block {block_index}: scheduled work for {farmers_scheduled} farmers");
    HttpResponse::Ok().json(NotifyResponse {
        success: true,
        farmers_scheduled,
    })
}
