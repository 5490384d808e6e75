use actix_web::{HttpResponse, Responder, post, web};
use serde::Deserialize;

use super::{ErrorResponse, ErrorResponseWithMessage};
use crate::exec::ExecEnv;
use crate::oneshot;
use crate::source::SourceRef;

#[derive(Deserialize, Debug)]
pub struct RunRequest {
    pub source: SourceRef,
    pub input: Option<String>,
}

/// Single-shot run: build, feed the whole input, answer with the aggregate output
#[post("/run")]
pub async fn post_run_handler(env: web::Data<ExecEnv>, body: web::Json<RunRequest>) -> impl Responder {
    let RunRequest { source, input } = body.into_inner();

    if !env.catalog.knows(&source) {
        return HttpResponse::NotFound().json(ErrorResponse {
            reason: "ERR_NOT_FOUND",
            code: 3,
        });
    }

    match oneshot::execute(&env, &source, input.as_deref()).await {
        Ok(text) => HttpResponse::Ok().content_type("text/plain; charset=utf-8").body(text),
        Err(e) => {
            log::error!("Single-shot run failed: {e:#}");
            HttpResponse::InternalServerError().json(ErrorResponseWithMessage {
                reason: "ERR_INTERNAL",
                code: 6,
                message: format!("{e:#}"),
            })
        }
    }
}
