use actix_web::{HttpResponse, Responder, get, web};

use crate::registry::SessionRegistry;

#[get("/sessions")]
pub async fn get_sessions_handler(registry: web::Data<SessionRegistry>) -> impl Responder {
    HttpResponse::Ok().json(registry.snapshot())
}
