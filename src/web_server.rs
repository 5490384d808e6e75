use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::ServerConfig;
use crate::exec::ExecEnv;
use crate::registry::SessionRegistry;
use crate::routes::{get_sessions_handler, json_error_handler, post_run_handler};

pub fn build_server(
    server_config: &ServerConfig,
    env: Arc<ExecEnv>,
    registry: Arc<SessionRegistry>,
) -> std::io::Result<Server> {
    let env = web::Data::from(env);
    let registry = web::Data::from(registry);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(env.clone())
            .app_data(registry.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .wrap(middleware::Logger::default())
            .service(post_run_handler)
            .service(get_sessions_handler)
    })
    .bind((server_config.bind_address.clone(), server_config.bind_port))?
    .run();

    Ok(server)
}
