use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use runhub::config::{CliArgs, Config};
use runhub::exec::ExecEnv;
use runhub::gateway;
use runhub::registry::SessionRegistry;
use runhub::web_server::build_server;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let config: Config = cli.to_config().expect("Failed to load configuration");

    let env = Arc::new(ExecEnv::from_config(&config).expect("Failed to prepare execution environment"));
    let registry = Arc::new(SessionRegistry::new(env.clone()));
    let shutdown_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    let listener = TcpListener::bind((
        config.server.bind_address.as_str(),
        config.server.session_port,
    ))
    .await?;
    let gateway_task = tokio::spawn(gateway::serve(
        listener,
        registry.clone(),
        shutdown_token.clone(),
    ));

    let server = build_server(&config.server, env, registry.clone())?;
    log::info!(
        "HTTP server listening on {}:{}",
        config.server.bind_address,
        config.server.bind_port
    );
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
        res_gateway = gateway_task => {
            log::error!("Session gateway terminated unexpectedly: {:?}", res_gateway);
        }
    }

    // 1. Shutdown actix-web server gracefully
    server_handle.stop(true).await;

    // 2. Stop accepting interactive clients
    shutdown_token.cancel();

    // 3. Kill every live process and wait for the sessions to clean up
    for session in registry.close_all() {
        session.closed().await;
    }

    log::info!("Shutdown complete");
    Ok(())
}
