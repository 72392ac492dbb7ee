use mcpsock::{build_app, config::Config, demo, logging, server::WebSocketServer, AppState};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;

    let mut server = WebSocketServer::from_config(&config);
    demo::register_demo_handlers(&mut server)?;

    let bind_socket = config.bind_socket()?;
    let state = AppState::new(server.into_handle(), config.ws_path.clone());
    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(bind_socket).await?;

    info!(
        bind_addr = %config.bind_addr,
        bind_port = config.bind_port,
        ws_path = %config.ws_path,
        request_timeout_secs = config.request_timeout.map(|timeout| timeout.as_secs()),
        connection_tracking = config.connection_tracking,
        "server starting"
    );

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
