use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tower_http::trace::TraceLayer;
use tracing::info;

use dropsync_relay::rooms::Rooms;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dropsync=debug,tower_http=debug".into()),
        )
        .init();

    let host = std::env::var("DROPSYNC_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("DROPSYNC_PORT")
        .unwrap_or_else(|_| "3210".into())
        .parse()?;

    let rooms = Rooms::new();
    let app = dropsync_relay::router(rooms).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    info!("DropSync relay listening on {addr}");

    // socket2 for address reuse and TCP_NODELAY on the accept socket.
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nodelay(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(socket.into())?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Ctrl+C / SIGTERM trigger a graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
