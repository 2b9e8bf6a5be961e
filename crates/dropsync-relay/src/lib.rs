/// DropSync rendezvous relay.
///
/// A room-and-forward service: endpoints join a named room over a WebSocket,
/// learn about each other through `peer-joined` / `peer-left`, and exchange
/// opaque signal payloads. The relay inspects only the envelope and stores
/// nothing. Keepalive pings defeat idle intermediaries; there is no polling
/// fallback.

pub mod connection;
pub mod rooms;

use axum::Router;
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;

use crate::rooms::Rooms;

pub fn router(rooms: Rooms) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(rooms)
}

async fn ws_upgrade(State(rooms): State<Rooms>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_socket(socket, rooms))
}
