//! WebSocket accept loop and upgrade handling.

use std::{net::SocketAddr, sync::Arc};

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_async, accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
    },
};

use super::{Server, accept::AcceptDelay};
use crate::connection::transport;

/// The HTTP upgrade request passed to the WebSocket auth hook.
pub type WsUpgradeRequest = Request;

/// Caller-supplied auth hook; returning `false` rejects the upgrade with
/// `401 Unauthorized`.
pub type WebsocketAuth = Arc<dyn Fn(&WsUpgradeRequest) -> bool + Send + Sync>;

/// Accept WebSocket connections until the server shuts down.
pub(crate) async fn ws_accept_loop(server: Arc<Server>, listener: TcpListener) {
    let shutdown = server.shutdown_token();
    let mut delay = AcceptDelay::new();
    loop {
        if server.at_capacity() {
            log::info!(
                "exceeded max conn {}, waiting {:?}",
                server.config().max_conn,
                delay.current()
            );
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = delay.wait() => {}
            }
            continue;
        }

        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    delay.reset();
                    // The handshake can stall on a slow client; run it off
                    // the accept loop.
                    server.tracker().spawn(upgrade(Arc::clone(&server), stream, peer));
                }
                Err(err) => {
                    log::error!("websocket accept error: {err}");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = delay.wait() => {}
                    }
                }
            }
        }
    }
    log::info!("websocket listener stopped");
}

/// A peer that never finishes the handshake must not pin shutdown.
const UPGRADE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

async fn upgrade(server: Arc<Server>, stream: TcpStream, peer: SocketAddr) {
    let local = stream.local_addr().unwrap_or(peer);

    let handshake = async {
        match server.websocket_auth() {
            Some(auth) => {
                accept_hdr_async(stream, move |request: &Request, response: Response| {
                    if auth(request) {
                        Ok(response)
                    } else {
                        let mut rejection = ErrorResponse::new(Some("unauthorized".to_owned()));
                        *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                        Err(rejection)
                    }
                })
                .await
            }
            None => accept_async(stream).await,
        }
    };

    match tokio::time::timeout(UPGRADE_TIMEOUT, handshake).await {
        Ok(Ok(ws)) => {
            let (reader, writer) = transport::split_websocket(ws);
            server.start_conn(reader, writer, peer, local, true);
        }
        Ok(Err(err)) => log::error!("websocket upgrade from {peer} failed: {err}"),
        Err(_) => log::error!("websocket upgrade from {peer} timed out"),
    }
}
