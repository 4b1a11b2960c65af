//! WebSocket transport: binary frames route like TCP frames, and the auth
//! hook gates the upgrade.

mod common;

use std::sync::Arc;

use fastnet::{Request, Router, ServerConfig, ServerMode, server::Server};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use common::local_config;

struct EchoRouter;

impl Router for EchoRouter {
    fn handle(&self, request: &mut Request) {
        let Some(conn) = request.connection() else { return };
        let id = request.msg_id();
        let data = request.data().clone();
        tokio::spawn(async move {
            let _ = conn.send_msg(id, data).await;
        });
    }
}

fn ws_config() -> ServerConfig {
    ServerConfig {
        mode: ServerMode::Websocket,
        ..local_config()
    }
}

fn tlv_frame(id: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&id.to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

#[tokio::test]
async fn binary_messages_round_trip() {
    let server = Server::new(ws_config());
    server
        .add_router(2, Arc::new(EchoRouter))
        .expect("registration should succeed");
    server.start().await.expect("server should start");
    let addr = server.ws_bound_addr().expect("ws listener should be bound");

    let (mut socket, _response) = connect_async(format!("ws://{addr}"))
        .await
        .expect("upgrade should succeed");
    socket
        .send(Message::binary(tlv_frame(2, b"over websocket")))
        .await
        .expect("client send");

    let reply = socket
        .next()
        .await
        .expect("stream should yield")
        .expect("reply should arrive");
    let Message::Binary(data) = reply else {
        panic!("expected a binary reply, got {reply:?}");
    };
    assert_eq!(data.as_ref(), tlv_frame(2, b"over websocket").as_slice());

    server.stop().await;
}

#[tokio::test]
async fn auth_hook_rejects_the_upgrade() {
    let server = Server::new(ws_config());
    server.set_websocket_auth(Arc::new(|request| {
        request.headers().contains_key("x-fastnet-token")
    }));
    server.start().await.expect("server should start");
    let addr = server.ws_bound_addr().expect("ws listener should be bound");

    let result = connect_async(format!("ws://{addr}")).await;
    assert!(result.is_err(), "upgrade without the token must fail");

    server.stop().await;
}
