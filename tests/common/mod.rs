//! Shared helpers for integration tests: a minimal TLV client and server
//! construction shortcuts.
#![allow(dead_code)] // not every test binary uses every helper

use std::{net::SocketAddr, sync::Arc, time::Duration};

use fastnet::{ServerConfig, ServerMode, server::Server};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

/// Configuration bound to an ephemeral local port, TCP only.
#[must_use]
pub fn local_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_owned(),
        tcp_port: 0,
        ws_port: 0,
        mode: ServerMode::Tcp,
        worker_pool_size: 4,
        max_worker_task_len: 64,
        ..ServerConfig::default()
    }
}

/// Start `server` and return the bound TCP address.
pub async fn start(server: &Arc<Server>) -> SocketAddr {
    server.start().await.expect("server should start");
    server.tcp_bound_addr().expect("tcp listener should be bound")
}

/// Connect a raw TCP client.
pub async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.expect("client should connect")
}

/// Write one TLV frame: `id(4, BE) | len(4, BE) | payload`.
pub async fn send_frame(stream: &mut TcpStream, id: u32, payload: &[u8]) {
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&id.to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await.expect("client write");
}

/// Read one TLV frame back.
pub async fn read_frame(stream: &mut TcpStream) -> (u32, Vec<u8>) {
    let mut head = [0_u8; 8];
    stream.read_exact(&mut head).await.expect("frame head");
    let id = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
    let len = u32::from_be_bytes([head[4], head[5], head[6], head[7]]) as usize;
    let mut payload = vec![0_u8; len];
    stream.read_exact(&mut payload).await.expect("frame body");
    (id, payload)
}

/// Poll `predicate` until it holds or the deadline passes.
pub async fn wait_until(predicate: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    predicate()
}
