//! Bind-mode affinity: one worker slot per connection, accept back-off at
//! capacity, and slot recycling after close.

mod common;

use std::sync::{Arc, Mutex};

use fastnet::{ServerConfig, WorkerMode, server::Server};

use common::{connect, local_config, start, wait_until};

fn bind_config(max_conn: usize) -> ServerConfig {
    ServerConfig {
        worker_mode: WorkerMode::Bind,
        max_conn,
        heartbeat_max: 60,
        ..local_config()
    }
}

#[tokio::test]
async fn full_capacity_defers_accepts_until_a_slot_frees() {
    let workers = Arc::new(Mutex::new(Vec::new()));
    let server = Server::new(bind_config(2));
    let workers2 = Arc::clone(&workers);
    server.set_on_conn_start(Arc::new(move |conn| {
        workers2.lock().expect("worker log").push(conn.worker_id());
    }));
    let addr = start(&server).await;

    let first = connect(addr).await;
    let _second = connect(addr).await;
    let workers2 = Arc::clone(&workers);
    assert!(wait_until(move || workers2.lock().expect("worker log").len() == 2).await);
    {
        let mut seen = workers.lock().expect("worker log").clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1]);
    }

    // The third connection completes the TCP handshake in the backlog but
    // is not served while the server is at capacity.
    let _third = connect(addr).await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(workers.lock().expect("worker log").len(), 2);

    // Closing the first frees its worker id for the deferred accept.
    let freed = workers.lock().expect("worker log")[0];
    drop(first);
    let workers2 = Arc::clone(&workers);
    assert!(wait_until(move || workers2.lock().expect("worker log").len() == 3).await);
    assert_eq!(workers.lock().expect("worker log")[2], freed);

    server.stop().await;
}
