//! TCP accept loop with exponential back-off.

use std::sync::Arc;

use tokio::{net::TcpListener, time::Duration};

use super::Server;
use crate::connection::transport;

/// Delay applied when accepting fails or the server is at capacity.
///
/// Doubles on every wait up to a ceiling and resets after a successful
/// accept.
#[derive(Debug)]
pub(crate) struct AcceptDelay {
    delay: Duration,
    initial: Duration,
    max: Duration,
}

impl AcceptDelay {
    const INITIAL: Duration = Duration::from_millis(5);
    const MAX: Duration = Duration::from_secs(1);

    pub(crate) fn new() -> Self {
        Self {
            delay: Self::INITIAL,
            initial: Self::INITIAL,
            max: Self::MAX,
        }
    }

    /// Current delay, for logging.
    pub(crate) fn current(&self) -> Duration { self.delay }

    /// Sleep for the current delay, then double it up to the ceiling.
    pub(crate) async fn wait(&mut self) {
        tokio::time::sleep(self.delay).await;
        self.delay = (self.delay * 2).min(self.max);
    }

    /// Back to the initial delay after a successful accept.
    pub(crate) fn reset(&mut self) { self.delay = self.initial; }
}

/// Accept TCP connections until the server shuts down.
///
/// On reaching `max_conn` the loop backs off instead of accepting, so
/// pending peers wait in the listen queue rather than being turned away.
pub(crate) async fn tcp_accept_loop(server: Arc<Server>, listener: TcpListener) {
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
                    let local = stream.local_addr().unwrap_or(peer);
                    let (reader, writer) = transport::split_tcp(stream);
                    server.start_conn(reader, writer, peer, local, false);
                }
                Err(err) => {
                    log::error!("accept error: {err}");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = delay.wait() => {}
                    }
                }
            }
        }
    }
    log::info!("tcp listener stopped");
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn delay_doubles_to_a_ceiling_and_resets() {
        let mut delay = AcceptDelay::new();
        assert_eq!(delay.current(), Duration::from_millis(5));

        for _ in 0..12 {
            delay.wait().await;
        }
        assert_eq!(delay.current(), Duration::from_secs(1));

        delay.reset();
        assert_eq!(delay.current(), Duration::from_millis(5));
    }
}
