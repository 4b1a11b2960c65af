//! Public API for the `fastnet` library.
//!
//! `fastnet` is a lightweight server framework for long-lived TCP and
//! WebSocket connections carrying framed binary messages. Every inbound
//! frame flows through an interceptor chain (decoder first, dispatcher
//! last) onto a bounded worker pool, which routes it to user handlers via
//! one of two dispatch models: classic three-phase routers or
//! middleware-style handler slices with grouping.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use fastnet::{
//!     config::ServerConfig,
//!     request::Request,
//!     router::Router,
//!     server::Server,
//! };
//!
//! struct PingRouter;
//!
//! impl Router for PingRouter {
//!     fn handle(&self, request: &mut Request) {
//!         let Some(conn) = request.connection() else { return };
//!         let data = request.data().clone();
//!         tokio::spawn(async move {
//!             let _ = conn.send_msg(1, data).await;
//!         });
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::new(ServerConfig::load_default()?);
//!     server.add_router(1, Arc::new(PingRouter))?;
//!     server.serve().await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod heartbeat;
pub mod interceptor;
pub mod message;
pub mod packet;
pub mod panic;
pub mod prelude;
pub mod request;
pub mod router;
pub mod server;

pub use codec::{FrameDecoder, FrameExtractor, HtlvCrcDecoder, LengthField, TlvDecoder};
pub use config::{RouterModel, ServerConfig, ServerMode, WorkerMode};
pub use connection::{Connection, ConnectionHook, manager::ConnectionManager};
pub use dispatch::MessageHandler;
pub use error::{FrameError, RegistrationError, SendError, ServerError};
pub use heartbeat::{HEARTBEAT_DEFAULT_MSG_ID, Heartbeat, HeartbeatOptions};
pub use interceptor::{Chain, IcResponse, Interceptor};
pub use message::Message;
pub use packet::{LtvPacker, Packer, TlvPacker};
pub use request::{HandleStep, Request, RouterBinding};
pub use router::{GroupRouter, Router, RouterHandler, RouterSlices, handler};
pub use server::{Server, WebsocketAuth, WsUpgradeRequest};
