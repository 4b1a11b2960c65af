//! Convenient single-import surface for applications.
//!
//! ```
//! use fastnet::prelude::*;
//! ```

pub use crate::{
    codec::{FrameDecoder, HtlvCrcDecoder, LengthField, TlvDecoder},
    config::{RouterModel, ServerConfig, ServerMode, WorkerMode},
    connection::Connection,
    error::{FrameError, RegistrationError, SendError, ServerError},
    heartbeat::{Heartbeat, HeartbeatOptions},
    interceptor::{Chain, IcResponse, Interceptor},
    message::Message,
    request::{HandleStep, Request},
    router::{Router, RouterHandler, handler},
    server::Server,
};
