//! Canonical error types for the crate.
//!
//! Registration failures surface at startup and are returned to the caller;
//! frame and transport failures occur while serving and are logged and
//! contained to the offending connection.

use std::io;

use thiserror::Error;

/// Errors raised while wiring routes, groups, or interceptors.
///
/// These are configuration mistakes. They are returned rather than panicking
/// so embedding applications decide whether startup should abort.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistrationError {
    /// A handler for the message id was already registered.
    #[error("duplicate api: message id {0} is already registered")]
    DuplicateRoute(u32),
    /// A group registration fell outside the group's id range.
    #[error("message id {id} is outside the group range {start}..={end}")]
    OutOfRange { id: u32, start: u32, end: u32 },
    /// The registration targets the router model the server is not running.
    #[error("server router model is {active:?}; use the matching registration call")]
    WrongRouterModel {
        /// Model the server was configured with.
        active: crate::config::RouterModel,
    },
}

impl PartialEq for RegistrationError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::DuplicateRoute(a), Self::DuplicateRoute(b)) => a == b,
            (
                Self::OutOfRange { id, start, end },
                Self::OutOfRange {
                    id: i,
                    start: s,
                    end: e,
                },
            ) => id == i && start == s && end == e,
            (Self::WrongRouterModel { active: a }, Self::WrongRouterModel { active: b }) => a == b,
            _ => false,
        }
    }
}

impl Eq for RegistrationError {}

/// Errors produced while extracting or decoding a frame.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FrameError {
    /// The declared frame length exceeds the decoder's maximum.
    #[error("frame length {length} exceeds maximum {max}")]
    TooLong { length: usize, max: usize },
    /// The frame layout is inconsistent with the decoder's descriptor.
    #[error("malformed frame: {0}")]
    Corrupt(&'static str),
    /// The frame checksum did not match its contents.
    #[error("crc mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch { expected: u16, actual: u16 },
}

/// Errors produced when sending a message to a peer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SendError {
    /// The connection is closed or closing.
    #[error("connection {0} is closed")]
    Closed(u64),
    /// The payload exceeds the configured maximum packet size.
    #[error("payload of {size} bytes exceeds max packet size {max}")]
    Oversize { size: usize, max: usize },
    /// Writing to the transport failed.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised while starting or running the server.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServerError {
    /// Binding a listener failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    /// A registration performed through the server surface failed.
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    /// An I/O failure outside a single connection's scope.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
