//! Error types raised by connection setup and by an established connection.

use std::io;

use crate::protocol::CatalogueError;

/// Failure establishing a connection to a compositor.
#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
    /// `XDG_RUNTIME_DIR` was not set and no socket/fd was supplied explicitly.
    #[error("XDG_RUNTIME_DIR is not set")]
    NoRuntimeDir,
    /// `WAYLAND_SOCKET` was set but did not contain a valid fd number.
    #[error("WAYLAND_SOCKET was set but contained garbage")]
    InvalidFd,
    /// The socket could not be opened or connected.
    #[error("could not connect to the compositor socket: {0}")]
    Io(#[source] io::Error),
}

/// Failure occurring on an established connection.
#[derive(thiserror::Error, Debug)]
pub enum WireError {
    /// The server closed the connection (`recv` returned zero bytes).
    #[error("the compositor disconnected")]
    ServerDisconnected,
    /// A frame could not be decoded (bad length, missing fd, truncated argument).
    #[error("malformed message on the wire: {0}")]
    ProtocolDecode(#[from] crate::wire::MessageParseError),
    /// An event referenced an object id absent from the registry.
    #[error("event received for unknown object {0}")]
    UnknownObject(u32),
    /// The server raised `wl_display.error`.
    #[error("fatal protocol error on object {object_id} (code {code}): {message}")]
    Display {
        /// Object id the error refers to (0 if the object itself was unknown).
        object_id: u32,
        /// The offending object itself, if the client has ever seen it
        /// registered (spec.md §9: the marker preserves the event's
        /// `(object_proxy, code, message)` arguments verbatim).
        object: Option<crate::proxy::Proxy>,
        /// Numeric error code, interface-defined.
        code: u32,
        /// Human readable message from the server.
        message: String,
        /// Symbolic name of `code`, if the offending object's interface
        /// declares an `error` enum covering it (spec.md §7).
        code_name: Option<String>,
    },
    /// A request argument that must not be null was null.
    #[error("null passed for a non-nullable object argument")]
    NullArgument,
    /// A request was invoked on a proxy whose id has already been freed.
    #[error("request invoked on a deleted proxy")]
    DeletedProxy,
    /// Loading a child protocol would have redefined an interface the parent already has.
    #[error("interface {0} is already defined in the parent protocol")]
    DuplicateInterface(String),
    /// Underlying I/O error from the socket (other than would-block, which is not an error).
    #[error("I/O error on the wayland socket: {0}")]
    Io(#[source] io::Error),
    /// Failure parsing protocol XML.
    #[error("protocol catalogue error: {0}")]
    Catalogue(#[from] CatalogueError),
}

impl From<nix::Error> for WireError {
    fn from(e: nix::Error) -> Self {
        WireError::Io(io::Error::from(e))
    }
}
