//! A pure-Rust, client-side Wayland wire protocol runtime.
//!
//! Connect to a compositor, load protocol XML into a runtime-built
//! [`Protocol`] catalogue, and drive requests/events through [`Proxy`]
//! handles — all without any compile-time code generation.

mod connection;
mod debug;
mod error;
mod protocol;
mod proxy;
mod queue;
mod registry;
mod wire;

pub use connection::Connection;
pub use error::{ConnectError, WireError};
pub use protocol::{Arg, CatalogueError, Enum, Event, Interface, Protocol, Request};
pub use proxy::{EventArg, OutArg, Proxy};
pub use queue::Queue;
pub use wire::{ArgumentType, Fixed};
