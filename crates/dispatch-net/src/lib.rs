//! Network primitives for dispatch-ng.
//!
//! - Host and socket address model with text parsing/formatting
//! - Stable error taxonomy shared by every layer above
//! - Bound outbound sockets and listeners (SO_REUSEADDR, ephemeral ports)
//! - Async DNS resolution filtered by address family

mod addr;
mod error;
mod resolver;
mod socket;

pub use addr::{HostAddress, NetworkType, SocketAddress, parse_iface_spec};
pub use error::NetError;
pub use resolver::Resolver;
pub use socket::{bound_socket, listener};
