//! Socket creation helpers.
//!
//! Both helpers set `SO_REUSEADDR` before binding; tokio sockets are
//! non-blocking from the start.

use tokio::net::{TcpListener, TcpSocket};

use crate::addr::{HostAddress, SocketAddress};
use crate::error::NetError;

/// Creates a socket bound to `addr`, for outbound use.
///
/// Port 0 binds an ephemeral port, which is how the balancer opens
/// interface-bound sockets.
pub fn bound_socket(addr: SocketAddress) -> Result<TcpSocket, NetError> {
    let socket = match addr.host {
        HostAddress::V4(_) => TcpSocket::new_v4()?,
        HostAddress::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket
        .bind(addr.into())
        .map_err(|e| NetError::Generic(format!("bind to {addr} failed: {e}")))?;
    Ok(socket)
}

/// Creates a listening socket bound to `addr`.
pub fn listener(addr: SocketAddress) -> Result<TcpListener, NetError> {
    let socket = bound_socket(addr)?;
    socket
        .listen(1024)
        .map_err(|e| NetError::Generic(format!("listen on {addr} failed: {e}")))
}
