//! Listening server.
//!
//! Accepts client connections on a bound address and creates one session
//! per connection. The accept loop holds the runtime alive; sessions are
//! recycled when they report Closed.

use std::io;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use dispatch_net::{NetError, SocketAddress, listener};

use crate::runtime::{HoldGuard, Runtime};
use crate::session::Session;

const DEFAULT_PORT: u16 = 1080;

/// A listening SOCKS5 endpoint.
pub struct Server {
    local_addr: SocketAddress,
    task: JoinHandle<()>,
}

impl Server {
    /// Parses `bind_str` and starts listening. A zero port falls back to
    /// the default SOCKS port.
    pub fn bind(runtime: &Runtime, bind_str: &str) -> Result<Server, NetError> {
        let mut addr: SocketAddress = bind_str.parse()?;
        if addr.port == 0 {
            addr.port = DEFAULT_PORT;
        }
        let listener = listener(addr)?;
        Self::start(runtime, listener, false)
    }

    /// Wraps an already-bound listener and releases the runtime hold after
    /// the first session closes, so test runtimes drain naturally.
    pub fn bind_test(runtime: &Runtime, listener: TcpListener) -> Result<Server, NetError> {
        Self::start(runtime, listener, true)
    }

    fn start(runtime: &Runtime, listener: TcpListener, test_mode: bool) -> Result<Server, NetError> {
        let local_addr: SocketAddress = listener.local_addr()?.into();
        info!("listening on {local_addr}");

        // The hold must be taken here, not in the accept loop: the loop may
        // not have been polled yet when the caller reaches idle()
        let hold = runtime.hold();
        let runtime = runtime.clone();
        let task = tokio::spawn(accept_loop(runtime, listener, hold, test_mode));

        Ok(Server { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddress {
        self.local_addr
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn accept_error_is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

async fn accept_loop(runtime: Runtime, listener: TcpListener, hold: HoldGuard, test_mode: bool) {
    let mut hold = Some(hold);
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("accepted connection from {peer}");
                    Session::spawn(&runtime, stream, closed_tx.clone());
                }
                Err(e) if accept_error_is_transient(&e) => {
                    debug!("transient accept error: {e}");
                }
                Err(e) => {
                    // The listener is unusable; give up on it
                    error!("accept failed: {e}");
                    break;
                }
            },
            Some(sid) = closed_rx.recv() => {
                debug!("session {sid} finished");
                if test_mode {
                    hold.take();
                }
            }
        }
    }

    drop(hold);
}
