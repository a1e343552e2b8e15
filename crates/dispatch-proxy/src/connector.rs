//! Asynchronous outbound connector.
//!
//! Turns a SOCKS destination (one address, or a hostname to resolve) into
//! an established upstream connection, trying every candidate address in
//! order. Each attempt reserves an interface from the balancer for the
//! candidate's family and releases it again if the attempt fails.
//!
//! The attempt loop runs in its own task and reports through a one-shot
//! channel, so the result is delivered at most once and never on the same
//! turn that created the connector. Dropping the connector aborts the task
//! and releases any in-flight socket and reservation without delivering a
//! result.

use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use dispatch_balancer::IfaceGuard;
use dispatch_net::{NetError, SocketAddress};

use crate::runtime::Runtime;

/// A successfully established upstream connection, still holding its
/// interface reservation.
#[derive(Debug)]
pub struct Established {
    pub stream: TcpStream,
    pub iface: IfaceGuard,
}

pub type ConnectOutcome = Result<Established, NetError>;

enum Target {
    Addr(SocketAddress),
    Dns { name: String, port: u16 },
}

/// Handle to an in-flight connect. Dropping it cancels the work.
pub struct Connector {
    task: JoinHandle<()>,
    rx: oneshot::Receiver<ConnectOutcome>,
}

impl Connector {
    /// Connects to a known address.
    pub fn connect(runtime: &Runtime, addr: SocketAddress) -> Connector {
        Self::spawn(runtime.clone(), Target::Addr(addr))
    }

    /// Resolves `name` with the balancer's advertised families, then
    /// connects to the resulting addresses in order.
    pub fn connect_dns(runtime: &Runtime, name: &str, port: u16) -> Connector {
        Self::spawn(
            runtime.clone(),
            Target::Dns {
                name: name.to_owned(),
                port,
            },
        )
    }

    fn spawn(runtime: Runtime, target: Target) -> Connector {
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let _ = tx.send(run(runtime, target).await);
        });
        Connector { task, rx }
    }

    /// Waits for the terminal outcome. Resolves at most once.
    pub async fn result(&mut self) -> ConnectOutcome {
        match (&mut self.rx).await {
            Ok(outcome) => outcome,
            Err(_) => Err(NetError::Generic("connector task vanished".into())),
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(runtime: Runtime, target: Target) -> ConnectOutcome {
    let addrs = match target {
        Target::Addr(addr) => vec![addr],
        Target::Dns { name, port } => {
            let types = runtime.balancer().available_types();
            runtime.resolver().resolve(&name, port, types).await?
        }
    };
    try_each(&runtime, addrs).await
}

/// Tries every candidate in order; the first success wins, an exhausted
/// list yields the last recorded error.
async fn try_each(runtime: &Runtime, addrs: Vec<SocketAddress>) -> ConnectOutcome {
    let mut last_err = None;

    for addr in addrs {
        let (iface, socket) = match runtime.balancer().open_iface(addr.network_type()) {
            Ok(opened) => opened,
            Err(e) => {
                debug!("no interface for {addr}: {e}");
                last_err = Some(e);
                continue;
            }
        };

        match socket.connect(addr.into()).await {
            Ok(stream) => return Ok(Established { stream, iface }),
            Err(e) => {
                debug!("connect to {addr} failed: {e}");
                last_err = Some(e.into());
                // iface drops here, releasing the reservation
            }
        }
    }

    Err(last_err.unwrap_or(NetError::NoAddresses))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_balancer::Balancer;
    use dispatch_net::{NetworkType, listener};
    use std::time::Duration;

    fn test_runtime() -> Runtime {
        let balancer = Balancer::new();
        balancer.add("0.0.0.0".parse().unwrap(), None);
        Runtime::new(balancer)
    }

    fn local_listener() -> (tokio::net::TcpListener, SocketAddress) {
        let listener = listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap().into();
        (listener, addr)
    }

    /// Binds a listener and drops it so its port is (very likely) refused.
    fn refused_addr() -> SocketAddress {
        let (listener, addr) = local_listener();
        drop(listener);
        addr
    }

    #[tokio::test]
    async fn test_connect_success() {
        let runtime = test_runtime();
        let (listener, addr) = local_listener();

        let mut connector = Connector::connect(&runtime, addr);
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let established = connector.result().await.expect("should connect");
        assert_eq!(established.iface.interface().use_count(), 1);
        accept.await.unwrap();

        drop(established);
        let (iface, _socket) = runtime.balancer().open_iface(NetworkType::INET).unwrap();
        assert_eq!(iface.interface().use_count(), 1);
    }

    #[tokio::test]
    async fn test_no_work_before_first_yield() {
        let runtime = test_runtime();
        let (_listener, addr) = local_listener();

        let iface = {
            let (guard, _socket) = runtime.balancer().open_iface(NetworkType::INET).unwrap();
            let iface = guard.interface().clone();
            drop(guard);
            iface
        };

        let mut connector = Connector::connect(&runtime, addr);
        // The attempt task has not run yet; nothing is reserved.
        assert_eq!(iface.use_count(), 0);

        let _ = connector.result().await;
    }

    #[tokio::test]
    async fn test_refused_reports_last_error_and_releases() {
        let runtime = test_runtime();
        let addr = refused_addr();

        let mut connector = Connector::connect(&runtime, addr);
        let err = connector.result().await.expect_err("should be refused");
        assert!(matches!(err, NetError::ConnRefused));

        let (guard, _socket) = runtime.balancer().open_iface(NetworkType::INET).unwrap();
        assert_eq!(guard.interface().use_count(), 1);
    }

    #[tokio::test]
    async fn test_multi_address_fallback() {
        let runtime = test_runtime();
        let bad = refused_addr();
        let (listener, good) = local_listener();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let outcome = try_each(&runtime, vec![bad, good]).await;
        let established = outcome.expect("second address should succeed");
        assert_eq!(established.iface.interface().use_count(), 1);
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_list_keeps_last_error() {
        let runtime = test_runtime();
        let bad1 = refused_addr();
        let bad2 = refused_addr();

        let err = try_each(&runtime, vec![bad1, bad2])
            .await
            .expect_err("all addresses refused");
        assert!(matches!(err, NetError::ConnRefused));
    }

    #[tokio::test]
    async fn test_empty_list_is_no_addresses() {
        let runtime = test_runtime();
        let err = try_each(&runtime, Vec::new()).await.unwrap_err();
        assert!(matches!(err, NetError::NoAddresses));
    }

    #[tokio::test]
    async fn test_family_mismatch_is_no_iface() {
        // Only a v4 interface registered; a v6 destination finds nothing.
        let runtime = test_runtime();
        let err = try_each(&runtime, vec!["[::1]:9".parse().unwrap()])
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::NoIface));
    }

    #[tokio::test]
    async fn test_destroy_mid_flight_suppresses_and_releases() {
        let runtime = test_runtime();
        let (_listener, addr) = local_listener();

        let iface = {
            let (guard, _socket) = runtime.balancer().open_iface(NetworkType::INET).unwrap();
            let iface = guard.interface().clone();
            drop(guard);
            iface
        };

        let connector = Connector::connect(&runtime, addr);
        drop(connector);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(iface.use_count(), 0);
    }
}
