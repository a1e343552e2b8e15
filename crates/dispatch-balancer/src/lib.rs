//! Outbound interface registry and load balancing.
//!
//! Interfaces are local source addresses with an integer weight (metric).
//! Each family has its own min-heap keyed by the load factor
//! `use_count / metric`; picking and releasing an interface are both
//! O(log n). A reservation is a guard value whose drop releases the
//! interface, so no failure path can leak a use count.

mod heap;

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::TcpSocket;
use tracing::debug;

use dispatch_net::{
    HostAddress, NetError, NetworkType, SocketAddress, bound_socket, parse_iface_spec,
};

use heap::IfaceHeap;

/// A configured outbound interface.
///
/// `use_count` equals the number of live outbound sockets bound to this
/// interface, connecting or established.
#[derive(Debug)]
pub struct Interface {
    addr: HostAddress,
    metric: u16,
    use_count: AtomicU32,
    heap_index: AtomicUsize,
}

impl Interface {
    pub fn addr(&self) -> HostAddress {
        self.addr
    }

    pub fn metric(&self) -> u16 {
        self.metric
    }

    pub fn use_count(&self) -> u32 {
        self.use_count.load(Ordering::Relaxed)
    }

    /// Comparison key for the heaps.
    fn load(&self) -> f64 {
        f64::from(self.use_count()) / f64::from(self.metric)
    }

    fn heap_index(&self) -> usize {
        self.heap_index.load(Ordering::Relaxed)
    }

    fn set_heap_index(&self, idx: usize) {
        self.heap_index.store(idx, Ordering::Relaxed);
    }
}

pub type InterfaceRef = Arc<Interface>;

#[derive(Debug)]
struct BalancerInner {
    v4: IfaceHeap,
    v6: IfaceHeap,
    types: NetworkType,
}

impl BalancerInner {
    fn heap_mut(&mut self, family: NetworkType) -> &mut IfaceHeap {
        if family == NetworkType::INET {
            &mut self.v4
        } else {
            &mut self.v6
        }
    }
}

/// The interface balancer. Cheap to clone; all clones share state.
#[derive(Clone, Debug)]
pub struct Balancer {
    inner: Arc<Mutex<BalancerInner>>,
}

impl Balancer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BalancerInner {
                v4: IfaceHeap::default(),
                v6: IfaceHeap::default(),
                types: NetworkType::empty(),
            })),
        }
    }

    /// Registers an outbound interface. Metric defaults to 1 and is
    /// clamped to at least 1.
    pub fn add(&self, addr: HostAddress, metric: Option<u16>) -> InterfaceRef {
        let metric = metric.unwrap_or(1).max(1);
        let iface = Arc::new(Interface {
            addr,
            metric,
            use_count: AtomicU32::new(0),
            heap_index: AtomicUsize::new(0),
        });

        let mut inner = self.inner.lock().unwrap();
        let family = addr.network_type();
        inner.heap_mut(family).insert(iface.clone());
        inner.types |= family;

        debug!("registered interface {addr} with metric {metric}");
        iface
    }

    /// Registers an interface from an `ADDR[@METRIC]` spec string.
    pub fn add_from_spec(&self, spec: &str) -> Result<InterfaceRef, NetError> {
        let (addr, metric) = parse_iface_spec(spec)?;
        Ok(self.add(addr, metric))
    }

    /// The OR of families of registered interfaces.
    pub fn available_types(&self) -> NetworkType {
        self.inner.lock().unwrap().types
    }

    /// Picks the least-loaded interface among the families in `types` and
    /// binds a fresh outbound socket to it with an ephemeral port.
    ///
    /// The use count is credited only after the bind succeeds, and is
    /// released when the returned guard drops.
    pub fn open_iface(&self, types: NetworkType) -> Result<(IfaceGuard, TcpSocket), NetError> {
        let mut inner = self.inner.lock().unwrap();

        let mut family = None;
        let mut best = f64::INFINITY;
        for candidate in [NetworkType::INET, NetworkType::INET6] {
            if !types.contains(candidate) {
                continue;
            }
            if let Some(root) = inner.heap_mut(candidate).root() {
                let root_load = root.load();
                if root_load < best {
                    best = root_load;
                    family = Some(candidate);
                }
            }
        }
        let Some(family) = family else {
            return Err(NetError::NoIface);
        };

        let heap = inner.heap_mut(family);
        let Some(iface) = heap.root().cloned() else {
            return Err(NetError::NoIface);
        };

        let socket = bound_socket(SocketAddress::new(iface.addr(), 0))?;

        iface.use_count.fetch_add(1, Ordering::Relaxed);
        heap.shift_down(iface.heap_index());

        Ok((
            IfaceGuard {
                balancer: self.clone(),
                iface,
            },
            socket,
        ))
    }

    /// Drops every registered interface.
    ///
    /// Guards released afterwards only decrement their interface's
    /// use count; the heaps are already gone.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.v4.clear();
        inner.v6.clear();
        inner.types = NetworkType::empty();
    }

    fn release(&self, iface: &InterfaceRef) {
        let mut inner = self.inner.lock().unwrap();
        iface.use_count.fetch_sub(1, Ordering::Relaxed);

        let heap = inner.heap_mut(iface.addr().network_type());
        let idx = iface.heap_index();
        if heap.get(idx).is_some_and(|e| Arc::ptr_eq(e, iface)) {
            heap.shift_up(idx);
        }
    }

    #[cfg(test)]
    fn assert_heap_invariant(&self) {
        let inner = self.inner.lock().unwrap();
        inner.v4.assert_invariant();
        inner.v6.assert_invariant();
    }
}

impl Default for Balancer {
    fn default() -> Self {
        Self::new()
    }
}

/// A live interface reservation.
///
/// Dropping the guard decrements the interface's use count and restores
/// the heap ordering.
#[derive(Debug)]
pub struct IfaceGuard {
    balancer: Balancer,
    iface: InterfaceRef,
}

impl IfaceGuard {
    pub fn interface(&self) -> &InterfaceRef {
        &self.iface
    }
}

impl Drop for IfaceGuard {
    fn drop(&mut self) {
        self.balancer.release(&self.iface);
    }
}
