//! Per-client SOCKS5 session.
//!
//! A session owns two lanes (client side and upstream side), each with a
//! socket and a relay buffer. It negotiates method selection, parses the
//! CONNECT request, drives the connector, emits the reply, and then relays
//! bytes both ways until either side closes. On shutdown the buffers are
//! drained to whichever sockets are still writable before anything is
//! closed, so a half-close never loses queued bytes.

use std::io;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use dispatch_balancer::IfaceGuard;
use dispatch_net::{HostAddress, NetError, SocketAddress};

use crate::buffer::LaneBuffer;
use crate::connector::{Connector, Established};
use crate::runtime::Runtime;
use crate::socks::{self, ReplyCode};

const CLIENT: usize = 0;
const REMOTE: usize = 1;

/// Cap on the final drain, in case a peer never reads its last bytes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

fn lane_name(idx: usize) -> &'static str {
    if idx == CLIENT { "client" } else { "remote" }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Auth,
    Request,
    Connecting,
    Connected,
    Shutdown,
    Closed,
}

struct Lane {
    stream: Option<TcpStream>,
    read_open: bool,
    buf: LaneBuffer,
}

impl Lane {
    fn new(stream: Option<TcpStream>) -> Self {
        let read_open = stream.is_some();
        Self {
            stream,
            read_open,
            buf: LaneBuffer::new(),
        }
    }
}

enum ConnectTarget {
    Addr(SocketAddress),
    Domain(String, u16),
}

enum IoStep {
    Progress,
    Retry,
    Eof,
}

fn read_step(stream: &TcpStream, buf: &mut LaneBuffer) -> Result<IoStep, NetError> {
    match stream.try_read(buf.spare()) {
        Ok(0) => Ok(IoStep::Eof),
        Ok(n) => {
            buf.commit(n);
            Ok(IoStep::Progress)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(IoStep::Retry),
        Err(e) => Err(e.into()),
    }
}

fn write_step(stream: &TcpStream, buf: &mut LaneBuffer) -> Result<IoStep, NetError> {
    match stream.try_write(buf.readable()) {
        Ok(0) => Ok(IoStep::Eof),
        Ok(n) => {
            buf.advance(n);
            Ok(IoStep::Progress)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(IoStep::Retry),
        Err(e) => Err(e.into()),
    }
}

async fn writable_opt(stream: Option<&TcpStream>) -> io::Result<()> {
    match stream {
        Some(s) => s.writable().await,
        None => std::future::pending().await,
    }
}

pub(crate) struct Session {
    runtime: Runtime,
    sid: u64,
    state: State,
    lanes: [Lane; 2],
    iface: Option<IfaceGuard>,
}

impl Session {
    /// Spawns a session task for an accepted client socket. The session id
    /// is sent on `closed_tx` once the session reaches Closed.
    pub(crate) fn spawn(
        runtime: &Runtime,
        stream: TcpStream,
        closed_tx: mpsc::UnboundedSender<u64>,
    ) -> u64 {
        let sid = runtime.next_sid();
        // Count toward runtime liveness from creation, not from first poll
        let hold = runtime.hold();
        let runtime = runtime.clone();
        tokio::spawn(async move {
            let session = Session {
                runtime: runtime.clone(),
                sid,
                state: State::Auth,
                lanes: [Lane::new(Some(stream)), Lane::new(None)],
                iface: None,
            };
            session.run().await;
            drop(hold);
            let _ = closed_tx.send(sid);
        });
        sid
    }

    async fn run(mut self) {
        info!("Session {}: created", self.sid);

        if let Some(target) = self.negotiate().await {
            self.state = State::Connecting;
            self.connect(target).await;
        }
        if self.state == State::Connected {
            self.relay().await;
        }

        self.state = State::Shutdown;
        if tokio::time::timeout(DRAIN_TIMEOUT, self.drain()).await.is_err() {
            debug!("Session {}: drain timed out", self.sid);
        }

        // Releases the interface reservation; the sockets close with us
        self.iface.take();
        self.state = State::Closed;

        info!("Session {}: closed", self.sid);
    }

    /// Drives AUTH and REQUEST until a CONNECT target is dispatched.
    /// Returns None when the session is already headed for shutdown (the
    /// error reply, if any, is queued).
    async fn negotiate(&mut self) -> Option<ConnectTarget> {
        loop {
            match self.advance_protocol() {
                Ok(Some(target)) => return Some(target),
                Ok(None) => {}
                Err(()) => return None,
            }

            let [client_lane, remote_lane] = &mut self.lanes;
            let client = client_lane.stream.as_ref()?;
            let want_read = client_lane.read_open && client_lane.buf.has_room();
            let want_write = !remote_lane.buf.is_empty();
            if !want_read && !want_write {
                // Client stopped sending mid-handshake, or flooded the
                // buffer with an unparseable request.
                return None;
            }

            let (is_read, step) = tokio::select! {
                ready = client.readable(), if want_read => {
                    let step = ready
                        .map_err(NetError::from)
                        .and_then(|_| read_step(client, &mut client_lane.buf));
                    (true, step)
                }
                ready = client.writable(), if want_write => {
                    let step = ready
                        .map_err(NetError::from)
                        .and_then(|_| write_step(client, &mut remote_lane.buf));
                    (false, step)
                }
            };

            match step {
                Ok(IoStep::Progress) | Ok(IoStep::Retry) => {}
                Ok(IoStep::Eof) if is_read => {
                    self.lanes[CLIENT].read_open = false;
                }
                Ok(IoStep::Eof) => {
                    self.lanes[CLIENT].stream = None;
                    return None;
                }
                Err(e) => {
                    debug!("Session {}: client error: {e}", self.sid);
                    self.lanes[CLIENT].stream = None;
                    return None;
                }
            }
        }
    }

    /// Parses whatever is buffered. `Ok(None)` means more bytes are
    /// needed; `Err(())` means the session failed (reply queued if the
    /// protocol calls for one).
    fn advance_protocol(&mut self) -> Result<Option<ConnectTarget>, ()> {
        if self.state == State::Auth {
            let [client_lane, remote_lane] = &mut self.lanes;
            let Some(header) = client_lane.buf.peek(2) else {
                return Ok(None);
            };
            let version = header[0];
            let n_methods = header[1] as usize;
            if version != socks::VERSION {
                info!("Session {}: unsupported SOCKS version {version}", self.sid);
                return Err(());
            }
            let Some(hello) = client_lane.buf.peek(2 + n_methods) else {
                return Ok(None);
            };

            let selected = if hello[2..].contains(&socks::METHOD_NONE) {
                socks::METHOD_NONE
            } else {
                socks::METHOD_NO_ACCEPTABLE
            };
            remote_lane.buf.alloc(2).copy_from_slice(&[socks::VERSION, selected]);

            if selected == socks::METHOD_NO_ACCEPTABLE {
                info!("Session {}: no acceptable authentication method", self.sid);
                return Err(());
            }
            client_lane.buf.consume(2 + n_methods);
            self.state = State::Request;
            info!("Session {}: authenticated", self.sid);
        }

        if self.state == State::Request {
            let Some(header) = self.lanes[CLIENT].buf.peek(4) else {
                return Ok(None);
            };
            let (version, cmd, reserved, atyp) = (header[0], header[1], header[2], header[3]);

            if version != socks::VERSION || reserved != 0 {
                self.queue_socks_error(ReplyCode::General);
                return Err(());
            }
            if cmd != socks::CMD_CONNECT {
                self.queue_socks_error(ReplyCode::CommandNotSupported);
                return Err(());
            }

            match atyp {
                socks::ATYP_IPV4 => {
                    let Some(req) = self.lanes[CLIENT].buf.consume(4 + 4 + 2) else {
                        return Ok(None);
                    };
                    let mut octets = [0u8; 4];
                    octets.copy_from_slice(&req[4..8]);
                    let port = u16::from_be_bytes([req[8], req[9]]);
                    let addr = SocketAddress::new(HostAddress::V4(octets), port);
                    info!(
                        "Session {}: received request to connect to ipv4 address {addr}",
                        self.sid
                    );
                    return Ok(Some(ConnectTarget::Addr(addr)));
                }
                socks::ATYP_IPV6 => {
                    let Some(req) = self.lanes[CLIENT].buf.consume(4 + 16 + 2) else {
                        return Ok(None);
                    };
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&req[4..20]);
                    let port = u16::from_be_bytes([req[20], req[21]]);
                    let addr = SocketAddress::new(HostAddress::V6(octets), port);
                    info!(
                        "Session {}: received request to connect to ipv6 address {addr}",
                        self.sid
                    );
                    return Ok(Some(ConnectTarget::Addr(addr)));
                }
                socks::ATYP_DOMAIN => {
                    let Some(head) = self.lanes[CLIENT].buf.peek(5) else {
                        return Ok(None);
                    };
                    let domain_len = head[4] as usize;
                    let Some(req) = self.lanes[CLIENT].buf.consume(4 + 1 + domain_len + 2) else {
                        return Ok(None);
                    };
                    let name = String::from_utf8_lossy(&req[5..5 + domain_len]).into_owned();
                    let port = u16::from_be_bytes([req[5 + domain_len], req[6 + domain_len]]);
                    info!(
                        "Session {}: received request to connect to domain name \"{name}:{port}\"",
                        self.sid
                    );
                    return Ok(Some(ConnectTarget::Domain(name, port)));
                }
                _ => {
                    self.queue_socks_error(ReplyCode::AddrTypeNotSupported);
                    return Err(());
                }
            }
        }

        Ok(None)
    }

    /// Queues the 10-byte error reply (ATYP=1, zeroed address and port).
    fn queue_socks_error(&mut self, code: ReplyCode) {
        let reply = self.lanes[REMOTE].buf.alloc(10);
        reply.fill(0);
        reply[0] = socks::VERSION;
        reply[1] = code.as_u8();
        reply[3] = socks::ATYP_IPV4;
        info!("Session {}: SOCKS error code {code} sent", self.sid);
    }

    /// Runs the connector while keeping the client lane serviced. Ends in
    /// Connected on success, Shutdown otherwise.
    async fn connect(&mut self, target: ConnectTarget) {
        let mut connector = match &target {
            ConnectTarget::Addr(addr) => Connector::connect(&self.runtime, *addr),
            ConnectTarget::Domain(name, port) => {
                Connector::connect_dns(&self.runtime, name, *port)
            }
        };

        let outcome = {
            let result_fut = connector.result();
            tokio::pin!(result_fut);

            loop {
                let [client_lane, remote_lane] = &mut self.lanes;
                let Some(client) = client_lane.stream.as_ref() else {
                    break None;
                };
                let want_read = client_lane.read_open && client_lane.buf.has_room();
                let want_write = !remote_lane.buf.is_empty();

                let (is_read, step) = tokio::select! {
                    outcome = &mut result_fut => break Some(outcome),
                    ready = client.readable(), if want_read => {
                        let step = ready
                            .map_err(NetError::from)
                            .and_then(|_| read_step(client, &mut client_lane.buf));
                        (true, step)
                    }
                    ready = client.writable(), if want_write => {
                        let step = ready
                            .map_err(NetError::from)
                            .and_then(|_| write_step(client, &mut remote_lane.buf));
                        (false, step)
                    }
                };

                match step {
                    Ok(IoStep::Progress) | Ok(IoStep::Retry) => {}
                    Ok(IoStep::Eof) if is_read => {
                        // Client went away while we were connecting
                        debug!("Session {}: client closed while connecting", self.sid);
                        self.lanes[CLIENT].read_open = false;
                        break None;
                    }
                    Ok(IoStep::Eof) => {
                        self.lanes[CLIENT].stream = None;
                        break None;
                    }
                    Err(e) => {
                        debug!("Session {}: client error: {e}", self.sid);
                        self.lanes[CLIENT].stream = None;
                        break None;
                    }
                }
            }
        };

        match outcome {
            // Client died; dropping the connector cancels the attempt
            None => self.state = State::Shutdown,
            Some(Ok(established)) => self.finish_connect(established),
            Some(Err(e)) => {
                info!("Session {}: connect failed: {e}", self.sid);
                self.queue_socks_error(socks::reply_from_error(&e));
                self.state = State::Shutdown;
            }
        }
    }

    /// Installs the upstream socket and queues the success reply carrying
    /// the bound source address.
    fn finish_connect(&mut self, established: Established) {
        let bound: SocketAddress = match established.stream.local_addr() {
            Ok(addr) => addr.into(),
            Err(e) => {
                warn!("Session {}: getsockname failed: {e}", self.sid);
                self.queue_socks_error(ReplyCode::General);
                self.state = State::Shutdown;
                return;
            }
        };
        info!(
            "Session {}: connection established, bound address {bound}",
            self.sid
        );

        match bound.host {
            HostAddress::V4(octets) => {
                let reply = self.lanes[REMOTE].buf.alloc(10);
                reply[0] = socks::VERSION;
                reply[1] = ReplyCode::Success.as_u8();
                reply[2] = 0;
                reply[3] = socks::ATYP_IPV4;
                reply[4..8].copy_from_slice(&octets);
                reply[8..10].copy_from_slice(&bound.port.to_be_bytes());
            }
            HostAddress::V6(octets) => {
                let reply = self.lanes[REMOTE].buf.alloc(22);
                reply[0] = socks::VERSION;
                reply[1] = ReplyCode::Success.as_u8();
                reply[2] = 0;
                reply[3] = socks::ATYP_IPV6;
                reply[4..20].copy_from_slice(&octets);
                reply[20..22].copy_from_slice(&bound.port.to_be_bytes());
            }
        }

        self.lanes[REMOTE].stream = Some(established.stream);
        self.lanes[REMOTE].read_open = true;
        self.iface = Some(established.iface);
        self.state = State::Connected;
    }

    /// Full-duplex relay. Returns once either lane dies, leaving the
    /// session in Shutdown for the final drain.
    async fn relay(&mut self) {
        loop {
            let [client_lane, remote_lane] = &mut self.lanes;
            let (Some(client), Some(remote)) =
                (client_lane.stream.as_ref(), remote_lane.stream.as_ref())
            else {
                break;
            };

            let client_read = client_lane.read_open && client_lane.buf.has_room();
            let remote_read = remote_lane.read_open && remote_lane.buf.has_room();
            let client_write = !remote_lane.buf.is_empty();
            let remote_write = !client_lane.buf.is_empty();

            let (is_read, idx, step) = tokio::select! {
                ready = client.readable(), if client_read => {
                    let step = ready
                        .map_err(NetError::from)
                        .and_then(|_| read_step(client, &mut client_lane.buf));
                    (true, CLIENT, step)
                }
                ready = remote.readable(), if remote_read => {
                    let step = ready
                        .map_err(NetError::from)
                        .and_then(|_| read_step(remote, &mut remote_lane.buf));
                    (true, REMOTE, step)
                }
                ready = client.writable(), if client_write => {
                    let step = ready
                        .map_err(NetError::from)
                        .and_then(|_| write_step(client, &mut remote_lane.buf));
                    (false, CLIENT, step)
                }
                ready = remote.writable(), if remote_write => {
                    let step = ready
                        .map_err(NetError::from)
                        .and_then(|_| write_step(remote, &mut client_lane.buf));
                    (false, REMOTE, step)
                }
            };

            match step {
                Ok(IoStep::Progress) | Ok(IoStep::Retry) => {}
                Ok(IoStep::Eof) if is_read => {
                    debug!("Session {}: {} closed by peer", self.sid, lane_name(idx));
                    self.lanes[idx].read_open = false;
                    break;
                }
                Ok(IoStep::Eof) => {
                    self.lanes[idx].stream = None;
                    break;
                }
                Err(e) => {
                    debug!("Session {}: {} error: {e}", self.sid, lane_name(idx));
                    self.lanes[idx].stream = None;
                    break;
                }
            }
        }

        self.state = State::Shutdown;
    }

    /// Writes out whatever is still buffered to the lanes that can take
    /// it, then lets the sockets close.
    async fn drain(&mut self) {
        loop {
            let [client_lane, remote_lane] = &mut self.lanes;
            let client = client_lane.stream.as_ref();
            let remote = remote_lane.stream.as_ref();
            let client_pending = client.is_some() && !remote_lane.buf.is_empty();
            let remote_pending = remote.is_some() && !client_lane.buf.is_empty();
            if !client_pending && !remote_pending {
                break;
            }

            let (idx, step) = tokio::select! {
                ready = writable_opt(client), if client_pending => {
                    let step = ready.map_err(NetError::from).and_then(|_| match client {
                        Some(s) => write_step(s, &mut remote_lane.buf),
                        None => Ok(IoStep::Retry),
                    });
                    (CLIENT, step)
                }
                ready = writable_opt(remote), if remote_pending => {
                    let step = ready.map_err(NetError::from).and_then(|_| match remote {
                        Some(s) => write_step(s, &mut client_lane.buf),
                        None => Ok(IoStep::Retry),
                    });
                    (REMOTE, step)
                }
            };

            match step {
                Ok(IoStep::Progress) | Ok(IoStep::Retry) => {}
                Ok(IoStep::Eof) | Err(_) => {
                    self.lanes[idx].stream = None;
                }
            }
        }
    }
}
