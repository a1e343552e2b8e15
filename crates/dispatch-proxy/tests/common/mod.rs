//! Scripted dialog harness for protocol tests.
//!
//! A script is a whitespace-separated byte play in dialogs: `l` starts a
//! new dialog, two lowercase hex digits append a byte, `k` appends a
//! wildcard byte (matches anything on read), and `p`..`z` splice in named
//! variable bytes (ports captured at bind time, usually).
//!
//! Two actors drive the two ends of a connection: the even-parity actor
//! writes dialogs 0, 2, 4, … and verifies the others byte-by-byte; the
//! odd-parity actor does the opposite. A server actor accepts one
//! connection before its script starts.

#![allow(dead_code)]

use std::collections::HashMap;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use dispatch_net::SocketAddress;
use dispatch_proxy::Runtime;

#[derive(Clone)]
pub struct Dialog {
    pub data: Vec<u8>,
    pub mask: Vec<bool>,
}

#[derive(Clone)]
pub struct Script {
    pub dialogs: Vec<Dialog>,
}

impl Script {
    pub fn parse(src: &str) -> Script {
        Script::parse_with(src, &HashMap::new())
    }

    pub fn parse_with(src: &str, vars: &HashMap<char, Vec<u8>>) -> Script {
        fn push(dialogs: &mut Vec<Dialog>, byte: u8, wildcard: bool) {
            let dialog = dialogs
                .last_mut()
                .expect("script bytes must follow an 'l'");
            dialog.data.push(byte);
            dialog.mask.push(wildcard);
        }

        let mut dialogs: Vec<Dialog> = Vec::new();
        let mut chars = src.chars();

        while let Some(c) = chars.next() {
            match c {
                'l' => dialogs.push(Dialog {
                    data: Vec::new(),
                    mask: Vec::new(),
                }),
                'k' => push(&mut dialogs, 0, true),
                'p'..='z' => {
                    let bytes = vars
                        .get(&c)
                        .unwrap_or_else(|| panic!("script variable {c:?} is not set"));
                    for &b in bytes {
                        push(&mut dialogs, b, false);
                    }
                }
                '0'..='9' | 'a'..='f' => {
                    let hi = c.to_digit(16).expect("checked hex digit");
                    let lo = chars
                        .next()
                        .and_then(|c2| c2.to_digit(16))
                        .expect("a second hex digit must follow");
                    push(&mut dialogs, (hi * 16 + lo) as u8, false);
                }
                c if c.is_whitespace() => {}
                c => panic!("unexpected script character {c:?}"),
            }
        }

        Script { dialogs }
    }

    /// The tail of the play starting at dialog `n`, which is what the far
    /// end of a proxied conversation sees.
    pub fn from_dialog(&self, n: usize) -> Script {
        Script {
            dialogs: self.dialogs[n..].to_vec(),
        }
    }
}

pub struct Actor {
    task: JoinHandle<()>,
}

impl Actor {
    /// Connects to `addr` and plays `script` with even parity (writes
    /// dialog 0 first).
    pub fn client(runtime: &Runtime, addr: SocketAddress, script: Script) -> Actor {
        let hold = runtime.hold();
        let task = tokio::spawn(async move {
            let stream = TcpStream::connect(std::net::SocketAddr::from(addr))
                .await
                .expect("actor should connect");
            run_script(stream, script, false).await;
            drop(hold);
        });
        Actor { task }
    }

    /// Accepts one connection on `listener` and plays `script` with odd
    /// parity (reads dialog 0 first).
    pub fn server(runtime: &Runtime, listener: TcpListener, script: Script) -> Actor {
        let hold = runtime.hold();
        let task = tokio::spawn(async move {
            let (stream, _peer) = listener.accept().await.expect("actor should accept");
            run_script(stream, script, true).await;
            drop(hold);
        });
        Actor { task }
    }

    pub async fn finish(self) {
        self.task.await.expect("actor script should complete");
    }
}

async fn run_script(mut stream: TcpStream, script: Script, odd: bool) {
    for (i, dialog) in script.dialogs.iter().enumerate() {
        let writes = (i % 2 == 1) == odd;
        if writes {
            stream
                .write_all(&dialog.data)
                .await
                .unwrap_or_else(|e| panic!("write failed in dialog {i}: {e}"));
        } else {
            let mut buf = vec![0u8; dialog.data.len()];
            stream
                .read_exact(&mut buf)
                .await
                .unwrap_or_else(|e| panic!("read failed in dialog {i}: {e}"));
            for (j, (&got, &want)) in buf.iter().zip(&dialog.data).enumerate() {
                if !dialog.mask[j] {
                    assert_eq!(got, want, "incorrect byte {j} in dialog {i}");
                }
            }
        }
    }
}

/// A bound listener plus its address, for tests that need the port before
/// anything listens on it for real.
pub fn open_listener() -> (TcpListener, SocketAddress) {
    let listener = dispatch_net::listener("127.0.0.1:0".parse().unwrap())
        .expect("test listener should bind");
    let addr = listener
        .local_addr()
        .expect("listener should have an address")
        .into();
    (listener, addr)
}

/// The two-byte network-order port of `addr`, for splicing into scripts.
pub fn port_bytes(addr: SocketAddress) -> Vec<u8> {
    addr.port.to_be_bytes().to_vec()
}
