//! End-to-end CONNECT to an IPv4 address through the proxy.

mod common;

use std::collections::HashMap;

use common::{Actor, Script, open_listener, port_bytes};

use dispatch_balancer::Balancer;
use dispatch_proxy::{Runtime, Server};

// Client side on the left of each exchange, echo server joins at dialog 4
const SCRIPT: &str = "
    l 05 01 00
    l 05 00
    l 05 01 00 01 7f 00 00 01 p
    l 05 00 00 01  k  k  k  k  k  k
    l 01
    l 01 02
";

#[tokio::test]
async fn test_socks5_connect_ipv4() {
    let balancer = Balancer::new();
    balancer.add_from_spec("0.0.0.0").unwrap();
    let runtime = Runtime::new(balancer);

    let (proxy_listener, proxy_addr) = open_listener();
    let _proxy = Server::bind_test(&runtime, proxy_listener).unwrap();

    let (echo_listener, echo_addr) = open_listener();
    let vars = HashMap::from([('p', port_bytes(echo_addr))]);
    let script = Script::parse_with(SCRIPT, &vars);

    let server = Actor::server(&runtime, echo_listener, script.from_dialog(4));
    let client = Actor::client(&runtime, proxy_addr, script);

    client.finish().await;
    server.finish().await;
    runtime.idle().await;
}
