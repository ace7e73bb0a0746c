//! The socket bridge: readiness events reach the owning service as
//! messages, and service-side writes flow back out.

mod common;

use colony::{Config, Message, MessageKind, Runtime, Service, ServiceContext, SocketEvent};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

/// Echoes every inbound chunk back down the same connection.
struct EchoServer;

impl Service for EchoServer {
    fn message(&mut self, rt: &Arc<Runtime>, _ctx: &ServiceContext, msg: Message) {
        if msg.kind != MessageKind::Socket {
            return;
        }
        if let Some(SocketEvent::Data { id, data }) = SocketEvent::decode(&msg.data) {
            rt.socket_send(id, data);
        }
    }
}

#[test]
fn bytes_echo_through_the_poll_loop() {
    let mut config = Config::new();
    config.thread = 2;
    config.register("echo-server", |_rt, _args| Ok(Box::new(EchoServer)));
    let (rt, done) = common::launch(config);

    let server = rt.spawn_service("echo-server", "").unwrap();
    let (_listen_id, addr) = rt.listen(server, "127.0.0.1:0").unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    client.write_all(b"colony").unwrap();

    let mut buf = [0u8; 6];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"colony");

    // A second round on the same connection: the poller kept it armed.
    client.write_all(b"again!").unwrap();
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"again!");

    drop(client);
    rt.retire_all();
    common::join(&done, 10);
}
