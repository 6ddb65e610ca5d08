//! Drives a single client through a real UDP handshake against a single
//! server, exercising the full Connecting/Accepting dance, a fragmented
//! application message, and a graceful disconnect.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rigelnet::{
    create_client, create_dummy_client, create_dummy_server, create_server, ComposeReceiver, DisconnectReason,
    Event, HandlerRegistry, Protocol, UpdateMode,
};

const GREET_HANDLER: u32 = 1;

fn pump_until<F>(rounds: usize, mut step: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..rounds {
        if step() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("condition was not reached within {} rounds", rounds);
}

#[test]
fn single_client_connects_exchanges_a_message_and_disconnects() {
    let mut server = create_server(Protocol::Udp, "open sesame", 4, 1024).unwrap();
    server.start(0).unwrap();
    let server_addr: SocketAddr = format!("127.0.0.1:{}", server.local_port()).parse().unwrap();

    let mut client = create_client(Protocol::Udp, "open sesame", 1024).unwrap();
    client.connect(0, server_addr).unwrap();

    let mut registry: HandlerRegistry<Vec<u8>> = HandlerRegistry::new();
    registry.register(GREET_HANDLER, |ctx, _sender, cursor| {
        ctx.extend_from_slice(&cursor.extract_remaining());
        Ok(())
    });
    let mut server_ctx = Vec::new();
    let empty_registry: HandlerRegistry<()> = HandlerRegistry::new();

    let mut server_connected = false;
    let mut client_connected = false;
    pump_until(200, || {
        client.update(UpdateMode::Send, &mut (), &empty_registry);
        server.update(UpdateMode::Receive, &mut server_ctx, &registry);
        server.update(UpdateMode::Send, &mut server_ctx, &registry);
        client.update(UpdateMode::Receive, &mut (), &empty_registry);

        while let Some(event) = server.poll_event() {
            if let Event::Connected { .. } = event {
                server_connected = true;
            }
        }
        while let Some(event) = client.poll_event() {
            if let Event::Connected { .. } = event {
                client_connected = true;
            }
        }
        server_connected && client_connected
    });

    assert_eq!(client.client_index(), Some(0));

    let mut message = rigelnet::cursor::PacketCursor::new();
    message.append_u32(GREET_HANDLER);
    message.append_string("hello from the client");
    client.compose(&message.into_bytes()).unwrap();

    pump_until(200, || {
        client.update(UpdateMode::Send, &mut (), &empty_registry);
        server.update(UpdateMode::Receive, &mut server_ctx, &registry);
        server.update(UpdateMode::Send, &mut server_ctx, &registry);
        client.update(UpdateMode::Receive, &mut (), &empty_registry);
        !server_ctx.is_empty()
    });

    let mut decoded = rigelnet::cursor::PacketCursor::from_bytes(server_ctx);
    assert_eq!(decoded.extract_string().unwrap(), "hello from the client");

    client.disconnect(true);

    pump_until(200, || {
        server.update(UpdateMode::Receive, &mut Vec::new(), &empty_registry);
        server.update(UpdateMode::Send, &mut Vec::new(), &empty_registry);
        matches!(
            server.poll_event(),
            Some(Event::Disconnected { reason: DisconnectReason::Graceful, .. })
        )
    });
}

#[test]
fn bad_passphrase_is_reported_without_connecting() {
    let mut server = create_server(Protocol::Udp, "correct horse", 1, 1024).unwrap();
    server.start(0).unwrap();
    let server_addr: SocketAddr = format!("127.0.0.1:{}", server.local_port()).parse().unwrap();

    let mut client = create_client(Protocol::Udp, "wrong passphrase", 1024).unwrap();
    client.connect(0, server_addr).unwrap();

    let empty_registry: HandlerRegistry<()> = HandlerRegistry::new();
    let deadline = Instant::now() + Duration::from_secs(1);
    let mut saw_bad_passphrase = false;
    while Instant::now() < deadline && !saw_bad_passphrase {
        client.update(UpdateMode::Send, &mut (), &empty_registry);
        server.update(UpdateMode::Receive, &mut (), &empty_registry);
        server.update(UpdateMode::Send, &mut (), &empty_registry);
        client.update(UpdateMode::Receive, &mut (), &empty_registry);
        while let Some(event) = server.poll_event() {
            if let Event::BadPassphrase { received_passphrase } = event {
                assert_eq!(received_passphrase, "wrong passphrase");
                saw_bad_passphrase = true;
            }
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(saw_bad_passphrase, "server never reported the bad passphrase");
    assert_eq!(server.client_connector(0).unwrap().status(), rigelnet::ConnectorStatus::Disconnected);
}

#[test]
fn dummy_server_and_client_are_inert() {
    let mut dummy_server = create_dummy_server();
    let mut dummy_client = create_dummy_client();
    let empty_registry: HandlerRegistry<()> = HandlerRegistry::new();
    dummy_server.update(UpdateMode::Send, &mut (), &empty_registry);
    dummy_client.update(UpdateMode::Send, &mut (), &empty_registry);
    assert!(dummy_server.poll_event().is_none());
    assert!(dummy_client.poll_event().is_none());
    assert!(!dummy_server.is_running());
    assert!(!dummy_client.is_running());
}
