//! End-to-end tests over loopback TCP.
//!
//! Each test starts a real [`Server`] whose Available handler serves requests on a
//! [`ThreadPool`], then talks to it through one or more [`Client`]s.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use rowlink::{
    MemoryExecutor, QueryError, QueryExecutor, Table,
    protocol::{
        Client, ClientEvent, Packet, PacketType, Server, ServerOptions, ServerState, ThreadPool,
        TransportError, serve,
    },
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn fast() -> ServerOptions {
    ServerOptions::default()
        .with_accept_interval(Duration::from_millis(5))
        .with_check_interval(Duration::from_millis(10))
        .with_poll_timeout(Duration::from_millis(5))
        .with_clean_interval(Duration::from_millis(50))
}

/// Binds a server at `address` and serves every request with `executor`.
fn start<E>(address: SocketAddr, executor: E, options: ServerOptions) -> Server
where
    E: QueryExecutor + 'static,
{
    let mut server = Server::with_options(address, options).expect("bind server");
    let endpoint = server.endpoint();
    let executor = Arc::new(executor);
    let pool = ThreadPool::new(4);

    server.on_available(move |c| {
        let endpoint = Arc::clone(&endpoint);
        let executor = Arc::clone(&executor);
        let index = c.index;
        pool.execute(move || {
            if serve(&endpoint, index, executor.as_ref()).is_err() {
                let _ = endpoint.close(index);
            }
        });
    });
    server.accept().expect("start server");
    server
}

fn connect(server: &Server) -> Client {
    let mut client = Client::new(server.local_addr(), loopback()).expect("bind client");
    client.connect().expect("connect client");
    client
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn recorder() -> (
    Arc<Mutex<Vec<ClientEvent>>>,
    impl Fn(&ClientEvent) + Send + 'static,
) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    (events, move |c: &ClientEvent| sink.lock().unwrap().push(*c))
}

fn strict(query: &str) -> Result<Table, QueryError> {
    if query == "select 1" {
        let mut table = Table::new(["?column?"]);
        table.push_row(["1"]).unwrap();
        Ok(table)
    } else {
        Err(QueryError::new("syntax error"))
    }
}

// ---------------------------------------------------------------------------
// Request/response scenarios
// ---------------------------------------------------------------------------

#[test]
fn select_one_between_fixed_ports() {
    let server = start(
        "127.0.0.1:39000".parse().unwrap(),
        MemoryExecutor::new(),
        fast(),
    );
    let mut client = Client::new(
        "127.0.0.1:39000".parse().unwrap(),
        "127.0.0.1:39001".parse().unwrap(),
    )
    .unwrap();
    client.connect().unwrap();

    client.send_query("select 1").unwrap();
    client.await_ack().unwrap();
    let table = client.receive_table().unwrap();

    assert_eq!(table.rows(), &[vec!["1".to_string()]]);
    assert!(wait_until(Duration::from_secs(1), || {
        server
            .clients()
            .first()
            .is_some_and(|c| c.remote_port == 39001)
    }));
}

#[test]
fn failed_query_keeps_session_usable() {
    let server = start(loopback(), strict, fast());
    let client = connect(&server);

    match client.query("selct 1") {
        Err(TransportError::Remote { message }) => assert_eq!(message, "syntax error"),
        other => panic!("expected remote error, got {other:?}"),
    }

    assert_eq!(
        client.query("select 1").unwrap().rows(),
        &[vec!["1".to_string()]]
    );
}

#[test]
fn data_instead_of_query_is_nacked() {
    let server = start(loopback(), MemoryExecutor::new(), fast());
    let client = connect(&server);

    client.send(&Packet::data(0, 1, "select 1")).unwrap();
    assert_eq!(client.recv().unwrap().kind(), PacketType::Nack);

    assert!(client.is_connected());
    assert_eq!(client.query("select 1").unwrap().len(), 1);
    assert_eq!(server.connected_count(), 1);
}

#[test]
fn large_table_arrives_in_ordered_blocks() {
    let executor = MemoryExecutor::new();
    executor.populate(10_000).unwrap();
    let server = start(loopback(), executor, fast().with_block_size(100));
    let client = connect(&server);

    client.request(&Packet::query("select * from users")).unwrap();
    let mut parts = 0;
    loop {
        let packet = client.recv().unwrap();
        assert_eq!(packet.kind(), PacketType::Data);
        assert_eq!(packet.part(), parts);
        assert_eq!(packet.total_parts(), 100);
        client
            .send(&Packet::ack_part(packet.part(), packet.total_parts()))
            .unwrap();
        parts += 1;
        if packet.is_last() {
            break;
        }
    }
    assert_eq!(parts, 100);

    let table = client.query("select * from users").unwrap();
    assert_eq!(table.len(), 10_000);
    for (i, row) in table.rows().iter().enumerate() {
        assert_eq!(row[0], (i + 1).to_string());
    }
}

#[test]
fn strings_travel_both_ways() {
    let mut server = Server::with_options(loopback(), fast()).unwrap();
    server.accept().unwrap();
    let client = connect(&server);
    assert!(wait_until(Duration::from_secs(1), || server.clients().len() == 1));

    let text = "é".repeat(100_000);
    let sender = {
        let text = text.clone();
        thread::spawn(move || {
            client.send_string(&text).unwrap();
            client
        })
    };
    assert_eq!(server.recv_string(0).unwrap(), text);
    let client = sender.join().unwrap();

    server.send_string(0, "done").unwrap();
    assert_eq!(client.recv_string().unwrap(), "done");
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

#[test]
fn indices_stay_aligned_under_concurrent_connects() {
    let mut server = Server::with_options(loopback(), fast()).unwrap();
    let (connects, on_connect) = recorder();
    server.on_connect(on_connect);
    server.accept().unwrap();
    let address = server.local_addr();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            thread::spawn(move || {
                let mut client = Client::new(address, loopback()).unwrap();
                client.connect().unwrap();
                client
            })
        })
        .collect();
    let clients: Vec<Client> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(wait_until(Duration::from_secs(2), || {
        connects.lock().unwrap().len() == 8
    }));
    let handlers = server.clients();
    for event in connects.lock().unwrap().iter() {
        assert_eq!(handlers[event.index].remote_port, event.client_port);
        assert_eq!(event.server, address);
    }
    let mut ports: Vec<_> = clients.iter().map(|c| c.local_addr().port()).collect();
    let mut seen: Vec<_> = handlers.iter().map(|h| h.remote_port).collect();
    ports.sort();
    seen.sort();
    assert_eq!(ports, seen);
}

#[test]
fn live_indices_survive_cleanup() {
    let server = start(loopback(), MemoryExecutor::new(), fast());
    let mut clients: Vec<Option<Client>> = Vec::new();
    for i in 0..6 {
        clients.push(Some(connect(&server)));
        assert!(wait_until(Duration::from_secs(1), || server.clients().len() == i + 1));
    }

    // Only 4 and 5 form a trailing run; 1 sits between live clients.
    for i in [1, 4, 5] {
        clients[i] = None;
    }
    assert!(wait_until(Duration::from_secs(2), || server.clients().len() == 4));
    thread::sleep(Duration::from_millis(150));

    let handlers = server.clients();
    assert_eq!(handlers.len(), 4);
    assert!(!handlers[1].is_connected);
    for i in [0, 2, 3] {
        let client = clients[i].as_ref().unwrap();
        assert!(handlers[i].is_connected);
        assert_eq!(handlers[i].remote_port, client.local_addr().port());
        assert_eq!(client.query("select 1").unwrap().len(), 1);
    }
}

#[test]
fn disconnect_fires_once() {
    let mut server = Server::with_options(loopback(), fast()).unwrap();
    let (disconnects, on_disconnect) = recorder();
    server.on_disconnect(on_disconnect);
    server.accept().unwrap();

    let client = connect(&server);
    let port = client.local_addr().port();
    assert!(wait_until(Duration::from_secs(1), || server.connected_count() == 1));

    drop(client);
    let started = Instant::now();
    assert!(wait_until(Duration::from_secs(1), || {
        !disconnects.lock().unwrap().is_empty()
    }));
    assert!(started.elapsed() < Duration::from_millis(500));

    thread::sleep(Duration::from_millis(100));
    let events = disconnects.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].index, 0);
    assert_eq!(events[0].client_port, port);
}

#[test]
fn available_fires_for_pending_data() {
    let mut server = Server::with_options(loopback(), fast()).unwrap();
    let (available, on_available) = recorder();
    server.on_available(on_available);
    server.accept().unwrap();

    let client = connect(&server);
    assert!(wait_until(Duration::from_secs(1), || server.connected_count() == 1));
    client.send(&Packet::warning("ping")).unwrap();

    assert!(wait_until(Duration::from_secs(1), || {
        !available.lock().unwrap().is_empty()
    }));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(available.lock().unwrap().len(), 1);

    assert_eq!(server.recv(0).unwrap(), Packet::warning("ping"));
    client.send(&Packet::warning("pong")).unwrap();
    assert!(wait_until(Duration::from_secs(1), || {
        available.lock().unwrap().len() == 2
    }));
}

#[test]
fn idle_clients_do_not_slow_disconnect_detection() {
    let mut server = Server::new(loopback()).unwrap();
    let (disconnects, on_disconnect) = recorder();
    server.on_disconnect(on_disconnect);
    server.accept().unwrap();

    let mut clients: Vec<Client> = (0..5).map(|_| connect(&server)).collect();
    assert!(wait_until(Duration::from_secs(2), || server.connected_count() == 5));
    let last = clients.pop().unwrap();
    let port = last.local_addr().port();

    drop(last);
    let started = Instant::now();
    assert!(wait_until(Duration::from_secs(3), || {
        !disconnects.lock().unwrap().is_empty()
    }));

    let check_interval = server.options().check_interval;
    assert!(started.elapsed() < check_interval * 5, "took {:?}", started.elapsed());
    assert_eq!(disconnects.lock().unwrap()[0].client_port, port);
    assert_eq!(server.connected_count(), 4);
}

#[test]
fn sending_does_not_reannounce_unread_data() {
    let mut server = Server::with_options(loopback(), fast()).unwrap();
    let (available, on_available) = recorder();
    server.on_available(on_available);
    server.accept().unwrap();

    let client = connect(&server);
    assert!(wait_until(Duration::from_secs(1), || server.connected_count() == 1));
    client.send_query("select 1").unwrap();
    assert!(wait_until(Duration::from_secs(1), || {
        available.lock().unwrap().len() == 1
    }));

    server.send(0, &Packet::warning("busy")).unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(available.lock().unwrap().len(), 1);

    assert_eq!(server.recv(0).unwrap(), Packet::query("select 1"));
    assert_eq!(client.recv().unwrap(), Packet::warning("busy"));
}

#[test]
fn stop_client_disconnects_only_that_client() {
    let mut server = Server::with_options(loopback(), fast()).unwrap();
    let (disconnects, on_disconnect) = recorder();
    server.on_disconnect(on_disconnect);
    server.accept().unwrap();

    let first = connect(&server);
    assert!(wait_until(Duration::from_secs(1), || server.clients().len() == 1));
    let second = connect(&server);
    assert!(wait_until(Duration::from_secs(1), || server.clients().len() == 2));

    server.stop_client(0).unwrap();
    server.stop_client(0).unwrap();

    assert!(matches!(first.recv(), Err(TransportError::Io(_))));
    server.send(1, &Packet::warning("still here")).unwrap();
    assert_eq!(second.recv().unwrap(), Packet::warning("still here"));

    thread::sleep(Duration::from_millis(100));
    assert_eq!(disconnects.lock().unwrap().len(), 1);
    assert_eq!(server.connected_count(), 1);
}

#[test]
fn cleanup_reclaims_everything_once_all_leave() {
    let server = start(loopback(), MemoryExecutor::new(), fast());
    let clients: Vec<Client> = (0..3).map(|_| connect(&server)).collect();
    assert!(wait_until(Duration::from_secs(1), || server.clients().len() == 3));

    drop(clients);

    assert!(wait_until(Duration::from_secs(2), || server.clients().is_empty()));
    thread::sleep(Duration::from_millis(100));
    assert!(server.clients().is_empty());
    assert_eq!(server.connected_count(), 0);
}

#[test]
fn server_cannot_listen_twice() {
    let mut server = Server::with_options(loopback(), fast()).unwrap();
    server.accept().unwrap();
    assert_eq!(server.state(), ServerState::Listening);

    let client = connect(&server);
    assert!(wait_until(Duration::from_secs(1), || server.connected_count() == 1));

    server.stop_server().unwrap();
    assert_eq!(server.state(), ServerState::NotListening);
    assert!(server.accept().is_err());

    server.send(0, &Packet::warning("bye")).unwrap();
    assert_eq!(client.recv().unwrap(), Packet::warning("bye"));
}
