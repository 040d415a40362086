//! End-to-end tests driving the public facade: a standalone session, and a
//! hosted two-peer game over loopback TCP.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{error::TryRecvError, UnboundedReceiver};

use padlink_netplay::{Buttons, ClientEvent, Controller, NetplayClient, MAX_PLAYERS};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Drain the event stream until `pred` matches, discarding everything else.
fn wait_for_event(
    rx: &mut UnboundedReceiver<ClientEvent>,
    mut pred: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        match rx.try_recv() {
            Ok(event) if pred(&event) => return event,
            Ok(_) => {}
            Err(TryRecvError::Empty) => {
                assert!(Instant::now() < deadline, "timed out waiting for event");
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(TryRecvError::Disconnected) => panic!("event stream closed"),
        }
    }
}

/// `get_input` blocks by contract; run it on a side thread so a regression
/// fails the test instead of hanging it.
fn get_input_timeout(client: &Arc<NetplayClient>, port: usize) -> Buttons {
    let (tx, rx) = std::sync::mpsc::channel();
    let client = client.clone();
    std::thread::spawn(move || {
        let _ = tx.send(client.get_input(port));
    });
    rx.recv_timeout(TIMEOUT).expect("timed out waiting for input")
}

fn one_pad() -> [Controller; MAX_PLAYERS] {
    let mut pads = [Controller::default(); MAX_PLAYERS];
    pads[0].present = true;
    pads
}

#[test]
fn standalone_start_plays_without_a_server() {
    let (client, mut events) = NetplayClient::spawn().unwrap();

    let mut pads = [Controller::default(); MAX_PLAYERS];
    pads[0].present = true;
    pads[1].present = true;
    client.set_local_controllers(pads).unwrap();

    client.process_message("/start");
    client.wait_until_start();

    let a = Buttons(0x11);
    let b = Buttons(0x22);
    client
        .process_input([a, b, Buttons(0), Buttons(0)])
        .unwrap();

    assert_eq!(client.get_input(0), a);
    assert_eq!(client.get_input(1), b);
    // Absent ports read neutral without blocking.
    assert_eq!(client.get_input(2), Buttons(0));

    wait_for_event(&mut events, |e| {
        matches!(e, ClientEvent::Status(s) if s == "Starting game...")
    });

    client.process_message("/start");
    wait_for_event(&mut events, |e| {
        matches!(e, ClientEvent::Error(s) if s == "Game has already started")
    });
}

#[test]
fn hosted_game_exchanges_inputs_between_peers() {
    let (host, mut host_events) = NetplayClient::spawn().unwrap();
    host.set_name("alice").unwrap();
    host.set_local_controllers(one_pad()).unwrap();

    host.process_message("/host 0");
    let port = match wait_for_event(&mut host_events, |e| {
        matches!(e, ClientEvent::HostStarted { .. })
    }) {
        ClientEvent::HostStarted { port } => port,
        _ => unreachable!(),
    };

    let (guest, mut guest_events) = NetplayClient::spawn().unwrap();
    guest.set_name("bob").unwrap();
    guest.set_local_controllers(one_pad()).unwrap();
    guest.process_message(format!("/join 127.0.0.1 {port}"));

    // Both peers must be registered before the start request freezes the
    // port assignment.
    wait_for_event(&mut host_events, |e| {
        matches!(e, ClientEvent::Status(s) if s == "bob has joined")
    });
    wait_for_event(&mut guest_events, |e| {
        matches!(e, ClientEvent::Status(s) if s == "alice has joined")
    });

    host.process_message("/start");
    host.wait_until_start();
    guest.wait_until_start();

    let host = Arc::new(host);
    let guest = Arc::new(guest);

    let a = Buttons(0xA0);
    let b = Buttons(0xB0);
    host.process_input([a, Buttons(0), Buttons(0), Buttons(0)])
        .unwrap();
    guest
        .process_input([b, Buttons(0), Buttons(0), Buttons(0)])
        .unwrap();

    // Own inputs come straight off the local queue; the host was assigned
    // netplay port 0, the guest port 1.
    assert_eq!(host.get_input(0), a);
    assert_eq!(guest.get_input(1), b);

    // The cross inputs arrive over loopback.
    assert_eq!(get_input_timeout(&host, 1), b);
    assert_eq!(get_input_timeout(&guest, 0), a);

    // Chat crosses too, attributed to the sender.
    guest.process_message("good luck");
    wait_for_event(&mut host_events, |e| {
        matches!(e, ClientEvent::Chat { name, message }
            if name == "bob" && message == "good luck")
    });
}

#[test]
fn wrong_server_version_disconnects_with_a_clear_error() {
    // A fake server that speaks the framing but claims the wrong version.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = std::thread::spawn(move || {
        use std::io::{Read, Write};
        let (mut stream, _) = listener.accept().unwrap();

        let payload = [0u8, 0x00, 0x0F, 0x42, 0x3F]; // VERSION, 999999
        let mut frame = Vec::new();
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        stream.write_all(&frame).unwrap();

        // Hold the socket open until the client hangs up.
        let mut buf = [0u8; 256];
        while let Ok(n) = stream.read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    });

    let (client, mut events) = NetplayClient::spawn().unwrap();
    client.process_message(format!("/join 127.0.0.1 {port}"));

    wait_for_event(&mut events, |e| {
        matches!(e, ClientEvent::Error(s)
            if s == "Server protocol version does not match client protocol version")
    });

    drop(client);
    server.join().unwrap();
}
