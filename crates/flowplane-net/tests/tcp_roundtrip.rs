use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    thread,
    time::Duration,
};

use flowplane_net::tcp::{PollEvent, Reactor, Token};

/// Polls `reactor` until `collected` for `token` holds at least `want.len()`
/// bytes, accumulating every `PollEvent::Bytes` chunk along the way. Mirrors
/// the spin-loop-with-short-sleep shape used throughout this crate's donor's
/// own socket tests; there's no message framing here, so "done" just means
/// "got enough bytes".
fn wait_for_bytes(reactor: &mut Reactor, token: Token, want_len: usize, collected: &mut Vec<u8>) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while collected.len() < want_len {
        reactor.poll_with(|event| {
            if let PollEvent::Bytes { token: t, bytes } = event {
                if t == token {
                    collected.extend_from_slice(bytes);
                }
            }
        });
        if collected.len() >= want_len {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "timed out waiting for bytes");
        thread::sleep(Duration::from_micros(50));
    }
}

#[test]
fn tcp_roundtrip() {
    let bind_addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 24901));

    let mut listener = Reactor::new();
    listener.listen(bind_addr, 10).unwrap();

    let server = thread::spawn(move || {
        let mut stream_token = None;
        while stream_token.is_none() {
            listener.poll_with(|event| match event {
                PollEvent::Accept { stream, .. } => stream_token = Some(stream),
                PollEvent::Bytes { .. } => panic!("shouldn't have gotten bytes before accept"),
                PollEvent::Disconnected { .. } => {}
            });
        }
        let stream_token = stream_token.unwrap();

        let mut received = Vec::new();
        wait_for_bytes(&mut listener, stream_token, b"ping".len(), &mut received);
        assert_eq!(received, b"ping");

        listener.write_or_enqueue(stream_token, b"pong".to_vec());

        // Give the client a moment to possibly (wrongly) send more, then
        // confirm nothing else arrives before the thread tears down.
        thread::sleep(Duration::from_millis(20));
        let mut stray = Vec::new();
        listener.poll_with(|event| {
            if let PollEvent::Bytes { token, bytes } = event {
                if token == stream_token {
                    stray.extend_from_slice(bytes);
                }
            }
        });
        assert!(stray.is_empty(), "server received unexpected extra bytes: {stray:?}");
    });

    let client = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        let mut conn = Reactor::new();
        let token = conn.connect(bind_addr).unwrap();
        conn.write_or_enqueue(token, b"ping".to_vec());

        let mut received = Vec::new();
        wait_for_bytes(&mut conn, token, b"pong".len(), &mut received);
        assert_eq!(received, b"pong");
    });

    server.join().unwrap();
    client.join().unwrap();
}

#[test]
fn tcp_multiple_clients_are_kept_distinct_by_token() {
    let bind_addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 24902));

    let mut listener = Reactor::new();
    listener.listen(bind_addr, 10).unwrap();

    let server = thread::spawn(move || {
        let mut accepted: Vec<Token> = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while accepted.len() < 2 {
            listener.poll_with(|event| {
                if let PollEvent::Accept { stream, .. } = event {
                    accepted.push(stream);
                }
            });
            assert!(std::time::Instant::now() < deadline, "timed out waiting for both clients");
            thread::sleep(Duration::from_micros(50));
        }

        let mut by_token: HashMap<Token, Vec<u8>> = HashMap::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while by_token.values().map(Vec::len).sum::<usize>() < (b"one".len() + b"two".len()) {
            listener.poll_with(|event| {
                if let PollEvent::Bytes { token, bytes } = event {
                    by_token.entry(token).or_default().extend_from_slice(bytes);
                }
            });
            assert!(std::time::Instant::now() < deadline, "timed out waiting for both payloads");
            thread::sleep(Duration::from_micros(50));
        }

        let values: Vec<&Vec<u8>> = accepted.iter().map(|t| by_token.get(t).unwrap()).collect();
        assert!(values.iter().any(|v| v.as_slice() == b"one"));
        assert!(values.iter().any(|v| v.as_slice() == b"two"));
    });

    let client_one = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        let mut conn = Reactor::new();
        let token = conn.connect(bind_addr).unwrap();
        conn.write_or_enqueue(token, b"one".to_vec());
        thread::sleep(Duration::from_millis(200));
    });
    let client_two = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        let mut conn = Reactor::new();
        let token = conn.connect(bind_addr).unwrap();
        conn.write_or_enqueue(token, b"two".to_vec());
        thread::sleep(Duration::from_millis(200));
    });

    server.join().unwrap();
    client_one.join().unwrap();
    client_two.join().unwrap();
}
