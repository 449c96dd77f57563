use std::{
    io::Read,
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener},
    thread,
    time::Duration,
};

use flowplane_net::tcp::Reactor;

/// Spawns a plain-socket collector (no reactor involved) that accepts one
/// connection, optionally stalls before reading, then reads until the peer
/// closes and hands back everything it saw.
fn spawn_collector(read_delay: Duration) -> (SocketAddr, thread::JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind(SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 0)))
        .expect("failed to bind collector");
    let addr = listener.local_addr().expect("failed to read collector addr");

    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("failed to accept collector connection");
        if !read_delay.is_zero() {
            thread::sleep(read_delay);
        }
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).expect("collector read failed");
        buf
    });

    (addr, handle)
}

fn pump(reactor: &mut Reactor, for_how_long: Duration) {
    let deadline = std::time::Instant::now() + for_how_long;
    while std::time::Instant::now() < deadline {
        while reactor.poll_with(|_| {}) {}
        thread::sleep(Duration::from_millis(1));
    }
}

/// Queues a payload large enough to overrun the kernel send buffer on one
/// client token while a second, responsive collector keeps up on another
/// token, then confirms the stalled one still flushes once its reader wakes
/// up, and that the two tokens' data was never mixed up under backpressure.
#[test]
fn queued_writes_flush_after_backpressure_clears_without_crossing_tokens() {
    let (fast_addr, fast_handle) = spawn_collector(Duration::from_millis(0));
    let (slow_addr, slow_handle) = spawn_collector(Duration::from_millis(700));

    let mut reactor = Reactor::new();
    let fast_token = reactor.connect(fast_addr).expect("failed to connect to fast collector");
    let slow_token = reactor.connect(slow_addr).expect("failed to connect to slow collector");
    assert_ne!(fast_token, slow_token);

    // Fill the slow socket's buffer while its reader is stalled, forcing the
    // backlog/backpressure path in `TcpStream::write_or_enqueue`.
    let big = vec![7u8; 8 * 1024 * 1024];
    reactor.write_or_enqueue(slow_token, big);

    let marker = b"marker-after-backpressure".to_vec();
    reactor.write_or_enqueue(slow_token, marker.clone());
    reactor.write_or_enqueue(fast_token, b"fast-keepalive".to_vec());

    assert!(reactor.backlog_bytes(slow_token) > 0, "sanity: slow token should still be backlogged");

    pump(&mut reactor, Duration::from_secs(1));
    reactor.disconnect(fast_token);
    reactor.disconnect(slow_token);
    drop(reactor);

    let fast_bytes = fast_handle.join().expect("fast collector thread panicked");
    let slow_bytes = slow_handle.join().expect("slow collector thread panicked");

    assert_eq!(fast_bytes, b"fast-keepalive", "fast collector got the wrong bytes");
    assert!(
        slow_bytes.windows(marker.len()).any(|w| w == marker.as_slice()),
        "slow collector never received the marker after backpressure was released"
    );
}
