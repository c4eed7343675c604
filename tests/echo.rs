//! End-to-end tests driving paired client/server sessions over an
//! in-memory wire.
//!
//! Each side's outbound sink feeds the peer's `receive()` directly, so the
//! full protocol — SYN/ACK handshakes, data framing, window updates, FIN
//! teardown, GoAway — runs exactly as it would over a socket, minus the
//! socket. Set `RUST_LOG=filament=trace` and add a subscriber to debug.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use filament::{
    Config, Error, Flags, Header, Session, Stream, StreamCallback, StreamState,
    INITIAL_STREAM_WINDOW,
};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Outbound sink that delivers every byte to the peer session, bound after
/// both sessions exist.
#[derive(Clone, Default)]
struct Wire {
    peer: Arc<Mutex<Option<Session>>>,
}

impl Wire {
    fn connect(&self, session: &Session) {
        *self.peer.lock() = Some(session.clone());
    }
}

impl Write for Wire {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // Clone the peer out so the wire lock is not held while the peer
        // processes (it may write back through the other wire).
        let peer = self.peer.lock().clone();
        if let Some(peer) = peer {
            let _ = peer.receive(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn test_config() -> Config {
    Config::new().with_keep_alive(false)
}

/// Build a connected client/server pair with the given accept callback.
fn pair(server_config: Config, on_stream: StreamCallback) -> (Session, Session) {
    let to_server = Wire::default();
    let to_client = Wire::default();
    let server = Session::server(server_config, Box::new(to_client.clone()), on_stream).unwrap();
    let client = Session::client(test_config(), Box::new(to_server.clone())).unwrap();
    to_server.connect(&server);
    to_client.connect(&client);
    (client, server)
}

/// Accept callback that echoes exactly `expected` bytes back in one write,
/// each stream on its own thread.
fn echo_exact(expected: usize) -> StreamCallback {
    Box::new(move |mut stream: Stream| {
        thread::spawn(move || {
            let mut message = vec![0u8; expected];
            if stream.read_exact(&mut message).is_ok() {
                let _ = stream.write_all(&message);
            }
        });
    })
}

/// Accept callback that echoes whatever arrives until end-of-stream.
fn echo_loop() -> StreamCallback {
    Box::new(|mut stream: Stream| {
        thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    })
}

// ---------------------------------------------------------------------------
// Echo
// ---------------------------------------------------------------------------

#[test]
fn echo_single_stream() {
    let (client, server) = pair(test_config(), echo_exact(6));

    let mut stream = client.open().unwrap();
    stream.write_all(b"echo-0").unwrap();

    let mut reply = [0u8; 6];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"echo-0");

    stream.close();
    client.close();
    server.close();
}

#[test]
fn echo_many_streams() {
    let (client, _server) = pair(test_config(), echo_loop());

    let mut streams = Vec::new();
    for i in 0..10 {
        let message = format!("echo-{i}");
        let mut stream = client.open().unwrap();
        stream.write_all(message.as_bytes()).unwrap();
        streams.push((stream, message));
    }

    for (stream, message) in &mut streams {
        let mut reply = vec![0u8; message.len()];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(reply, message.as_bytes());
    }
}

#[test]
fn large_write_round_trips_byte_identical() {
    let len = 200 * 1024;
    let (client, _server) = pair(test_config(), echo_exact(len));

    let message: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    let mut stream = client.open().unwrap();
    stream.write_all(&message).unwrap();

    let mut reply = vec![0u8; len];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(reply, message);
}

#[test]
fn write_larger_than_window_fragments_and_completes() {
    // 600 KiB exceeds the 256 KiB window; the writer must block for credit
    // and resume as the receiver drains.
    let len = 600 * 1024;
    let (client, _server) = pair(test_config(), echo_exact(len));

    let message: Vec<u8> = (0..len).map(|i| (i % 239) as u8).collect();
    let mut stream = client.open().unwrap();
    stream.write_all(&message).unwrap();

    let mut reply = vec![0u8; len];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(reply, message);
}

// ---------------------------------------------------------------------------
// Flow control accounting
// ---------------------------------------------------------------------------

#[test]
fn small_receive_leaves_window_unreplenished() {
    let (client, _server) = pair(test_config(), echo_exact(1024));

    let mut stream = client.open().unwrap();
    stream.write_all(&[0x42; 1024]).unwrap();

    let mut reply = [0u8; 1024];
    stream.read_exact(&mut reply).unwrap();

    // A 1 KiB delta is below half the window; the update is suppressed.
    assert_eq!(stream.recv_window(), INITIAL_STREAM_WINDOW - 1024);
}

#[test]
fn large_receive_replenishes_window() {
    let len = 200 * 1024;
    let (client, _server) = pair(test_config(), echo_exact(len));

    let mut stream = client.open().unwrap();
    stream.write_all(&vec![0x42; len]).unwrap();

    let mut reply = vec![0u8; len];
    stream.read_exact(&mut reply).unwrap();

    // Reading 200 KiB in one gulp crosses the half-window threshold.
    assert_eq!(stream.recv_window(), INITIAL_STREAM_WINDOW);
}

// ---------------------------------------------------------------------------
// GoAway and backlog
// ---------------------------------------------------------------------------

#[test]
fn open_after_peer_go_away_fails() {
    let (client, server) = pair(test_config(), echo_loop());

    server.close();
    assert_eq!(client.open().map(|_| ()), Err(Error::RemoteGoAway));
    assert!(!client.is_closed());
}

#[test]
fn stream_past_backlog_is_reset_and_never_delivered() {
    let accepted = Arc::new(AtomicUsize::new(0));
    let count = accepted.clone();
    let (client, _server) = pair(
        test_config(),
        Box::new(move |_stream| {
            count.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let mut streams = Vec::new();
    for _ in 0..256 {
        streams.push(client.open().unwrap());
    }
    assert_eq!(accepted.load(Ordering::SeqCst), 256);

    let mut rejected = client.open().unwrap();
    assert_eq!(rejected.state(), StreamState::Reset);
    assert_eq!(accepted.load(Ordering::SeqCst), 256);

    let err = rejected.write_all(b"x").unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
}

// ---------------------------------------------------------------------------
// Stream lifecycle
// ---------------------------------------------------------------------------

#[test]
fn close_before_ack_does_not_wedge() {
    // The server closes each accepted stream before ever sending its ACK.
    let (client, _server) = pair(
        test_config(),
        Box::new(|stream: Stream| {
            stream.close();
        }),
    );

    let first = client.open().unwrap();
    assert_eq!(first.state(), StreamState::RemoteClose);
    first.close();
    assert_eq!(client.num_streams(), 0);

    // The session stays usable.
    let second = client.open().unwrap();
    assert_eq!(second.state(), StreamState::RemoteClose);
}

#[test]
fn fin_handshake_closes_cleanly() {
    let (client, server) = pair(test_config(), echo_exact(5));

    let mut stream = client.open().unwrap();
    stream.write_all(b"hello").unwrap();
    let mut reply = [0u8; 5];
    stream.read_exact(&mut reply).unwrap();

    stream.close();
    assert_eq!(stream.state(), StreamState::LocalClose);

    // Half-close holds until teardown forces the rest.
    client.close();
    server.close();
    assert_eq!(stream.state(), StreamState::Closed);
}

#[test]
fn second_fin_in_remote_close_surfaces_unexpected_flag() {
    let (client, _server) = pair(test_config(), echo_loop());
    let mut stream = client.open().unwrap();

    // Craft the peer's FIN twice; the second lands in RemoteClose.
    client
        .receive(&Header::window_update(Flags::FIN, stream.id(), 0).encode())
        .unwrap();
    assert_eq!(stream.state(), StreamState::RemoteClose);

    client
        .receive(&Header::window_update(Flags::FIN, stream.id(), 0).encode())
        .unwrap();
    assert_eq!(stream.state(), StreamState::RemoteClose);

    let mut buf = [0u8; 1];
    let err = stream.read(&mut buf).unwrap_err();
    assert_eq!(err.to_string(), Error::UnexpectedFlag.to_string());
}

#[test]
fn session_close_wakes_blocked_reader() {
    let (client, _server) = pair(test_config(), echo_loop());
    let mut stream = client.open().unwrap();

    let closer = client.clone();
    let handle = thread::spawn(move || {
        // Blocks until the close below force-closes the stream.
        let mut buf = [0u8; 1];
        stream.read(&mut buf)
    });

    thread::sleep(std::time::Duration::from_millis(50));
    closer.close();

    let result = handle.join().unwrap();
    assert_eq!(result.unwrap(), 0);
}
