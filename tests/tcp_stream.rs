use std::io::{Read, Write};
use std::net;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use futures::executor::block_on;
use rand::Rng;

use asock::net::{OptionValue, SocketOption, TcpListener, TcpStream};
use asock::{Buffer, Error};

mod util;
use util::{free_port, init, payload};

#[test]
fn echo_round_trip() {
    init();
    let listener = TcpListener::bind("127.0.0.1", 0).unwrap();
    let port = listener.local_addr().unwrap().port();

    block_on(async {
        let (accepted, connected) = futures::join!(
            listener.accept(),
            TcpStream::connect("127.0.0.1", port)
        );
        let server = accepted.unwrap();
        let client = connected.unwrap();

        let mut outgoing = Buffer::from_vec(vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
        client.write(&mut outgoing).await.unwrap();
        assert_eq!(outgoing.cursor(), 9);

        let mut incoming = Buffer::with_capacity(9);
        while incoming.has_remaining() {
            server.read(&mut incoming).await.unwrap();
        }
        assert_eq!(incoming.to_vec(), vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(incoming.cursor(), 9);

        server.close().await;
        client.close().await;
    });
    listener.close();
}

#[test]
fn minimum_read_waits_for_the_threshold() {
    init();
    let std_listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = std_listener.local_addr().unwrap().port();

    // The peer trickles one byte every 20 ms.
    let pacer = thread::spawn(move || {
        let (mut peer, _) = std_listener.accept().unwrap();
        for byte in 0..10u8 {
            peer.write_all(&[byte]).unwrap();
            thread::sleep(Duration::from_millis(20));
        }
    });

    block_on(async {
        let client = TcpStream::connect("127.0.0.1", port).await.unwrap();
        let mut buffer = Buffer::with_capacity(10);
        let count = client.read_at_least(&mut buffer, 10).await.unwrap();
        assert_eq!(count, 10);
        assert_eq!(buffer.cursor(), 10);
        assert_eq!(buffer.to_vec(), (0..10u8).collect::<Vec<_>>());
        client.close().await;
    });
    pacer.join().unwrap();
}

#[test]
fn bulk_read_of_ten_megabytes() {
    init();
    const TOTAL: usize = 10_000_000;

    let std_listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = std_listener.local_addr().unwrap().port();

    let sender = thread::spawn(move || {
        let (mut peer, _) = std_listener.accept().unwrap();
        peer.write_all(&payload(TOTAL)).unwrap();
    });

    block_on(async {
        let client = TcpStream::connect("127.0.0.1", port).await.unwrap();
        let mut buffer = Buffer::with_capacity(65_536);
        let mut seen = 0usize;
        let total = client
            .bulk_read(&mut buffer, move |buf, count| {
                // Verify the pattern chunk by chunk.
                let bytes = buf.to_vec();
                for (i, byte) in bytes[..count].iter().enumerate() {
                    assert_eq!(*byte, ((seen + i) & 0xff) as u8);
                }
                seen += count;
                let rest = TOTAL - seen;
                buf.set_limit(rest.min(buf.capacity()))?;
                Ok(seen < TOTAL)
            })
            .await
            .unwrap();
        assert_eq!(total, TOTAL);
        client.close().await;
    });
    sender.join().unwrap();
}

#[test]
fn close_waits_for_queue_drain() {
    init();
    let std_listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = std_listener.local_addr().unwrap().port();

    let reader = thread::spawn(move || {
        let (mut peer, _) = std_listener.accept().unwrap();
        let mut bytes = Vec::new();
        peer.read_to_end(&mut bytes).unwrap();
        bytes
    });

    block_on(async {
        let client = TcpStream::connect("127.0.0.1", port).await.unwrap();
        for value in 1..=1000i32 {
            let mut buffer = Buffer::with_capacity(4);
            buffer.put_i32(value).unwrap();
            buffer.set_cursor(0).unwrap();
            // Fire-and-forget: enqueue without awaiting the completion.
            drop(client.send(buffer));
        }
        client.close().await;
    });

    // Everything enqueued before the close must have hit the wire, in order.
    let bytes = reader.join().unwrap();
    assert_eq!(bytes.len(), 4000);
    for value in 1..=1000i32 {
        let start = (value as usize - 1) * 4;
        let decoded = i32::from_be_bytes(bytes[start..start + 4].try_into().unwrap());
        assert_eq!(decoded, value);
    }
}

#[test]
fn force_close_returns_in_bounded_time() {
    init();
    let std_listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = std_listener.local_addr().unwrap().port();
    let holder = thread::spawn(move || std_listener.accept().unwrap());

    block_on(async {
        let client = TcpStream::connect("127.0.0.1", port).await.unwrap();
        for value in 1..=1000i32 {
            let mut buffer = Buffer::with_capacity(4);
            buffer.put_i32(value).unwrap();
            buffer.set_cursor(0).unwrap();
            drop(client.send(buffer));
        }

        let start = Instant::now();
        client.force_close();
        // No await on the queue: the call itself is constant-bounded.
        assert!(start.elapsed() < Duration::from_millis(100));

        let mut late = Buffer::from_vec(vec![0, 0, 0, 0]);
        match client.write(&mut late).await {
            Err(Error::SocketClosed) => {}
            other => panic!("expected SocketClosed, got {:?}", other),
        }
    });
    let _ = holder.join().unwrap();
}

#[test]
fn connect_to_dead_port_is_refused() {
    init();
    let port = free_port();
    block_on(async {
        match TcpStream::connect("127.0.0.1", port).await {
            Err(Error::ConnectionRefused) => {}
            other => panic!("expected ConnectionRefused, got {:?}", other),
        }
    });
}

#[test]
fn close_handler_fires_exactly_once() {
    init();
    let std_listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = std_listener.local_addr().unwrap().port();
    let holder = thread::spawn(move || std_listener.accept().unwrap());

    block_on(async {
        let client = TcpStream::connect("127.0.0.1", port).await.unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));
        let handler_fired = fired.clone();
        let handler_seen = seen.clone();
        client.set_exception_handler(move |err| {
            handler_fired.fetch_add(1, Ordering::SeqCst);
            *handler_seen.lock().unwrap() = Some(err);
        });

        client.close().await;
        client.close().await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(matches!(*seen.lock().unwrap(), Some(Error::NormalClose)));
    });
    let _ = holder.join().unwrap();
}

#[test]
fn peer_disconnect_surfaces_once() {
    init();
    let std_listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = std_listener.local_addr().unwrap().port();
    let peer = thread::spawn(move || {
        // Accept and hang up immediately.
        drop(std_listener.accept().unwrap());
    });

    block_on(async {
        let client = TcpStream::connect("127.0.0.1", port).await.unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));
        let handler_fired = fired.clone();
        let handler_seen = seen.clone();
        client.set_exception_handler(move |err| {
            handler_fired.fetch_add(1, Ordering::SeqCst);
            *handler_seen.lock().unwrap() = Some(err);
        });

        let mut buffer = Buffer::with_capacity(4);
        match client.read(&mut buffer).await {
            Err(Error::PeerClosed) => {}
            other => panic!("expected PeerClosed, got {:?}", other),
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(matches!(*seen.lock().unwrap(), Some(Error::PeerClosed)));

        // The connection is gone; later operations see SocketClosed and the
        // handler stays quiet.
        match client.read(&mut buffer).await {
            Err(Error::SocketClosed) => {}
            other => panic!("expected SocketClosed, got {:?}", other),
        }
        client.close().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    });
    peer.join().unwrap();
}

#[test]
fn second_read_in_flight_is_refused() {
    init();
    let std_listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = std_listener.local_addr().unwrap().port();
    let holder = thread::spawn(move || std_listener.accept().unwrap());

    block_on(async {
        let client = TcpStream::connect("127.0.0.1", port).await.unwrap();

        {
            let mut first_buffer = Buffer::with_capacity(4);
            let first = client.read(&mut first_buffer);
            futures::pin_mut!(first);
            assert!(futures::poll!(first.as_mut()).is_pending());

            let mut second_buffer = Buffer::with_capacity(4);
            match client.read(&mut second_buffer).await {
                Err(Error::ConcurrentRead) => {}
                other => panic!("expected ConcurrentRead, got {:?}", other),
            }
            // The suspended read is cancelled when it drops here.
        }

        // Cancellation freed the slot: a fresh read suspends instead of
        // reporting a concurrent read.
        {
            let mut third_buffer = Buffer::with_capacity(4);
            let third = client.read(&mut third_buffer);
            futures::pin_mut!(third);
            assert!(futures::poll!(third.as_mut()).is_pending());
        }

        client.close().await;
    });
    let _ = holder.join().unwrap();
}

#[test]
fn bulk_read_operator_errors_leave_the_connection_open() {
    init();
    let std_listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = std_listener.local_addr().unwrap().port();

    let (resume_peer, peer_gate) = mpsc::channel::<()>();
    let peer = thread::spawn(move || {
        let (mut peer, _) = std_listener.accept().unwrap();
        peer.write_all(b"abcde").unwrap();
        peer_gate.recv().unwrap();
        peer.write_all(b"done").unwrap();
    });

    block_on(async {
        let client = TcpStream::connect("127.0.0.1", port).await.unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let handler_fired = fired.clone();
        client.set_exception_handler(move |_| {
            handler_fired.fetch_add(1, Ordering::SeqCst);
        });

        let mut buffer = Buffer::with_capacity(16);
        let outcome = client
            .bulk_read(&mut buffer, |_buf, _count| Err(Error::BufferUnderflow))
            .await;
        assert!(matches!(outcome, Err(Error::BufferUnderflow)));

        // The operator failure is the caller's alone.
        assert!(!client.is_closed());
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        resume_peer.send(()).unwrap();
        let mut rest = Buffer::with_capacity(16);
        let count = client.read(&mut rest).await.unwrap();
        assert!(count > 0);
        client.close().await;
    });
    peer.join().unwrap();
}

#[test]
fn writes_hit_the_wire_in_enqueue_order() {
    init();
    let std_listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = std_listener.local_addr().unwrap().port();

    let reader = thread::spawn(move || {
        let (mut peer, _) = std_listener.accept().unwrap();
        let mut bytes = Vec::new();
        peer.read_to_end(&mut bytes).unwrap();
        bytes
    });

    let expected = block_on(async {
        let client = TcpStream::connect("127.0.0.1", port).await.unwrap();
        let mut rng = rand::rng();
        let mut expected = Vec::new();
        let mut completions = Vec::new();
        for _ in 0..100 {
            let len = rng.random_range(1..=4096);
            let chunk: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            expected.extend_from_slice(&chunk);
            completions.push(client.send(Buffer::from_vec(chunk)));
        }
        for completion in completions {
            completion.await.unwrap();
        }
        client.close().await;
        expected
    });

    assert_eq!(reader.join().unwrap(), expected);
}

#[test]
fn large_buffer_write_round_trips() {
    init();
    let std_listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = std_listener.local_addr().unwrap().port();

    let reader = thread::spawn(move || {
        let (mut peer, _) = std_listener.accept().unwrap();
        let mut bytes = Vec::new();
        peer.read_to_end(&mut bytes).unwrap();
        bytes
    });

    let size = block_on(async {
        let client = TcpStream::connect("127.0.0.1", port).await.unwrap();
        // Twice the send buffer, forcing the stay-registered write path.
        let size = match client.get_option(SocketOption::SendBufferSize).unwrap() {
            OptionValue::Int(size) => size * 2,
            other => panic!("expected a size, got {:?}", other),
        };
        let mut buffer = Buffer::from_vec(payload(size));
        client.write(&mut buffer).await.unwrap();
        assert_eq!(buffer.cursor(), buffer.limit());
        client.close().await;
        size
    });

    assert_eq!(reader.join().unwrap(), payload(size));
}

#[test]
fn socket_options_narrow_to_typed_values() {
    init();
    let std_listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = std_listener.local_addr().unwrap().port();
    let holder = thread::spawn(move || std_listener.accept().unwrap());

    block_on(async {
        let client = TcpStream::connect("127.0.0.1", port).await.unwrap();

        assert!(client.set_option(SocketOption::NoDelay, OptionValue::Bool(true)));
        assert_eq!(
            client.get_option(SocketOption::NoDelay).unwrap(),
            OptionValue::Bool(true)
        );
        assert!(client.set_option(SocketOption::KeepAlive, OptionValue::Bool(true)));
        assert_eq!(
            client.get_option(SocketOption::KeepAlive).unwrap(),
            OptionValue::Bool(true)
        );

        // Mismatched kinds are refused without touching the socket.
        assert!(!client.set_option(SocketOption::NoDelay, OptionValue::Int(1)));

        match client.get_option(SocketOption::ReceiveBufferSize).unwrap() {
            OptionValue::Int(size) => assert!(size > 0),
            other => panic!("expected a size, got {:?}", other),
        }

        client.close().await;
    });
    let _ = holder.join().unwrap();
}
