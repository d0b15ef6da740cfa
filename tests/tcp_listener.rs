use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures::executor::block_on;

use asock::net::{TcpListener, TcpStream};
use asock::{Buffer, Error};

mod util;
use util::init;

#[test]
fn address_in_use_is_reported() {
    init();
    let first = TcpListener::bind("127.0.0.1", 0).unwrap();
    let port = first.local_addr().unwrap().port();

    match TcpListener::bind("127.0.0.1", port) {
        Err(Error::AddressInUse) => {}
        other => panic!("expected AddressInUse, got {:?}", other),
    }
    first.close();
}

#[test]
fn accept_hands_out_wired_streams() {
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

        assert_eq!(server.peer_addr().unwrap(), client.local_addr().unwrap());
        assert_eq!(client.peer_addr().unwrap().port(), port);

        let mut ping = Buffer::from_vec(b"ping".to_vec());
        client.write(&mut ping).await.unwrap();

        let mut got = Buffer::with_capacity(4);
        while got.has_remaining() {
            server.read(&mut got).await.unwrap();
        }
        assert_eq!(got.to_vec(), b"ping");

        server.close().await;
        client.close().await;
    });
    listener.close();
}

#[test]
fn close_cancels_a_suspended_accept() {
    init();
    let listener = Arc::new(TcpListener::bind("127.0.0.1", 0).unwrap());

    let acceptor = {
        let listener = listener.clone();
        thread::spawn(move || {
            block_on(async move {
                match listener.accept().await {
                    Err(err) => err,
                    Ok(_) => panic!("nobody connects in this test"),
                }
            })
        })
    };

    // Let the accept suspend before pulling the rug.
    thread::sleep(Duration::from_millis(50));
    listener.close();

    let err = acceptor.join().unwrap();
    assert!(matches!(err, Error::NormalClose));

    // Closed means closed.
    block_on(async {
        match listener.accept().await {
            Err(Error::SocketClosed) => {}
            other => panic!("expected SocketClosed, got {:?}", other),
        }
    });
}
