// Not all functions are used by all tests.
#![allow(dead_code)]

use std::sync::Once;

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    })
}

/// The reference payload pattern used by the large-transfer tests.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i & 0xff) as u8).collect()
}

/// A loopback port with nothing listening on it.
///
/// Binding and immediately dropping a listener reserves a port number the
/// kernel will not hand out again right away.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("unable to bind");
    listener.local_addr().expect("unable to read address").port()
}
