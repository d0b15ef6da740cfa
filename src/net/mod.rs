//! Networking primitives: suspending TCP streams and listeners.

mod tcp;

pub use self::tcp::{OptionValue, SocketOption, TcpListener, TcpStream};
