mod listener;
mod stream;
mod writer;

pub use self::listener::TcpListener;
pub use self::stream::{OptionValue, SocketOption, TcpStream};
