/// Associates a registered file descriptor with the events fired for it.
///
/// Tokens are handed out by the reactor when a socket is registered and are
/// never reused while the registration is alive; the value `usize::MAX` is
/// reserved for the reactor's own wakeup channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Token(pub usize);

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}
