use std::io;
use std::sync::Arc;

/// Errors surfaced by the public session/listener API.
///
/// Internal losses (socket write failures, malformed or unauthenticated
/// datagrams, out-of-window segments) never produce one of these; they are
/// logged once and dropped, per spec.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// An operation was attempted on a session that has already closed.
    #[error("operation on a closed session")]
    BrokenPipe,

    /// A read deadline elapsed with no data available.
    #[error("read timed out")]
    Timeout,

    /// `accept` was called on a listener that has already stopped.
    #[error("listener has stopped accepting connections")]
    ListenerStopped,

    /// The address passed to `Dial`/`Listen` could not be resolved.
    #[error("could not resolve address {0:?}")]
    AddressResolutionFailed(String),

    /// Binding the local UDP socket failed.
    #[error("failed to bind socket: {0}")]
    SocketBindFailed(Arc<io::Error>),

    /// Passthrough for I/O failures that do not fit a more specific variant.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// A configuration knob (e.g. `SetMtu`) was rejected by the engine.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Io(Arc::new(value))
    }
}
