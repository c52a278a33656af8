/// Errors surfaced directly by the engine's pure API.
///
/// Transport-level faults (socket errors, bad checksums, out-of-window
/// segments) never reach here; those are the session driver's concern and
/// are dropped with a log line per spec.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    /// `recv` was called but `rcv_queue` has no complete message at its head.
    #[error("no message ready to receive")]
    QueueEmpty,

    /// `send` was given a message that would require more than 255
    /// fragments to transmit.
    #[error("message of {0} bytes exceeds the maximum of 255 * mss")]
    MessageTooLarge(usize),

    /// `set_mtu` was given an MTU below `MIN_MTU`.
    #[error("mtu {0} is below the minimum of {}", crate::config::MIN_MTU)]
    MtuTooSmall(usize),
}
