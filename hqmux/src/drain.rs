//! Graceful-shutdown state machine.
//!
//! Dialects with a control stream drain through a two-GOAWAY handshake:
//! the first GOAWAY advertises the maximum representable stream id, and
//! once the peer acknowledges its delivery a second GOAWAY narrows the
//! limit to the streams actually accepted. The legacy framed v1 dialect
//! has no control stream and drains through `Connection: close` headers
//! in either direction.
//!
//! Transitions are monotone: repeated shutdown requests and repeated
//! inbound GOAWAYs never move the state backwards.

/// Drain progress for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DrainState {
    /// Not draining.
    None,

    /// Shutdown requested; no GOAWAY (or close header) sent yet.
    Pending,

    /// Legacy v1 only: we sent a message with `Connection: close`.
    CloseSent,

    /// Legacy v1 only: we received a message with `Connection: close`.
    CloseReceived,

    /// First GOAWAY queued, delivery callback armed.
    FirstGoaway,

    /// First GOAWAY acknowledged, second (narrower) GOAWAY queued.
    SecondGoaway,

    /// Fully drained; the session destroys itself once no streams remain.
    Done,
}

impl DrainState {
    pub fn is_draining(self) -> bool {
        self != DrainState::None
    }

    pub fn is_done(self) -> bool {
        self == DrainState::Done
    }

    /// Whether new locally-initiated transactions are still allowed.
    pub fn allows_new_transactions(self) -> bool {
        !matches!(
            self,
            DrainState::CloseSent
                | DrainState::FirstGoaway
                | DrainState::SecondGoaway
                | DrainState::Done
        )
    }
}

impl std::fmt::Display for DrainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DrainState::None => "NONE",
            DrainState::Pending => "PENDING",
            DrainState::CloseSent => "CLOSE_SENT",
            DrainState::CloseReceived => "CLOSE_RECEIVED",
            DrainState::FirstGoaway => "FIRST_GOAWAY",
            DrainState::SecondGoaway => "SECOND_GOAWAY",
            DrainState::Done => "DONE",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_transactions_refused_once_committed() {
        assert!(DrainState::None.allows_new_transactions());
        assert!(DrainState::Pending.allows_new_transactions());
        assert!(DrainState::CloseReceived.allows_new_transactions());
        assert!(!DrainState::CloseSent.allows_new_transactions());
        assert!(!DrainState::FirstGoaway.allows_new_transactions());
        assert!(!DrainState::SecondGoaway.allows_new_transactions());
        assert!(!DrainState::Done.allows_new_transactions());
    }

    #[test]
    fn ordering_reflects_progress() {
        assert!(DrainState::None < DrainState::Pending);
        assert!(DrainState::Pending < DrainState::FirstGoaway);
        assert!(DrainState::FirstGoaway < DrainState::SecondGoaway);
        assert!(DrainState::SecondGoaway < DrainState::Done);
    }
}
