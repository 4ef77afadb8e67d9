use std::{fmt, ops::BitOr};

/// The state of a connection, RFC 793 section 3.2.
///
/// Each state is a distinct bit so that transitions can test membership in
/// a disjunction of states with [`State::is_any_of`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum State {
    /// No connection. A TCB in this state is about to be removed.
    Closed = 1 << 0,
    /// Waiting for a connection request. Listening is handled by the
    /// listener table, no TCB is ever in this state.
    Listen = 1 << 1,
    /// Sent a connection request, waiting for a matching one.
    SynSent = 1 << 2,
    /// Received and sent a connection request, waiting for the
    /// acknowledgment of ours.
    SynReceived = 1 << 3,
    /// Data flows both ways.
    Established = 1 << 4,
    /// Sent FIN, waiting for its acknowledgment or the peer's FIN.
    FinWait1 = 1 << 5,
    /// Our FIN is acknowledged, waiting for the peer's FIN.
    FinWait2 = 1 << 6,
    /// The peer sent FIN, waiting for the local user to close.
    CloseWait = 1 << 7,
    /// Both sides sent FIN at once, waiting for the acknowledgment of ours.
    Closing = 1 << 8,
    /// Closed after the peer did, waiting for the acknowledgment of our FIN.
    LastAck = 1 << 9,
    /// Both FINs are acknowledged, waiting out stray segments.
    TimeWait = 1 << 10,
}

impl State {
    pub fn is_any_of(self, states: impl Into<StateSet>) -> bool {
        states.into().0 & self as u16 != 0
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Closed => "CLOSED",
            State::Listen => "LISTEN",
            State::SynSent => "SYN-SENT",
            State::SynReceived => "SYN-RECEIVED",
            State::Established => "ESTABLISHED",
            State::FinWait1 => "FIN-WAIT-1",
            State::FinWait2 => "FIN-WAIT-2",
            State::CloseWait => "CLOSE-WAIT",
            State::Closing => "CLOSING",
            State::LastAck => "LAST-ACK",
            State::TimeWait => "TIME-WAIT",
        };
        f.write_str(name)
    }
}

/// A set of [`State`]s, built with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StateSet(u16);

impl From<State> for StateSet {
    fn from(state: State) -> Self {
        Self(state as u16)
    }
}

impl BitOr for State {
    type Output = StateSet;

    fn bitor(self, rhs: State) -> StateSet {
        StateSet(self as u16 | rhs as u16)
    }
}

impl BitOr<State> for StateSet {
    type Output = StateSet;

    fn bitor(self, rhs: State) -> StateSet {
        StateSet(self.0 | rhs as u16)
    }
}
