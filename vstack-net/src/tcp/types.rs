//! Shared TCP vocabulary: endpoints, flows, states, timers, errors.

use std::fmt;

use smoltcp::wire::Ipv4Address;
use thiserror::Error;

pub type Port = u16;

/// One endpoint: address and port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Socket {
    pub addr: Ipv4Address,
    pub port: Port,
}

impl Socket {
    pub fn new(addr: Ipv4Address, port: Port) -> Self {
        Socket { addr, port }
    }
}

impl fmt::Display for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// The 4-tuple identifying a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flow {
    pub local: Socket,
    pub remote: Socket,
}

impl Flow {
    pub fn new(local: Socket, remote: Socket) -> Self {
        Flow { local, remote }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.local, self.remote)
    }
}

/// RFC 793 connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl State {
    /// Both sides have seen each other's sequence numbers.
    pub fn is_synchronized(self) -> bool {
        !matches!(self, State::Closed | State::Listen | State::SynSent | State::SynRcvd)
    }

    pub fn is_connected(self) -> bool {
        self == State::Established
    }

    /// `write` is accepted (possibly queued until ESTABLISHED).
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            State::Listen | State::SynSent | State::SynRcvd | State::Established | State::CloseWait
        )
    }

    /// Incoming segment text is still delivered upward.
    pub fn is_readable(self) -> bool {
        matches!(self, State::Established | State::FinWait1 | State::FinWait2)
    }

    pub fn is_closing(self) -> bool {
        matches!(
            self,
            State::FinWait1 | State::FinWait2 | State::Closing | State::LastAck | State::TimeWait
        )
    }

    pub fn is_closed(self) -> bool {
        self == State::Closed
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Closed => "CLOSED",
            State::Listen => "LISTEN",
            State::SynSent => "SYN-SENT",
            State::SynRcvd => "SYN-RCVD",
            State::Established => "ESTABLISHED",
            State::FinWait1 => "FIN-WAIT-1",
            State::FinWait2 => "FIN-WAIT-2",
            State::CloseWait => "CLOSE-WAIT",
            State::Closing => "CLOSING",
            State::LastAck => "LAST-ACK",
            State::TimeWait => "TIME-WAIT",
        };
        f.write_str(s)
    }
}

/// Per-connection timers multiplexed through the stack timer wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpTimer {
    /// Retransmission timeout.
    Rto,
    /// Delayed-ACK deadline.
    DelayedAck,
    /// Zero-window probe.
    Persist,
    /// Idle keepalive probe.
    Keepalive,
    /// 2·MSL linger before the flow is forgotten.
    TimeWait,
    /// Re-check after buffer-pool exhaustion.
    Retry,
}

/// Why a connection ended abnormally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer (or a local `abort`) reset the connection.
    Reset,
    /// The retransmission or handshake budget ran out.
    Timeout,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Reset => f.write_str("connection reset"),
            DisconnectReason::Timeout => f.write_str("connection timed out"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TcpError {
    #[error("operation not valid in state {0}")]
    InvalidState(State),
    #[error("port {0} already bound")]
    PortInUse(Port),
    #[error("no ephemeral port available")]
    NoPorts,
    #[error("buffer pool exhausted, stream congested")]
    NoBuffer,
}
