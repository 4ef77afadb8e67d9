//! Congestion control.
//!
//! A [`Tcb`](super::tcb::Tcb) owns one [`CongestionControl`] object and feeds
//! it acknowledgment, loss and timeout signals without knowing which
//! algorithm sits behind it. The algorithm is picked once per [`Tcp`]
//! instance through [`CongestionMechanism`].
//!
//! [`Tcp`]: super::Tcp

use super::seq::SeqNumber;
use std::{fmt, str::FromStr, time::Duration};
use thiserror::Error as ThisError;
use tokio::time::Instant;

mod bbr;
pub use bbr::{Bbr, BbrMode};

mod new_reno;
pub use new_reno::NewReno;

/// Newly acknowledged data. Reported once per retransmission-queue entry
/// the acknowledgment covers, fully or partially.
#[derive(Debug, Clone, Copy)]
pub struct AckSample {
    /// Bytes acknowledged from this entry
    pub acked: u32,
    /// Bytes still in flight after removing the acknowledged ones
    pub flight: u32,
    /// Round trip measured on this entry, absent for retransmitted entries
    pub rtt: Option<Duration>,
    /// The smoothed round trip time of the connection, once measured
    pub srtt: Option<Duration>,
    /// Duplicate acknowledgments counted before this one
    pub dupacks: u16,
    /// The cumulative acknowledgment carried by the segment
    pub ack: SeqNumber,
    /// The next sequence number the sender will use
    pub snd_next: SeqNumber,
    pub now: Instant,
}

/// A duplicate acknowledgment.
#[derive(Debug, Clone, Copy)]
pub struct LossSignal {
    /// Duplicate acknowledgments counted so far, this one included
    pub dupacks: u16,
    pub flight: u32,
    /// Bytes sent under limited transmit during this episode
    pub limited_transfer: u32,
    /// Whether the third duplicate started a new recovery episode. False
    /// when the loss was already covered by the previous recovery point.
    pub new_recovery: bool,
}

/// An acknowledgment that advanced the send window during fast recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAck {
    /// Everything up to the recovery point is acknowledged
    Full { flight: u32 },
    /// Some data below the recovery point is still missing
    Partial { acked: u32 },
}

/// The retransmission timer expired on data.
#[derive(Debug, Clone, Copy)]
pub struct RetransmitTimeout {
    pub flight: u32,
    /// Whether the oldest unacknowledged segment had not been retransmitted
    /// before this timeout
    pub first_transmission: bool,
}

/// A congestion control algorithm driving a single connection.
pub trait CongestionControl: fmt::Debug + Send {
    /// Resets the window once the peer's MSS and window are known.
    fn init_window(&mut self, mss: u32, ssthresh: u32);

    fn on_ack(&mut self, sample: &AckSample);

    fn on_loss_signal(&mut self, signal: &LossSignal);

    fn on_recovery_ack(&mut self, ack: RecoveryAck);

    fn on_retransmit_timeout(&mut self, timeout: &RetransmitTimeout);

    /// The congestion window in bytes.
    fn current_cwnd(&self) -> u32;

    fn current_ssthresh(&self) -> u32;

    /// Pacing rate in bytes per second, for algorithms that pace.
    fn current_pacing_rate(&self) -> Option<u64>;
}

/// The initial window for a sender MSS, RFC 5681 section 3.1.
pub fn initial_window(mss: u32) -> u32 {
    if mss > 2190 {
        2 * mss
    } else if mss > 1095 {
        3 * mss
    } else {
        4 * mss
    }
}

/// Selects the congestion control algorithm for every connection of a
/// [`Tcp`](super::Tcp) instance.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum CongestionMechanism {
    /// Loss-based AIMD with fast retransmit and NewReno fast recovery
    #[default]
    #[value(alias = "reno", alias = "tcp_bic")]
    NewReno,
    /// Model-based bandwidth and round trip estimation
    #[value(alias = "tcp_bbr")]
    Bbr,
}

impl CongestionMechanism {
    /// Creates the algorithm for a new connection. `seed` feeds the
    /// randomized parts of the algorithm.
    pub fn build(self, mss: u32, seed: u64) -> Box<dyn CongestionControl> {
        match self {
            Self::NewReno => Box::new(NewReno::new(mss)),
            Self::Bbr => Box::new(Bbr::new(mss, seed)),
        }
    }
}

impl fmt::Display for CongestionMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewReno => write!(f, "newreno"),
            Self::Bbr => write!(f, "bbr"),
        }
    }
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
#[error("Unknown congestion control mechanism {0:?}")]
pub struct UnknownMechanism(pub String);

impl FromStr for CongestionMechanism {
    type Err = UnknownMechanism;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "newreno" | "reno" | "tcp_bic" | "bic" => Ok(Self::NewReno),
            "bbr" | "tcp_bbr" => Ok(Self::Bbr),
            _ => Err(UnknownMechanism(s.to_string())),
        }
    }
}
