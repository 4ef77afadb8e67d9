use super::{
    initial_window, AckSample, CongestionControl, LossSignal, RecoveryAck, RetransmitTimeout,
};

/// Loss-based congestion control: slow start and congestion avoidance from
/// RFC 5681 with the NewReno fast recovery of RFC 6582.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReno {
    mss: u32,
    cwnd: u32,
    ssthresh: u32,
}

impl NewReno {
    pub fn new(mss: u32) -> Self {
        Self {
            mss,
            cwnd: initial_window(mss),
            ssthresh: u32::MAX,
        }
    }
}

impl CongestionControl for NewReno {
    fn init_window(&mut self, mss: u32, ssthresh: u32) {
        self.mss = mss;
        self.cwnd = initial_window(mss);
        self.ssthresh = ssthresh;
    }

    fn on_ack(&mut self, sample: &AckSample) {
        if self.cwnd < self.ssthresh {
            // Slow start
            self.cwnd = self.cwnd.saturating_add(sample.acked.min(self.mss));
        } else {
            // Congestion avoidance
            let increase = (self.mss as u64 * self.mss as u64 / self.cwnd.max(1) as u64).max(1);
            self.cwnd = self.cwnd.saturating_add(increase as u32);
        }
    }

    fn on_loss_signal(&mut self, signal: &LossSignal) {
        match signal.dupacks {
            3 => {
                if signal.new_recovery {
                    let flight = signal.flight.saturating_sub(signal.limited_transfer);
                    self.ssthresh = (flight / 2).max(2 * self.mss);
                }
                self.cwnd = self.ssthresh.saturating_add(3 * self.mss);
            }
            dupacks if dupacks > 3 => self.cwnd = self.cwnd.saturating_add(self.mss),
            // Limited transmit is granted by the sender, the window is untouched
            _ => {}
        }
    }

    fn on_recovery_ack(&mut self, ack: RecoveryAck) {
        match ack {
            RecoveryAck::Full { flight } => {
                self.cwnd = self.ssthresh.min(flight.max(self.mss) + self.mss);
            }
            RecoveryAck::Partial { acked } => {
                // Deflate by the newly acknowledged data, add back one MSS
                // if at least that much left the network
                self.cwnd = self.cwnd.saturating_sub(acked);
                if acked >= self.mss {
                    self.cwnd += self.mss;
                }
            }
        }
    }

    fn on_retransmit_timeout(&mut self, timeout: &RetransmitTimeout) {
        if timeout.first_transmission {
            self.ssthresh = (timeout.flight / 2).max(2 * self.mss);
        }
        self.cwnd = self.mss;
    }

    fn current_cwnd(&self) -> u32 {
        self.cwnd
    }

    fn current_ssthresh(&self) -> u32 {
        self.ssthresh
    }

    fn current_pacing_rate(&self) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::seq::SeqNumber;
    use tokio::time::Instant;

    const MSS: u32 = 1000;

    fn ack(acked: u32) -> AckSample {
        AckSample {
            acked,
            flight: 0,
            rtt: None,
            srtt: None,
            dupacks: 0,
            ack: SeqNumber::new(0),
            snd_next: SeqNumber::new(0),
            now: Instant::now(),
        }
    }

    fn reno(cwnd: u32, ssthresh: u32) -> NewReno {
        NewReno {
            mss: MSS,
            cwnd,
            ssthresh,
        }
    }

    #[test]
    fn slow_start_grows_by_at_most_one_mss() {
        let mut cc = reno(4 * MSS, 100 * MSS);
        cc.on_ack(&ack(3 * MSS));
        assert_eq!(cc.current_cwnd(), 5 * MSS);
        cc.on_ack(&ack(10));
        assert_eq!(cc.current_cwnd(), 5 * MSS + 10);
    }

    #[test]
    fn congestion_avoidance_grows_by_mss_squared_over_cwnd() {
        let mut cc = reno(10 * MSS, 10 * MSS);
        cc.on_ack(&ack(MSS));
        assert_eq!(cc.current_cwnd(), 10 * MSS + MSS / 10);

        // Never less than a byte
        let mut cc = reno(u32::MAX / 2, 1);
        cc.on_ack(&ack(MSS));
        assert_eq!(cc.current_cwnd(), u32::MAX / 2 + 1);
    }

    #[test]
    fn third_duplicate_enters_fast_recovery() {
        let mut cc = reno(20 * MSS, u32::MAX);
        for dupacks in 1..=2 {
            cc.on_loss_signal(&LossSignal {
                dupacks,
                flight: 20 * MSS,
                limited_transfer: 0,
                new_recovery: false,
            });
        }
        assert_eq!(cc.current_cwnd(), 20 * MSS);

        cc.on_loss_signal(&LossSignal {
            dupacks: 3,
            flight: 22 * MSS,
            limited_transfer: 2 * MSS,
            new_recovery: true,
        });
        assert_eq!(cc.current_ssthresh(), 10 * MSS);
        assert_eq!(cc.current_cwnd(), 13 * MSS);

        cc.on_loss_signal(&LossSignal {
            dupacks: 4,
            flight: 22 * MSS,
            limited_transfer: 2 * MSS,
            new_recovery: false,
        });
        assert_eq!(cc.current_cwnd(), 14 * MSS);
    }

    #[test]
    fn stale_third_duplicate_keeps_ssthresh() {
        let mut cc = reno(20 * MSS, 6 * MSS);
        cc.on_loss_signal(&LossSignal {
            dupacks: 3,
            flight: 20 * MSS,
            limited_transfer: 0,
            new_recovery: false,
        });
        assert_eq!(cc.current_ssthresh(), 6 * MSS);
        assert_eq!(cc.current_cwnd(), 9 * MSS);
    }

    #[test]
    fn recovery_acks() {
        let mut cc = reno(13 * MSS, 10 * MSS);
        cc.on_recovery_ack(RecoveryAck::Partial { acked: 2 * MSS });
        assert_eq!(cc.current_cwnd(), 12 * MSS);
        cc.on_recovery_ack(RecoveryAck::Partial { acked: MSS / 2 });
        assert_eq!(cc.current_cwnd(), 12 * MSS - MSS / 2);

        cc.on_recovery_ack(RecoveryAck::Full { flight: 3 * MSS });
        assert_eq!(cc.current_cwnd(), 4 * MSS);
        cc.on_recovery_ack(RecoveryAck::Full { flight: 30 * MSS });
        assert_eq!(cc.current_cwnd(), 10 * MSS);
    }

    #[test]
    fn timeout_restarts_slow_start() {
        let mut cc = reno(40 * MSS, u32::MAX);
        cc.on_retransmit_timeout(&RetransmitTimeout {
            flight: 30 * MSS,
            first_transmission: true,
        });
        assert_eq!(cc.current_cwnd(), MSS);
        assert_eq!(cc.current_ssthresh(), 15 * MSS);

        // A second timeout on the same segment keeps ssthresh
        cc.on_retransmit_timeout(&RetransmitTimeout {
            flight: MSS,
            first_transmission: false,
        });
        assert_eq!(cc.current_cwnd(), MSS);
        assert_eq!(cc.current_ssthresh(), 15 * MSS);

        cc.on_retransmit_timeout(&RetransmitTimeout {
            flight: MSS,
            first_transmission: true,
        });
        assert_eq!(cc.current_ssthresh(), 2 * MSS);
    }
}
