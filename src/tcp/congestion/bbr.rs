//! Model-based congestion control after BBR: the window and pacing rate
//! follow an estimate of the path's bottleneck bandwidth and round trip
//! propagation time instead of reacting to loss.

use super::{
    initial_window, AckSample, CongestionControl, LossSignal, RecoveryAck, RetransmitTimeout,
};
use crate::tcp::seq::SeqNumber;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{collections::VecDeque, time::Duration};
use tokio::time::Instant;

/// Number of phases in a ProbeBw gain cycle
const CYCLE_LEN: usize = 8;
/// Starting phases are drawn from the last `CYCLE_RAND` entries
const CYCLE_RAND: usize = 7;
/// Bandwidth samples are kept for this many round trips
const BW_FILTER_ROUNDS: u64 = CYCLE_LEN as u64 + 2;
const MIN_RTT_WINDOW: Duration = Duration::from_secs(10);
const PROBE_RTT_DURATION: Duration = Duration::from_millis(200);
/// 2/ln(2), the smallest gain that doubles the sending rate every round
const HIGH_GAIN: f64 = 2.885;
const DRAIN_GAIN: f64 = 1.0 / HIGH_GAIN;
const CWND_GAIN: f64 = 2.0;
const PACING_GAIN: [f64; CYCLE_LEN] = [1.25, 0.75, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
/// The window never drops below this many segments
const CWND_MIN_TARGET: u32 = 4;
const FULL_BW_THRESH: f64 = 1.25;
const FULL_BW_COUNT: u32 = 3;
/// Bytes per second
const MAX_PACING_RATE: u64 = 2_000_000_000_000;
/// Upper bound on the window, in segments
const CWND_CLAMP: u64 = 100_000;
/// Assumed round trip until the first measurement
const INITIAL_RTT: Duration = Duration::from_micros(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BbrMode {
    /// Ramp up quickly to fill the pipe
    Startup,
    /// Drain the queue created during startup
    Drain,
    /// Cycle the pacing gain around the estimated bandwidth
    ProbeBw,
    /// Shrink the window to re-measure the propagation delay
    ProbeRtt,
}

#[derive(Debug)]
pub struct Bbr {
    mss: u32,
    mode: BbrMode,
    cwnd: u32,
    /// The last known-good window, restored after recovery or ProbeRtt
    prior_cwnd: u32,
    pacing_rate: u64,
    pacing_gain: f64,
    cwnd_gain: f64,
    has_seen_rtt: bool,

    /// `(round, bytes per second)` samples inside the filter window
    bw_samples: VecDeque<(u64, u64)>,
    delivered: u64,
    round_count: u64,
    round_start: bool,
    /// A round ends once this sequence number is acknowledged
    round_end: Option<SeqNumber>,
    round_stamp: Option<Instant>,
    round_delivered: u64,

    min_rtt: Option<Duration>,
    min_rtt_stamp: Option<Instant>,
    probe_rtt_done_stamp: Option<Instant>,
    probe_rtt_round_done: bool,

    cycle_idx: usize,
    cycle_stamp: Option<Instant>,

    full_bw: u64,
    full_bw_count: u32,
    full_bw_reached: bool,

    in_recovery: bool,
    rng: SmallRng,
}

impl Bbr {
    pub fn new(mss: u32, seed: u64) -> Self {
        let mut bbr = Self {
            mss,
            mode: BbrMode::Startup,
            cwnd: initial_window(mss),
            prior_cwnd: 0,
            pacing_rate: 0,
            pacing_gain: HIGH_GAIN,
            cwnd_gain: HIGH_GAIN,
            has_seen_rtt: false,
            bw_samples: VecDeque::new(),
            delivered: 0,
            round_count: 0,
            round_start: false,
            round_end: None,
            round_stamp: None,
            round_delivered: 0,
            min_rtt: None,
            min_rtt_stamp: None,
            probe_rtt_done_stamp: None,
            probe_rtt_round_done: false,
            cycle_idx: 0,
            cycle_stamp: None,
            full_bw: 0,
            full_bw_count: 0,
            full_bw_reached: false,
            in_recovery: false,
            rng: SmallRng::seed_from_u64(seed),
        };
        bbr.init_pacing_rate(None);
        bbr
    }

    pub fn mode(&self) -> BbrMode {
        self.mode
    }

    /// The bottleneck bandwidth estimate in bytes per second.
    pub fn max_bandwidth(&self) -> u64 {
        self.bw_samples.iter().map(|&(_, bw)| bw).max().unwrap_or(0)
    }

    pub fn min_rtt(&self) -> Option<Duration> {
        self.min_rtt
    }

    fn min_target(&self) -> u32 {
        CWND_MIN_TARGET * self.mss
    }

    /// The window that keeps `gain` times the bandwidth-delay product in
    /// flight, plus one segment.
    fn target_cwnd(&self, bw: u64, gain: f64) -> u32 {
        let Some(min_rtt) = self.min_rtt else {
            return initial_window(self.mss);
        };
        let bdp = bw as f64 * min_rtt.as_secs_f64();
        let target = (bdp * gain) as u64 + self.mss as u64;
        target.min(u32::MAX as u64) as u32
    }

    fn init_pacing_rate(&mut self, rtt: Option<Duration>) {
        let rtt = rtt.unwrap_or(INITIAL_RTT).max(Duration::from_micros(1));
        let rate = HIGH_GAIN * self.cwnd as f64 / rtt.as_secs_f64();
        self.pacing_rate = (rate as u64).min(MAX_PACING_RATE);
    }

    fn set_pacing_rate(&mut self, rtt: Option<Duration>) {
        let rate = ((self.max_bandwidth() as f64 * self.pacing_gain) as u64).min(MAX_PACING_RATE);
        if !self.has_seen_rtt && rtt.is_some() {
            self.has_seen_rtt = true;
            self.init_pacing_rate(rtt);
        }
        if self.full_bw_reached || rate > self.pacing_rate {
            self.pacing_rate = rate;
        }
    }

    fn save_cwnd(&mut self) {
        self.prior_cwnd = if !self.in_recovery && self.mode != BbrMode::ProbeRtt {
            self.cwnd
        } else {
            self.prior_cwnd.max(self.cwnd)
        };
    }

    fn restore_cwnd(&mut self) {
        self.cwnd = self.cwnd.max(self.prior_cwnd);
    }

    fn reset_startup(&mut self) {
        self.mode = BbrMode::Startup;
        self.pacing_gain = HIGH_GAIN;
        self.cwnd_gain = HIGH_GAIN;
    }

    fn reset_probe_bw(&mut self, now: Instant) {
        self.mode = BbrMode::ProbeBw;
        self.cwnd_gain = CWND_GAIN;
        self.cycle_idx = CYCLE_LEN - 1 - self.rng.gen_range(0..CYCLE_RAND);
        self.advance_cycle_phase(now);
    }

    fn reset_mode(&mut self, now: Instant) {
        if self.full_bw_reached {
            self.reset_probe_bw(now);
        } else {
            self.reset_startup();
        }
    }

    fn advance_cycle_phase(&mut self, now: Instant) {
        self.cycle_idx = (self.cycle_idx + 1) % CYCLE_LEN;
        self.cycle_stamp = Some(now);
        self.pacing_gain = PACING_GAIN[self.cycle_idx];
    }

    fn is_next_cycle_phase(&self, sample: &AckSample) -> bool {
        let min_rtt = self.min_rtt.unwrap_or_default();
        let is_full_length = self
            .cycle_stamp
            .map_or(true, |stamp| sample.now.saturating_duration_since(stamp) > min_rtt);
        let gain = PACING_GAIN[self.cycle_idx];
        if gain > 1.0 {
            // Probing up ends after a full phase once the pipe holds the
            // extra data or loss shows it cannot
            let losing = sample.dupacks > 0 || self.in_recovery;
            is_full_length
                && (losing || sample.flight >= self.target_cwnd(self.max_bandwidth(), gain))
        } else if gain < 1.0 {
            // Draining ends early once the queue is gone
            is_full_length || sample.flight <= self.target_cwnd(self.max_bandwidth(), 1.0)
        } else {
            is_full_length
        }
    }

    fn update_bw(&mut self, sample: &AckSample) {
        self.round_start = false;
        self.delivered += sample.acked as u64;
        self.round_delivered += sample.acked as u64;

        match (self.round_stamp, self.round_end) {
            (Some(stamp), Some(end)) if sample.ack >= end => {
                self.round_start = true;
                self.round_count += 1;
                let elapsed = sample.now.saturating_duration_since(stamp);
                if !elapsed.is_zero() {
                    let bw = self.round_delivered as f64 / elapsed.as_secs_f64();
                    self.bw_samples.push_back((self.round_count, bw as u64));
                }
                self.round_delivered = 0;
                self.round_stamp = Some(sample.now);
                self.round_end = Some(sample.snd_next);
            }
            (Some(_), Some(_)) => {}
            _ => {
                // Data acknowledged before the first round started is not
                // part of any sample
                self.round_delivered = 0;
                self.round_stamp = Some(sample.now);
                self.round_end = Some(sample.snd_next);
            }
        }

        while let Some(&(round, _)) = self.bw_samples.front() {
            if round + BW_FILTER_ROUNDS <= self.round_count {
                self.bw_samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn check_full_bw_reached(&mut self) {
        if self.full_bw_reached || !self.round_start {
            return;
        }
        let max_bw = self.max_bandwidth();
        if max_bw as f64 >= self.full_bw as f64 * FULL_BW_THRESH {
            self.full_bw = max_bw;
            self.full_bw_count = 0;
            return;
        }
        self.full_bw_count += 1;
        self.full_bw_reached = self.full_bw_count >= FULL_BW_COUNT;
    }

    fn check_drain(&mut self, sample: &AckSample) {
        if self.mode == BbrMode::Startup && self.full_bw_reached {
            self.mode = BbrMode::Drain;
            self.pacing_gain = DRAIN_GAIN;
            self.cwnd_gain = HIGH_GAIN;
        }
        if self.mode == BbrMode::Drain
            && sample.flight <= self.target_cwnd(self.max_bandwidth(), 1.0)
        {
            self.reset_probe_bw(sample.now);
        }
    }

    fn update_min_rtt(&mut self, sample: &AckSample) {
        let now = sample.now;
        let expired = self
            .min_rtt_stamp
            .map_or(false, |stamp| now > stamp + MIN_RTT_WINDOW);
        if let Some(rtt) = sample.rtt.or(sample.srtt) {
            if expired || self.min_rtt.map_or(true, |min| rtt <= min) {
                self.min_rtt = Some(rtt);
                self.min_rtt_stamp = Some(now);
            }
        }

        if expired && self.mode != BbrMode::ProbeRtt {
            self.save_cwnd();
            self.mode = BbrMode::ProbeRtt;
            self.pacing_gain = 1.0;
            self.cwnd_gain = 1.0;
            self.probe_rtt_done_stamp = None;
        }

        if self.mode == BbrMode::ProbeRtt {
            match self.probe_rtt_done_stamp {
                None if sample.flight <= self.min_target() => {
                    self.probe_rtt_done_stamp = Some(now + PROBE_RTT_DURATION);
                    self.probe_rtt_round_done = false;
                    self.round_end = Some(sample.snd_next);
                }
                None => {}
                Some(done) => {
                    if self.round_start {
                        self.probe_rtt_round_done = true;
                    }
                    if self.probe_rtt_round_done && now > done {
                        self.min_rtt_stamp = Some(now);
                        self.restore_cwnd();
                        self.reset_mode(now);
                    }
                }
            }
        }
    }

    fn update_model(&mut self, sample: &AckSample) {
        self.update_bw(sample);
        if self.mode == BbrMode::ProbeBw && self.is_next_cycle_phase(sample) {
            self.advance_cycle_phase(sample.now);
        }
        self.check_full_bw_reached();
        self.check_drain(sample);
        self.update_min_rtt(sample);
    }

    fn set_cwnd(&mut self, sample: &AckSample) {
        if self.in_recovery {
            // Packet conservation. Lost bytes are not subtracted from the
            // window.
            self.cwnd = self.cwnd.max(sample.flight.saturating_add(sample.acked));
        } else {
            let target = self.target_cwnd(self.max_bandwidth(), self.cwnd_gain);
            if self.full_bw_reached {
                self.cwnd = self.cwnd.saturating_add(sample.acked).min(target);
            } else if self.cwnd < target || self.delivered < initial_window(self.mss) as u64 {
                self.cwnd = self.cwnd.saturating_add(sample.acked);
            }
            self.cwnd = self.cwnd.max(self.min_target());
        }

        let clamp = (CWND_CLAMP * self.mss as u64).min(u32::MAX as u64) as u32;
        self.cwnd = self.cwnd.min(clamp);
        if self.mode == BbrMode::ProbeRtt {
            self.cwnd = self.cwnd.min(self.min_target());
        }
    }

    fn exit_recovery(&mut self) {
        if self.in_recovery {
            self.in_recovery = false;
            self.restore_cwnd();
        }
    }
}

impl CongestionControl for Bbr {
    fn init_window(&mut self, mss: u32, _ssthresh: u32) {
        self.mss = mss;
        self.cwnd = initial_window(mss);
        self.init_pacing_rate(self.min_rtt);
    }

    fn on_ack(&mut self, sample: &AckSample) {
        if sample.dupacks == 0 {
            self.exit_recovery();
        }
        self.update_model(sample);
        self.set_pacing_rate(sample.rtt.or(sample.srtt));
        self.set_cwnd(sample);
    }

    fn on_loss_signal(&mut self, signal: &LossSignal) {
        if signal.dupacks == 3 && !self.in_recovery {
            self.save_cwnd();
            self.in_recovery = true;
        }
    }

    fn on_recovery_ack(&mut self, ack: RecoveryAck) {
        if let RecoveryAck::Full { .. } = ack {
            self.exit_recovery();
        }
    }

    fn on_retransmit_timeout(&mut self, _timeout: &RetransmitTimeout) {
        self.save_cwnd();
    }

    fn current_cwnd(&self) -> u32 {
        self.cwnd
    }

    /// Unused by the model, reported as unbounded.
    fn current_ssthresh(&self) -> u32 {
        u32::MAX
    }

    fn current_pacing_rate(&self) -> Option<u64> {
        Some(self.pacing_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSS: u32 = 1460;

    /// Feeds acknowledgments that each close one round trip.
    struct Driver {
        bbr: Bbr,
        now: Instant,
        acks: u32,
    }

    impl Driver {
        fn new() -> Self {
            Self {
                bbr: Bbr::new(MSS, 7),
                now: Instant::now(),
                acks: 0,
            }
        }

        fn ack(&mut self, after: Duration, acked: u32, flight: u32, rtt: Duration) {
            self.now += after;
            let sample = AckSample {
                acked,
                flight,
                rtt: Some(rtt),
                srtt: Some(rtt),
                dupacks: 0,
                ack: SeqNumber::new(self.acks * 100_000),
                snd_next: SeqNumber::new((self.acks + 1) * 100_000),
                now: self.now,
            };
            self.acks += 1;
            self.bbr.on_ack(&sample);
        }
    }

    #[test]
    fn starts_with_high_gain() {
        let bbr = Bbr::new(MSS, 1);
        assert_eq!(bbr.mode(), BbrMode::Startup);
        assert_eq!(bbr.current_cwnd(), 3 * MSS);
        // high gain * cwnd / 1 ms
        let expected = (HIGH_GAIN * (3 * MSS) as f64 / 0.001) as u64;
        assert_eq!(bbr.current_pacing_rate(), Some(expected));
    }

    #[test]
    fn startup_grows_window_while_bandwidth_grows() {
        let mut driver = Driver::new();
        let rtt = Duration::from_millis(10);
        let mut acked = 10 * MSS;
        for _ in 0..5 {
            driver.ack(rtt, acked, acked, rtt);
            acked *= 2;
        }
        assert_eq!(driver.bbr.mode(), BbrMode::Startup);
        assert!(driver.bbr.current_cwnd() > 3 * MSS);
        assert!(!driver.bbr.full_bw_reached);
    }

    #[test]
    fn flat_bandwidth_fills_pipe_then_drains_into_probe_bw() {
        let mut driver = Driver::new();
        let rtt = Duration::from_millis(10);
        // 10 kB per 10 ms is 1 MB/s: the estimate stops growing
        for _ in 0..4 {
            driver.ack(rtt, 10_000, 100_000, rtt);
        }
        assert_eq!(driver.bbr.mode(), BbrMode::Startup);
        driver.ack(rtt, 10_000, 100_000, rtt);
        assert!(driver.bbr.full_bw_reached);
        assert_eq!(driver.bbr.mode(), BbrMode::Drain);
        assert_eq!(driver.bbr.max_bandwidth(), 1_000_000);

        // The bandwidth-delay product is 10 kB, so 5 kB in flight is drained
        driver.ack(rtt, 10_000, 5_000, rtt);
        assert_eq!(driver.bbr.mode(), BbrMode::ProbeBw);
        assert_eq!(driver.bbr.cwnd_gain, CWND_GAIN);
        assert_ne!(driver.bbr.cycle_idx, 1);
    }

    #[test]
    fn stale_min_rtt_enters_probe_rtt() {
        let mut driver = Driver::new();
        driver.ack(Duration::ZERO, MSS, 50 * MSS, Duration::from_millis(10));
        assert_eq!(driver.bbr.min_rtt(), Some(Duration::from_millis(10)));

        // Larger samples never refresh the filter
        for _ in 0..100 {
            driver.ack(
                Duration::from_millis(100),
                100 * MSS,
                50 * MSS,
                Duration::from_millis(20),
            );
        }
        assert_ne!(driver.bbr.mode(), BbrMode::ProbeRtt);
        let before = driver.bbr.current_cwnd();
        assert!(before > CWND_MIN_TARGET * MSS);

        driver.ack(
            Duration::from_millis(100),
            100 * MSS,
            50 * MSS,
            Duration::from_millis(20),
        );
        assert_eq!(driver.bbr.mode(), BbrMode::ProbeRtt);
        assert_eq!(driver.bbr.current_cwnd(), CWND_MIN_TARGET * MSS);
        assert_eq!(driver.bbr.prior_cwnd, before);

        // In-flight data drops to the cap: the 200 ms hold starts here
        let rtt = Duration::from_millis(20);
        driver.ack(Duration::from_millis(10), 15 * MSS, 2 * MSS, rtt);
        for _ in 0..19 {
            driver.ack(Duration::from_millis(10), 15 * MSS, 2 * MSS, rtt);
            assert_eq!(driver.bbr.mode(), BbrMode::ProbeRtt);
            assert!(driver.bbr.current_cwnd() <= CWND_MIN_TARGET * MSS);
        }

        driver.ack(Duration::from_millis(20), 15 * MSS, 2 * MSS, rtt);
        assert_ne!(driver.bbr.mode(), BbrMode::ProbeRtt);
        assert!(driver.bbr.current_cwnd() >= before);
    }

    #[test]
    fn loss_recovery_conserves_packets_and_restores() {
        let mut bbr = Bbr::new(MSS, 3);
        let now = Instant::now();
        bbr.cwnd = 40 * MSS;
        bbr.on_loss_signal(&LossSignal {
            dupacks: 3,
            flight: 40 * MSS,
            limited_transfer: 0,
            new_recovery: true,
        });
        assert_eq!(bbr.prior_cwnd, 40 * MSS);

        bbr.cwnd = 10 * MSS;
        bbr.on_ack(&AckSample {
            acked: MSS,
            flight: 20 * MSS,
            rtt: None,
            srtt: Some(Duration::from_millis(5)),
            dupacks: 3,
            ack: SeqNumber::new(0),
            snd_next: SeqNumber::new(10),
            now,
        });
        assert_eq!(bbr.current_cwnd(), 21 * MSS);

        bbr.on_recovery_ack(RecoveryAck::Full { flight: 0 });
        assert_eq!(bbr.current_cwnd(), 40 * MSS);
    }
}
