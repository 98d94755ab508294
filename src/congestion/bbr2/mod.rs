use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};

use crate::connection::RttEstimator;

use super::{bw_from_delta, Controller, ControllerFactory, BASE_DATAGRAM_SIZE};

mod max_filter;
use max_filter::WindowedMaxFilter;

/// Pacing gain cycle: ProbeBW Down, Cruise, Refill, Up
const PROBE_BW_PACING_GAIN: [f64; 4] = [0.9, 1.0, 1.0, 1.25];
/// Pacing and cwnd gain while growing toward the bottleneck rate
const STARTUP_GAIN: f64 = 2.89;
/// Pacing gain while draining the queue built up in startup
const DRAIN_GAIN: f64 = 0.5;
/// Multiplicative decrease applied to the lower bounds on a lossy round
const BETA: f64 = 0.7;
/// Maximum tolerated per-round loss rate while probing
const LOSS_THRESH: f64 = 0.02;
/// Fraction of `inflight_hi` left free for cross traffic while cruising
const HEADROOM: f64 = 0.15;
/// Minimum interval between ProbeRTT episodes
const PROBE_RTT_INTERVAL: Duration = Duration::from_secs(5);
/// Time spent at the reduced window once inflight has drained in ProbeRTT
const PROBE_RTT_DURATION: Duration = Duration::from_millis(200);
/// Window of the connection-lifetime min RTT estimate
const MIN_RTT_FILTER_LEN: Duration = Duration::from_secs(10);
/// Max-bandwidth filter window, in ProbeBW cycles
const MAX_BW_FILTER_LEN: u64 = 2;
/// Extra-acked (aggregation) filter window, in round trips
const EXTRA_ACKED_FILTER_LEN: u64 = 10;
/// Bandwidth growth below which a round counts against startup
const FULL_BW_GROWTH: f64 = 1.25;
/// Rounds without growth before startup is declared done
const FULL_BW_COUNT: u32 = 3;
/// Loss events in one round that force a loss-based startup exit
const STARTUP_LOSS_EVENTS: u64 = 6;
/// cwnd gain while holding inflight down to measure min RTT
const PROBE_RTT_CWND_GAIN: f64 = 0.5;
/// Pacing is discounted by this margin to avoid building a queue at the exact
/// estimated rate
const PACING_MARGIN_PERCENT: f64 = 0.01;
/// Minimum wait before probing for bandwidth again after a Down phase
const MIN_PROBE_WAIT: Duration = Duration::from_secs(2);
/// Random extra wait added on top of `MIN_PROBE_WAIT`
const MAX_EXTRA_PROBE_WAIT: Duration = Duration::from_secs(1);

/// Delivery state captured when a packet departs, consumed when it is acked
#[derive(Debug, Copy, Clone)]
struct SentState {
    packet_number: u64,
    size: u64,
    send_time: Instant,
    /// Connection-total delivered bytes when this packet was sent
    delivered_at_send: u64,
    delivered_time_at_send: Instant,
    first_sent_time_at_send: Instant,
    /// Connection-total lost bytes when this packet was sent
    lost_at_send: u64,
    /// Estimated bytes in flight just after this packet was sent
    tx_in_flight: u64,
    app_limited: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ProbeBwPhase {
    /// Send below the estimated rate to drain the probe's queue
    Down,
    /// Send at the estimated rate, leaving headroom for cross traffic
    Cruise,
    /// Send at the estimated rate for one round to refill the pipe
    Refill,
    /// Send above the estimated rate to look for more capacity
    Up,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum State {
    Startup,
    Drain,
    ProbeBw(ProbeBwPhase),
    ProbeRtt,
}

/// A model-based congestion controller in the BBRv2 family
///
/// Estimates the bottleneck bandwidth and round-trip propagation delay of the path
/// and aims to operate at their product, probing periodically for changes and backing
/// off on sustained loss. Considerably less queue-building than the loss-based
/// controllers on buffer-bloated paths.
#[derive(Clone)]
pub struct Bbr2 {
    config: Arc<Bbr2Config>,
    mtu: u64,
    init_cwnd: u64,
    min_cwnd: u64,

    // Connection-wide delivery accounting
    delivered: u64,
    delivered_time: Option<Instant>,
    first_sent_time: Option<Instant>,
    lost: u64,
    in_flight_est: u64,
    packets: VecDeque<SentState>,
    max_sent_packet_number: u64,
    max_acked_packet_number: u64,
    app_limited: bool,

    // Round trip counting
    round_count: u64,
    next_round_delivered: u64,
    round_start: bool,

    // Accumulated between `on_ack`/`on_congestion_event` calls and the closing
    // `on_end_acks`
    newly_acked: u64,
    newly_lost: u64,
    largest_newly_acked: Option<SentState>,
    ack_time: Option<Instant>,

    // Per-round loss signal
    loss_events_in_round: u64,
    lost_in_round: u64,
    delivered_in_round: u64,
    loss_round_delivered: u64,

    // Bandwidth model
    max_bw_filter: WindowedMaxFilter,
    cycle_count: u64,
    bw_latest: u64,
    inflight_latest: u64,
    bw_lo: u64,
    inflight_lo: u64,
    inflight_hi: u64,

    // Aggregation model
    extra_acked_filter: WindowedMaxFilter,
    extra_acked_interval_start: Option<Instant>,
    extra_acked_delivered: u64,

    // Startup progress
    full_bw: u64,
    full_bw_count: u32,
    full_bw_reached: bool,

    // RTT model
    min_rtt: Option<Duration>,
    min_rtt_stamp: Option<Instant>,
    probe_rtt_min: Option<Duration>,
    probe_rtt_min_stamp: Option<Instant>,
    probe_rtt_done_stamp: Option<Instant>,
    probe_rtt_round_done: bool,
    prior_cwnd: u64,

    // ProbeBW cycle state
    state: State,
    pacing_gain: f64,
    cwnd_gain: f64,
    cycle_stamp: Option<Instant>,
    probe_wait: Option<Instant>,
    probe_up_rounds: u64,
    probe_up_acks: u64,
    probe_up_cnt: u64,

    cwnd: u64,
    pacing_rate: u64,

    rng: rand::rngs::StdRng,
}

impl Bbr2 {
    /// Construct a controller with the given `config` for a path using `current_mtu`
    pub fn new(config: Arc<Bbr2Config>, current_mtu: u16) -> Self {
        let mtu = u64::from(current_mtu);
        let init_cwnd = config.initial_window.max(config.min_window_packets * mtu);
        Self {
            mtu,
            init_cwnd,
            min_cwnd: config.min_window_packets * mtu,
            config,

            delivered: 0,
            delivered_time: None,
            first_sent_time: None,
            lost: 0,
            in_flight_est: 0,
            packets: VecDeque::new(),
            max_sent_packet_number: 0,
            max_acked_packet_number: 0,
            app_limited: false,

            round_count: 0,
            next_round_delivered: 0,
            round_start: false,

            newly_acked: 0,
            newly_lost: 0,
            largest_newly_acked: None,
            ack_time: None,

            loss_events_in_round: 0,
            lost_in_round: 0,
            delivered_in_round: 0,
            loss_round_delivered: 0,

            max_bw_filter: WindowedMaxFilter::new(MAX_BW_FILTER_LEN),
            cycle_count: 0,
            bw_latest: 0,
            inflight_latest: 0,
            bw_lo: u64::MAX,
            inflight_lo: u64::MAX,
            inflight_hi: u64::MAX,

            extra_acked_filter: WindowedMaxFilter::new(EXTRA_ACKED_FILTER_LEN),
            extra_acked_interval_start: None,
            extra_acked_delivered: 0,

            full_bw: 0,
            full_bw_count: 0,
            full_bw_reached: false,

            min_rtt: None,
            min_rtt_stamp: None,
            probe_rtt_min: None,
            probe_rtt_min_stamp: None,
            probe_rtt_done_stamp: None,
            probe_rtt_round_done: false,
            prior_cwnd: 0,

            state: State::Startup,
            pacing_gain: STARTUP_GAIN,
            cwnd_gain: STARTUP_GAIN,
            cycle_stamp: None,
            probe_wait: None,
            probe_up_rounds: 0,
            probe_up_acks: 0,
            probe_up_cnt: u64::MAX,

            cwnd: init_cwnd,
            pacing_rate: 0,

            rng: rand::rngs::StdRng::from_os_rng(),
        }
    }

    fn max_bw(&self) -> u64 {
        self.max_bw_filter.get()
    }

    /// Bandwidth the model currently allows: the windowed max capped by `bw_lo`
    fn bw(&self) -> u64 {
        self.max_bw().min(self.bw_lo)
    }

    fn bdp_with_gain(&self, gain: f64) -> u64 {
        let Some(min_rtt) = self.min_rtt else {
            return self.init_cwnd;
        };
        let bdp = self.bw() as f64 * min_rtt.as_secs_f64();
        (gain * bdp) as u64
    }

    fn inflight_with_headroom(&self) -> u64 {
        if self.inflight_hi == u64::MAX {
            return u64::MAX;
        }
        ((1.0 - HEADROOM) * self.inflight_hi as f64) as u64
    }

    fn record_rtt(&mut self, now: Instant, rtt: &RttEstimator) {
        let sample = rtt.latest();
        let min_expired = self
            .min_rtt_stamp
            .is_none_or(|stamp| now.saturating_duration_since(stamp) > MIN_RTT_FILTER_LEN);
        if min_expired || Some(sample) <= self.min_rtt {
            self.min_rtt = Some(sample);
            self.min_rtt_stamp = Some(now);
        }
        let probe_expired = self
            .probe_rtt_min_stamp
            .is_none_or(|stamp| now.saturating_duration_since(stamp) > PROBE_RTT_INTERVAL);
        if probe_expired || Some(sample) <= self.probe_rtt_min {
            self.probe_rtt_min = Some(sample);
            self.probe_rtt_min_stamp = Some(now);
        }
    }

    fn update_round(&mut self) {
        self.round_start = false;
        let Some(largest) = self.largest_newly_acked else {
            return;
        };
        self.max_acked_packet_number = self
            .max_acked_packet_number
            .max(largest.packet_number);
        if largest.delivered_at_send >= self.next_round_delivered {
            self.next_round_delivered = self.delivered;
            self.round_count += 1;
            self.round_start = true;
            self.probe_rtt_round_done = true;
        }
    }

    /// Feed the latest delivery rate sample into the bandwidth model
    fn update_bw_model(&mut self, now: Instant) {
        let Some(largest) = self.largest_newly_acked else {
            return;
        };
        let delivered = self.delivered - largest.delivered_at_send;
        let ack_elapsed = now.saturating_duration_since(largest.delivered_time_at_send);
        let send_elapsed = largest
            .send_time
            .saturating_duration_since(largest.first_sent_time_at_send);
        let interval = ack_elapsed.max(send_elapsed);
        if let Some(bw) = bw_from_delta(delivered, interval) {
            self.bw_latest = self.bw_latest.max(bw);
            // Application-limited samples understate the path's capacity; let them
            // only raise the filter
            if !largest.app_limited || bw > self.max_bw() {
                self.max_bw_filter.update(self.cycle_count, bw);
            }
        }
        self.inflight_latest = self.inflight_latest.max(delivered);
    }

    /// On each loss-round boundary, pull the short-term bounds down toward what the
    /// path just demonstrated it can deliver
    fn adapt_lower_bounds(&mut self) {
        if matches!(self.state, State::ProbeBw(ProbeBwPhase::Up)) {
            // Up probes deliberately overshoot; their losses inform `inflight_hi`
            // instead
            return;
        }
        if self.newly_lost == 0 {
            return;
        }
        if self.bw_lo == u64::MAX {
            self.bw_lo = self.max_bw();
        }
        if self.inflight_lo == u64::MAX {
            self.inflight_lo = self.cwnd;
        }
        self.bw_lo = self
            .bw_latest
            .max((self.bw_lo as f64 * BETA) as u64);
        self.inflight_lo = self
            .inflight_latest
            .max((self.inflight_lo as f64 * BETA) as u64);
    }

    fn reset_lower_bounds(&mut self) {
        self.bw_lo = u64::MAX;
        self.inflight_lo = u64::MAX;
    }

    /// Advance the loss-round bookkeeping; returns whether a loss round ended
    fn update_loss_round(&mut self) -> bool {
        let Some(largest) = self.largest_newly_acked else {
            return false;
        };
        if largest.delivered_at_send >= self.loss_round_delivered {
            self.loss_round_delivered = self.delivered;
            self.bw_latest = 0;
            self.inflight_latest = 0;
            return true;
        }
        false
    }

    fn update_aggregation(&mut self, now: Instant) {
        let interval_start = *self.extra_acked_interval_start.get_or_insert(now);
        let expected = (self.bw() as f64
            * now.saturating_duration_since(interval_start).as_secs_f64())
            as u64;
        if self.extra_acked_delivered <= expected {
            self.extra_acked_delivered = 0;
            self.extra_acked_interval_start = Some(now);
        }
        self.extra_acked_delivered += self.newly_acked;
        let extra = (self.extra_acked_delivered - expected).min(self.cwnd);
        self.extra_acked_filter.update(self.round_count, extra);
    }

    fn extra_acked(&self) -> u64 {
        self.extra_acked_filter.get()
    }

    fn check_startup_done(&mut self) {
        if self.full_bw_reached || !self.round_start || self.app_limited {
            return;
        }
        // Bandwidth-plateau exit
        if self.max_bw() >= (self.full_bw as f64 * FULL_BW_GROWTH) as u64 {
            self.full_bw = self.max_bw();
            self.full_bw_count = 0;
        } else {
            self.full_bw_count += 1;
            if self.full_bw_count >= FULL_BW_COUNT {
                self.full_bw_reached = true;
            }
        }
        // Loss-based exit
        if self.loss_events_in_round >= STARTUP_LOSS_EVENTS
            && self.delivered_in_round > 0
            && self.lost_in_round as f64 > LOSS_THRESH * self.delivered_in_round as f64
        {
            self.full_bw_reached = true;
            self.inflight_hi = self.cwnd.max(self.bdp_with_gain(1.0));
        }
        if self.full_bw_reached && self.state == State::Startup {
            self.state = State::Drain;
            self.pacing_gain = DRAIN_GAIN;
            self.cwnd_gain = STARTUP_GAIN;
        }
    }

    fn check_drain_done(&mut self, now: Instant) {
        if self.state == State::Drain && self.in_flight_est <= self.bdp_with_gain(1.0) {
            self.enter_probe_bw_down(now);
        }
    }

    fn enter_probe_bw_down(&mut self, now: Instant) {
        self.state = State::ProbeBw(ProbeBwPhase::Down);
        self.pacing_gain = PROBE_BW_PACING_GAIN[0];
        self.cwnd_gain = 2.0;
        self.cycle_stamp = Some(now);
        self.cycle_count += 1;
        self.max_bw_filter.expire(self.cycle_count);
        // Schedule the next bandwidth probe a randomized couple of seconds out
        let jitter = Duration::from_millis(
            self.rng
                .random_range(0..=MAX_EXTRA_PROBE_WAIT.as_millis() as u64),
        );
        self.probe_wait = Some(now + MIN_PROBE_WAIT + jitter);
    }

    fn enter_probe_bw_cruise(&mut self) {
        self.state = State::ProbeBw(ProbeBwPhase::Cruise);
        self.pacing_gain = PROBE_BW_PACING_GAIN[1];
    }

    fn enter_probe_bw_refill(&mut self, now: Instant) {
        self.state = State::ProbeBw(ProbeBwPhase::Refill);
        self.pacing_gain = PROBE_BW_PACING_GAIN[2];
        self.reset_lower_bounds();
        self.probe_up_rounds = 0;
        self.cycle_stamp = Some(now);
        // One round of refilling before accelerating
        self.next_round_delivered = self.delivered;
    }

    fn enter_probe_bw_up(&mut self, now: Instant) {
        self.state = State::ProbeBw(ProbeBwPhase::Up);
        self.pacing_gain = PROBE_BW_PACING_GAIN[3];
        self.cwnd_gain = 2.25;
        self.cycle_stamp = Some(now);
        if self.inflight_hi == u64::MAX {
            self.inflight_hi = self.cwnd.max(self.bdp_with_gain(1.25));
        }
        self.probe_up_cnt = self.cwnd.max(self.mtu);
        self.probe_up_acks = 0;
    }

    /// Grow `inflight_hi` while an Up probe keeps succeeding
    fn probe_inflight_hi_upward(&mut self) {
        if self.in_flight_est < self.cwnd || self.inflight_hi == u64::MAX {
            return;
        }
        self.probe_up_acks += self.newly_acked;
        if self.probe_up_acks >= self.probe_up_cnt {
            let delta = self.probe_up_acks / self.probe_up_cnt;
            self.probe_up_acks -= delta * self.probe_up_cnt;
            self.inflight_hi += delta * self.mtu;
        }
        if self.round_start {
            self.probe_up_rounds += 1;
            // Grow the slope: double the amount probed per round
            self.probe_up_cnt = (self.probe_up_cnt / 2).max(self.mtu);
        }
    }

    /// Per-round loss rate exceeded the threshold during a probe
    fn is_inflight_too_high(&self) -> bool {
        self.lost_in_round as f64
            > LOSS_THRESH * (self.delivered_in_round + self.lost_in_round) as f64
            && self.loss_events_in_round > 0
    }

    fn handle_inflight_too_high(&mut self, now: Instant) {
        if !self.app_limited {
            let inflight_at_ack = self
                .largest_newly_acked
                .map_or(self.in_flight_est, |p| p.tx_in_flight);
            self.inflight_hi = inflight_at_ack
                .max((self.bdp_with_gain(1.0) as f64 * BETA) as u64)
                .max(self.min_cwnd);
        }
        if matches!(self.state, State::ProbeBw(ProbeBwPhase::Up)) {
            self.enter_probe_bw_down(now);
        }
    }

    fn update_probe_bw_cycle(&mut self, now: Instant) {
        let State::ProbeBw(phase) = self.state else {
            return;
        };
        match phase {
            ProbeBwPhase::Down => {
                // The queue is drained once inflight is at the target with headroom
                // to spare
                if self.in_flight_est <= self.bdp_with_gain(1.0)
                    && self.in_flight_est <= self.inflight_with_headroom()
                {
                    self.enter_probe_bw_cruise();
                }
            }
            ProbeBwPhase::Cruise => {
                if self.probe_wait.is_some_and(|at| now >= at) {
                    self.probe_wait = None;
                    self.enter_probe_bw_refill(now);
                }
            }
            ProbeBwPhase::Refill => {
                if self.round_start {
                    self.enter_probe_bw_up(now);
                }
            }
            ProbeBwPhase::Up => {
                if self.is_inflight_too_high() {
                    self.handle_inflight_too_high(now);
                } else {
                    self.probe_inflight_hi_upward();
                    if self.in_flight_est > self.inflight_with_headroom() {
                        self.enter_probe_bw_down(now);
                    }
                }
            }
        }
    }

    fn check_probe_rtt(&mut self, now: Instant) {
        let stale = self
            .probe_rtt_min_stamp
            .is_some_and(|stamp| now.saturating_duration_since(stamp) > PROBE_RTT_INTERVAL);
        if self.state != State::ProbeRtt && stale && !self.app_limited {
            self.state = State::ProbeRtt;
            self.pacing_gain = 1.0;
            self.cwnd_gain = PROBE_RTT_CWND_GAIN;
            self.prior_cwnd = self.cwnd;
            self.probe_rtt_done_stamp = None;
        }
        if self.state == State::ProbeRtt {
            self.handle_probe_rtt(now);
        }
    }

    fn probe_rtt_cwnd(&self) -> u64 {
        self.bdp_with_gain(PROBE_RTT_CWND_GAIN).max(self.min_cwnd)
    }

    fn handle_probe_rtt(&mut self, now: Instant) {
        match self.probe_rtt_done_stamp {
            None => {
                if self.in_flight_est <= self.probe_rtt_cwnd() + self.mtu {
                    self.probe_rtt_done_stamp = Some(now + PROBE_RTT_DURATION);
                    self.probe_rtt_round_done = false;
                }
            }
            Some(done_at) => {
                if self.probe_rtt_round_done && now >= done_at {
                    self.probe_rtt_min_stamp = Some(now);
                    self.cwnd = self.cwnd.max(self.prior_cwnd);
                    if !self.full_bw_reached {
                        self.state = State::Startup;
                        self.pacing_gain = STARTUP_GAIN;
                        self.cwnd_gain = STARTUP_GAIN;
                    } else {
                        self.enter_probe_bw_down(now);
                    }
                    self.probe_rtt_done_stamp = None;
                }
            }
        }
    }

    fn update_pacing_rate(&mut self) {
        let rate = (self.bw() as f64 * self.pacing_gain * (1.0 - PACING_MARGIN_PERCENT)) as u64;
        if self.full_bw_reached || rate > self.pacing_rate {
            // Never slow the pace during startup; underestimates are common there
            self.pacing_rate = rate;
        }
        if self.pacing_rate == 0 {
            if let Some(min_rtt) = self.min_rtt {
                self.pacing_rate = bw_from_delta(self.init_cwnd, min_rtt).unwrap_or(0);
            }
        }
    }

    fn update_cwnd(&mut self) {
        if self.state == State::ProbeRtt {
            self.cwnd = self.cwnd.min(self.probe_rtt_cwnd());
            return;
        }
        let mut target = self
            .bdp_with_gain(self.cwnd_gain)
            .saturating_add(self.extra_acked());
        // Cap by the loss model's bounds, leaving headroom when cruising
        let cap = if matches!(self.state, State::ProbeBw(ProbeBwPhase::Cruise)) {
            self.inflight_with_headroom()
        } else {
            self.inflight_hi
        };
        target = target.min(cap).min(self.inflight_lo);

        if self.full_bw_reached {
            self.cwnd = (self.cwnd + self.newly_acked).min(target);
        } else if self.cwnd < target || self.delivered < self.init_cwnd {
            // Startup: grow unconditionally, never shrink
            self.cwnd += self.newly_acked;
        }
        self.cwnd = self.cwnd.max(self.min_cwnd);
    }

    fn find_packet(&self, packet_number: u64) -> Option<SentState> {
        self.packets
            .iter()
            .find(|p| p.packet_number == packet_number)
            .copied()
    }

    fn discard_packets_through(&mut self, packet_number: u64) {
        while let Some(front) = self.packets.front() {
            if front.packet_number > packet_number {
                break;
            }
            self.packets.pop_front();
        }
    }
}

impl Controller for Bbr2 {
    fn on_sent(&mut self, now: Instant, bytes: u64, last_packet_number: u64) {
        if self.packets.is_empty() && self.in_flight_est == 0 {
            // Restarting from idle: the old delivery clock would fabricate a huge
            // sample interval
            self.delivered_time = Some(now);
            self.first_sent_time = Some(now);
        }
        self.max_sent_packet_number = self.max_sent_packet_number.max(last_packet_number);
        self.in_flight_est += bytes;
        self.packets.push_back(SentState {
            packet_number: last_packet_number,
            size: bytes,
            send_time: now,
            delivered_at_send: self.delivered,
            delivered_time_at_send: self.delivered_time.unwrap_or(now),
            first_sent_time_at_send: self.first_sent_time.unwrap_or(now),
            lost_at_send: self.lost,
            tx_in_flight: self.in_flight_est,
            app_limited: self.app_limited,
        });
    }

    fn on_ack(
        &mut self,
        now: Instant,
        packet_number: u64,
        _sent: Instant,
        bytes: u64,
        app_limited: bool,
        rtt: &RttEstimator,
    ) {
        self.delivered += bytes;
        self.delivered_time = Some(now);
        self.delivered_in_round += bytes;
        self.newly_acked += bytes;
        self.in_flight_est = self.in_flight_est.saturating_sub(bytes);
        self.ack_time = Some(now);
        self.app_limited = app_limited;
        self.record_rtt(now, rtt);
        if let Some(state) = self.find_packet(packet_number) {
            let is_largest = self
                .largest_newly_acked
                .is_none_or(|p| packet_number > p.packet_number);
            if is_largest {
                self.largest_newly_acked = Some(state);
            }
        }
    }

    fn on_end_acks(
        &mut self,
        now: Instant,
        in_flight: u64,
        app_limited: bool,
        largest_packet_num_acked: Option<u64>,
    ) {
        self.in_flight_est = in_flight;
        self.app_limited = app_limited;

        self.update_round();
        self.update_bw_model(now);
        let loss_round = self.update_loss_round();
        if loss_round {
            self.adapt_lower_bounds();
            self.loss_events_in_round = 0;
            self.lost_in_round = 0;
            self.delivered_in_round = 0;
        }
        self.update_aggregation(now);
        self.check_startup_done();
        self.check_drain_done(now);
        self.update_probe_bw_cycle(now);
        self.check_probe_rtt(now);
        self.update_pacing_rate();
        self.update_cwnd();

        if let Some(pn) = largest_packet_num_acked {
            self.discard_packets_through(pn);
        }
        self.newly_acked = 0;
        self.newly_lost = 0;
        self.largest_newly_acked = None;
    }

    fn on_congestion_event(
        &mut self,
        now: Instant,
        _sent: Instant,
        is_persistent_congestion: bool,
        lost_bytes: u64,
    ) {
        self.lost += lost_bytes;
        self.lost_in_round += lost_bytes;
        self.newly_lost += lost_bytes;
        if lost_bytes > 0 {
            self.loss_events_in_round += 1;
        }
        self.in_flight_est = self.in_flight_est.saturating_sub(lost_bytes);
        if is_persistent_congestion {
            // Collapse to the minimum and rebuild the model from scratch
            self.cwnd = self.min_cwnd;
            self.bw_latest = 0;
            self.inflight_latest = 0;
            self.reset_lower_bounds();
            let _ = now;
        }
    }

    fn on_spurious_congestion_event(&mut self, _now: Instant, bytes: u64) {
        // The bytes were delivered after all; undo the loss signal
        self.lost = self.lost.saturating_sub(bytes);
        self.lost_in_round = self.lost_in_round.saturating_sub(bytes);
    }

    fn window(&self) -> u64 {
        self.cwnd
    }

    fn pacing_rate(&self) -> Option<u64> {
        Some(self.pacing_rate)
    }

    fn bandwidth_estimate(&self) -> Option<u64> {
        Some(self.bw())
    }

    fn set_app_limited(&mut self, app_limited: bool) {
        self.app_limited = app_limited;
    }

    fn clone_box(&self) -> Box<dyn Controller> {
        Box::new(self.clone())
    }

    fn initial_window(&self) -> u64 {
        self.config.initial_window.max(self.min_cwnd)
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Configuration for the [`Bbr2`] congestion controller
#[derive(Debug, Clone)]
pub struct Bbr2Config {
    initial_window: u64,
    min_window_packets: u64,
}

impl Bbr2Config {
    /// Default limit on the amount of outstanding data in bytes
    pub fn initial_window(&mut self, value: u64) -> &mut Self {
        self.initial_window = value;
        self
    }

    /// Floor of the congestion window, in packets
    pub fn min_window_packets(&mut self, value: u64) -> &mut Self {
        self.min_window_packets = value;
        self
    }
}

impl Default for Bbr2Config {
    fn default() -> Self {
        Self {
            initial_window: 10 * BASE_DATAGRAM_SIZE,
            min_window_packets: 4,
        }
    }
}

impl ControllerFactory for Bbr2Config {
    fn build(self: Arc<Self>, _now: Instant, current_mtu: u16) -> Box<dyn Controller> {
        Box::new(Bbr2::new(self, current_mtu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> Bbr2 {
        Bbr2::new(Arc::new(Bbr2Config::default()), 1200)
    }

    fn rtt_with_sample(rtt: Duration) -> RttEstimator {
        let mut est = RttEstimator::new(Duration::from_millis(333));
        est.update(Duration::from_millis(0), rtt);
        est
    }

    /// Run one send/ack exchange of `packets` MTU-sized packets
    fn exchange(
        bbr: &mut Bbr2,
        now: &mut Instant,
        rtt_est: &RttEstimator,
        first_pn: u64,
        packets: u64,
        rtt: Duration,
    ) {
        for i in 0..packets {
            bbr.on_sent(*now, 1200, first_pn + i);
        }
        *now += rtt;
        for i in 0..packets {
            bbr.on_ack(*now, first_pn + i, *now - rtt, 1200, false, rtt_est);
        }
        bbr.on_end_acks(*now, 0, false, Some(first_pn + packets - 1));
    }

    #[test]
    fn starts_in_startup_with_initial_window() {
        let bbr = controller();
        assert_eq!(bbr.state, State::Startup);
        assert_eq!(bbr.window(), 10 * 1200);
    }

    #[test]
    fn window_never_below_min() {
        let mut bbr = controller();
        let now = Instant::now();
        // Persistent congestion collapses to the floor, not below
        bbr.on_congestion_event(now, now, true, 10 * 1200);
        assert_eq!(bbr.window(), 4 * 1200);
    }

    #[test]
    fn cwnd_grows_during_startup() {
        let mut bbr = controller();
        let mut now = Instant::now();
        let rtt = Duration::from_millis(50);
        let est = rtt_with_sample(rtt);
        let before = bbr.window();
        exchange(&mut bbr, &mut now, &est, 0, 10, rtt);
        assert!(bbr.window() > before);
        assert_eq!(bbr.state, State::Startup);
    }

    #[test]
    fn startup_exits_on_bandwidth_plateau() {
        let mut bbr = controller();
        let mut now = Instant::now();
        let rtt = Duration::from_millis(50);
        let est = rtt_with_sample(rtt);
        let mut pn = 0;
        // Constant delivery rate: bandwidth stops growing, so startup must end
        // within a handful of rounds
        for _ in 0..10 {
            exchange(&mut bbr, &mut now, &est, pn, 10, rtt);
            pn += 10;
        }
        assert!(bbr.full_bw_reached);
        assert_ne!(bbr.state, State::Startup);
    }

    #[test]
    fn probe_up_loss_caps_inflight_hi() {
        let mut bbr = controller();
        let now = Instant::now();
        bbr.state = State::ProbeBw(ProbeBwPhase::Up);
        bbr.min_rtt = Some(Duration::from_millis(50));
        bbr.min_rtt_stamp = Some(now);
        bbr.max_bw_filter.update(0, 1_000_000);
        bbr.inflight_hi = 100_000;
        bbr.in_flight_est = 100_000;
        // 3% of in-flight lost in one round with deliveries booked
        bbr.delivered_in_round = 97_000;
        bbr.lost_in_round = 3_000;
        bbr.loss_events_in_round = 1;
        bbr.largest_newly_acked = Some(SentState {
            packet_number: 1,
            size: 1200,
            send_time: now,
            delivered_at_send: 0,
            delivered_time_at_send: now,
            first_sent_time_at_send: now,
            lost_at_send: 0,
            tx_in_flight: 40_000,
            app_limited: false,
        });
        bbr.handle_inflight_too_high(now);
        // max(inflight at largest acked, target * beta)
        let target = bbr.bdp_with_gain(1.0);
        let expected = 40_000u64.max((target as f64 * BETA) as u64).max(bbr.min_cwnd);
        assert_eq!(bbr.inflight_hi, expected);
        assert_eq!(bbr.state, State::ProbeBw(ProbeBwPhase::Down));
    }

    #[test]
    fn pacing_rate_tracks_bandwidth() {
        let mut bbr = controller();
        let mut now = Instant::now();
        let rtt = Duration::from_millis(100);
        let est = rtt_with_sample(rtt);
        exchange(&mut bbr, &mut now, &est, 0, 10, rtt);
        // 12000 bytes per 100ms = 120kB/s; the gain scales it up during startup
        let rate = bbr.pacing_rate().unwrap();
        assert!(rate > 0);
        assert!(bbr.bandwidth_estimate().unwrap() > 0);
    }
}
