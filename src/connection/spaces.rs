use std::{
    collections::BTreeMap,
    mem,
    ops::{Index, IndexMut, Range},
    time::Instant,
};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    crypto::Keys,
    frame::{self, EcnCounts, StreamMetaVec},
    packet::SpaceId,
    range_set::RangeSet,
    shared::EcnCodepoint,
    StreamId,
};

use super::assembler::Assembler;
use super::send_buffer::SendBuffer;

/// State of one packet-number space
///
/// Initial, Handshake, and AppData each number their packets independently, carry an
/// independent ack state, and an independent crypto stream.
pub(super) struct PacketSpace {
    /// Packet protection keys, present while this space is live
    pub(super) crypto: Option<Keys>,
    pub(super) dedup: Dedup,
    /// Highest received packet number, for wire packet-number expansion
    pub(super) rx_packet: u64,

    /// One-shot frames to send, re-armed on loss
    pub(super) pending: Retransmits,
    /// Packet numbers to acknowledge
    pub(super) pending_acks: PendingAcks,

    /// The packet number of the next packet that will be sent, if any
    pub(super) next_packet_number: u64,
    /// The largest packet number the remote peer acknowledged in an ACK frame
    pub(super) largest_acked_packet: Option<u64>,
    pub(super) largest_acked_packet_sent: Instant,
    /// Transmitted but not acked
    // We use a BTreeMap here so we can efficiently query by range on ACK and for loss detection
    pub(super) sent_packets: BTreeMap<u64, SentPacket>,
    /// Number of explicit congestion notification codepoints seen on incoming packets
    pub(super) ecn_counters: EcnCounts,
    /// Recent ECN counters sent by the peer in ACK frames
    ///
    /// Updated (and inspected) whenever we receive an ACK with a new highest acked
    /// packet number.
    pub(super) ecn_feedback: EcnCounts,

    /// Incoming cryptographic handshake stream
    pub(super) crypto_stream: Assembler,
    /// Outgoing cryptographic handshake stream
    pub(super) crypto_out: SendBuffer,

    /// The time the most recently sent ack-eliciting packet was sent
    pub(super) time_of_last_ack_eliciting_packet: Option<Instant>,
    /// The time at which the earliest sent packet in this space will be considered
    /// lost based on exceeding the reordering window in time. Only set for packets
    /// numbered prior to a packet that has been acknowledged.
    pub(super) loss_time: Option<Instant>,
    /// Number of tail loss probes to send
    pub(super) loss_probes: u32,
    pub(super) ping_pending: bool,
    pub(super) immediate_ack_pending: bool,
    /// Number of congestion control "in flight" bytes in this space
    pub(super) in_flight: u64,
    /// Number of packets sent in the current key phase
    pub(super) sent_with_keys: u64,

    /// Clone-identifier accounting for probe packets
    clones: FxHashMap<u64, CloneState>,
}

impl PacketSpace {
    pub(super) fn new(now: Instant) -> Self {
        Self {
            crypto: None,
            dedup: Dedup::new(),
            rx_packet: 0,

            pending: Retransmits::default(),
            pending_acks: PendingAcks::default(),

            next_packet_number: 0,
            largest_acked_packet: None,
            largest_acked_packet_sent: now,
            sent_packets: BTreeMap::new(),
            ecn_counters: EcnCounts::ZERO,
            ecn_feedback: EcnCounts::ZERO,

            crypto_stream: Assembler::new(),
            crypto_out: SendBuffer::new(),

            time_of_last_ack_eliciting_packet: None,
            loss_time: None,
            loss_probes: 0,
            ping_pending: false,
            immediate_ack_pending: false,
            in_flight: 0,
            sent_with_keys: 0,

            clones: FxHashMap::default(),
        }
    }

    pub(super) fn get_tx_number(&mut self) -> u64 {
        // TODO: Handle packet number overflow gracefully
        assert!(self.next_packet_number < 2u64.pow(62));
        let x = self.next_packet_number;
        self.next_packet_number += 1;
        self.sent_with_keys += 1;
        x
    }

    /// Record a transmitted packet in the outstanding set
    pub(super) fn sent(&mut self, number: u64, packet: SentPacket) {
        if packet.ack_eliciting {
            self.in_flight += u64::from(packet.size);
        }
        if let Some(clone_id) = packet.clone_id {
            self.clones
                .entry(clone_id)
                .or_insert(CloneState {
                    remaining: 0,
                    acked: false,
                })
                .remaining += 1;
        }
        self.sent_packets.insert(number, packet);
    }

    /// Count an existing outstanding packet into a clone group
    ///
    /// Used when a packet that predates its group gains a clone identifier.
    pub(super) fn register_clone_member(&mut self, clone_id: u64) {
        self.clones
            .entry(clone_id)
            .or_insert(CloneState {
                remaining: 0,
                acked: false,
            })
            .remaining += 1;
    }

    /// Resolve clone bookkeeping when an outstanding entry is erased
    ///
    /// Returns whether the packet's loss effects should still be applied: once one
    /// member of a clone group has been acked, losing the others is moot.
    pub(super) fn clone_erased(&mut self, clone_id: Option<u64>, acked: bool) -> bool {
        let Some(clone_id) = clone_id else {
            return !acked;
        };
        let Some(state) = self.clones.get_mut(&clone_id) else {
            return !acked;
        };
        let was_acked = state.acked;
        state.acked |= acked;
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining == 0 {
            self.clones.remove(&clone_id);
        }
        // Loss effects apply only if no sibling delivered the data
        !acked && !was_acked
    }

    /// Whether a sibling of this clone group has already been acknowledged
    pub(super) fn clone_group_acked(&self, clone_id: u64) -> bool {
        self.clones.get(&clone_id).is_some_and(|s| s.acked)
    }

    /// Queue a probe packet's worth of data
    ///
    /// Prefer retransmitting data from the oldest outstanding ack-eliciting packet;
    /// if there is nothing outstanding, fall back on a PING to force an ack.
    pub(super) fn maybe_queue_probe(&mut self, streams_have_unsent: bool) {
        if self.loss_probes == 0 {
            return;
        }
        if streams_have_unsent || !self.pending.is_empty() || self.crypto_out.has_sendable() {
            // There's real data to send, no need to make something up
            return;
        }
        for packet in self.sent_packets.values_mut() {
            if !packet.retransmits.is_empty() || !packet.stream_frames.is_empty() {
                // Keep the data out of the old packet so a late ack of it doesn't
                // double-deliver control frames
                self.pending |= mem::take(&mut packet.retransmits);
                return;
            }
        }
        self.ping_pending = true;
    }

    /// Whether anything other than a bare ACK could be sent in this space
    pub(super) fn can_send_other(&self, streams_queued: bool) -> bool {
        !self.pending.is_empty()
            || self.crypto_out.has_sendable()
            || self.ping_pending
            || self.immediate_ack_pending
            || self.loss_probes != 0
            || streams_queued
    }

    /// Verifies sanity of an ECN block and returns whether congestion was
    /// encountered
    pub(super) fn detect_ecn(
        &mut self,
        newly_acked: u64,
        ecn: EcnCounts,
    ) -> Result<bool, &'static str> {
        let ect0_increase = ecn
            .ect0
            .checked_sub(self.ecn_feedback.ect0)
            .ok_or("peer ECT(0) count regression")?;
        let ect1_increase = ecn
            .ect1
            .checked_sub(self.ecn_feedback.ect1)
            .ok_or("peer ECT(1) count regression")?;
        let ce_increase = ecn
            .ce
            .checked_sub(self.ecn_feedback.ce)
            .ok_or("peer CE count regression")?;
        let total_increase = ect0_increase + ect1_increase + ce_increase;
        if total_increase < newly_acked {
            return Err("ECN bleaching");
        }
        if (ect0_increase + ce_increase) < newly_acked || ect1_increase != 0 {
            return Err("ECN corruption");
        }
        self.ecn_feedback = ecn;
        Ok(ce_increase != 0)
    }
}

impl Index<SpaceId> for [PacketSpace; 3] {
    type Output = PacketSpace;
    fn index(&self, space: SpaceId) -> &PacketSpace {
        &self.as_ref()[space as usize]
    }
}

impl IndexMut<SpaceId> for [PacketSpace; 3] {
    fn index_mut(&mut self, space: SpaceId) -> &mut PacketSpace {
        &mut self.as_mut()[space as usize]
    }
}

/// Accounting for one group of packets carrying the same data
///
/// A probe that rebuilds an outstanding packet's frames under a new packet number
/// shares a clone identifier with the original; an ack for either satisfies both.
struct CloneState {
    remaining: u32,
    acked: bool,
}

/// An outstanding ack-eliciting packet: everything needed to reconstruct its effect
/// when it is acknowledged or declared lost
#[derive(Debug, Clone)]
pub(super) struct SentPacket {
    /// The time the packet was sent
    pub(super) time_sent: Instant,
    /// The number of bytes sent in the packet, not including UDP or IP overhead, but
    /// including QUIC framing overhead. Zero if this packet is not counted towards
    /// congestion control, i.e. not an "in flight" packet.
    pub(super) size: u16,
    /// Whether an acknowledgement is expected directly in response to this packet
    pub(super) ack_eliciting: bool,
    /// Ack ranges this packet itself carried, cleared from the pending-ack state
    /// when this packet is acknowledged
    pub(super) acks: RangeSet,
    /// One-shot frames to re-queue if the packet is lost
    pub(super) retransmits: Retransmits,
    /// Metadata for stream frames carried; the data lives with the stream state
    pub(super) stream_frames: StreamMetaVec,
    /// Crypto-stream range carried, if any
    pub(super) crypto: Option<Range<u64>>,
    /// Shared marker between a packet and its retransmission-by-cloning
    pub(super) clone_id: Option<u64>,
    /// Whether the connection was application-limited when this packet was sent
    pub(super) app_limited: bool,
    /// Whether the payload was produced by a delegated-send backend
    pub(super) dsr: bool,
    /// Largest packet number acked when this packet was sent
    pub(super) largest_acked_at_send: Option<u64>,
}

impl Default for SentPacket {
    fn default() -> Self {
        Self {
            time_sent: Instant::now(),
            size: 0,
            ack_eliciting: false,
            acks: RangeSet::new(),
            retransmits: Retransmits::default(),
            stream_frames: StreamMetaVec::new(),
            crypto: None,
            clone_id: None,
            app_limited: false,
            dsr: false,
            largest_acked_at_send: None,
        }
    }
}

/// Retransmittable one-shot frame state
///
/// Sending the frame clears the flag; losing the packet that carried it sets the
/// flag again by merging the packet's copy back in.
#[derive(Debug, Clone, Default)]
pub(super) struct Retransmits {
    pub(super) max_data: bool,
    pub(super) max_streams: [bool; 2],
    pub(super) reset_stream: Vec<frame::ResetStream>,
    pub(super) stop_sending: Vec<frame::StopSending>,
    pub(super) max_stream_data: FxHashSet<StreamId>,
    pub(super) new_cids: Vec<frame::NewConnectionId>,
    pub(super) retire_cids: Vec<u64>,
    pub(super) ack_frequency: bool,
    pub(super) handshake_done: bool,
    pub(super) data_blocked: Option<u64>,
    pub(super) stream_data_blocked: Vec<(StreamId, u64)>,
    pub(super) streams_blocked: [Option<u64>; 2],
}

impl Retransmits {
    pub(super) fn is_empty(&self) -> bool {
        !self.max_data
            && !self.max_streams[0]
            && !self.max_streams[1]
            && self.reset_stream.is_empty()
            && self.stop_sending.is_empty()
            && self.max_stream_data.is_empty()
            && self.new_cids.is_empty()
            && self.retire_cids.is_empty()
            && !self.ack_frequency
            && !self.handshake_done
            && self.data_blocked.is_none()
            && self.stream_data_blocked.is_empty()
            && self.streams_blocked[0].is_none()
            && self.streams_blocked[1].is_none()
    }

}

impl ::std::ops::BitOrAssign for Retransmits {
    fn bitor_assign(&mut self, rhs: Self) {
        self.max_data |= rhs.max_data;
        self.max_streams[0] |= rhs.max_streams[0];
        self.max_streams[1] |= rhs.max_streams[1];
        self.reset_stream.extend(rhs.reset_stream);
        self.stop_sending.extend(rhs.stop_sending);
        self.max_stream_data.extend(rhs.max_stream_data);
        self.new_cids.extend(rhs.new_cids);
        self.retire_cids.extend(rhs.retire_cids);
        self.ack_frequency |= rhs.ack_frequency;
        self.handshake_done |= rhs.handshake_done;
        self.data_blocked = self.data_blocked.max(rhs.data_blocked);
        self.stream_data_blocked.extend(rhs.stream_data_blocked);
        for dir in 0..2 {
            self.streams_blocked[dir] = self.streams_blocked[dir].max(rhs.streams_blocked[dir]);
        }
    }
}

/// Sliding anti-replay window over authenticated packet numbers
///
/// Tracks the most recent [`REPLAY_SPAN`] packet numbers as a bitmap anchored at the
/// highest number authenticated so far: bit `k` of `seen` records whether
/// `highest - k` has been processed. Packet numbers are never reused, so anything
/// older than the span is treated as a replay; the span only has to outlast
/// plausible network reordering.
pub(super) struct Dedup {
    /// Highest packet number authenticated so far, if any
    highest: Option<u64>,
    /// Bit `k` is set iff `highest - k` has been authenticated
    seen: u128,
}

/// How far behind the highest authenticated number a packet may arrive
const REPLAY_SPAN: u64 = u128::BITS as u64;

impl Dedup {
    pub(super) fn new() -> Self {
        Self {
            highest: None,
            seen: 0,
        }
    }

    /// Record a newly authenticated packet number
    ///
    /// Returns whether the packet might be a duplicate.
    pub(super) fn insert(&mut self, packet: u64) -> bool {
        let Some(highest) = self.highest else {
            self.highest = Some(packet);
            self.seen = 1;
            return false;
        };
        if packet > highest {
            // Slide the window forward; old entries fall off the high end
            let advance = packet - highest;
            self.seen = match advance < u128::BITS as u64 {
                true => self.seen << advance | 1,
                false => 1,
            };
            self.highest = Some(packet);
            return false;
        }
        let age = highest - packet;
        if age >= REPLAY_SPAN {
            // Too old to distinguish from a replay
            return true;
        }
        let bit = 1u128 << age;
        let duplicate = self.seen & bit != 0;
        self.seen |= bit;
        duplicate
    }
}

/// State for tracking which received packets to acknowledge, and how urgently
#[derive(Debug, Default)]
pub(super) struct PendingAcks {
    ranges: RangeSet,
    /// Whether an ACK frame must go out at the next opportunity
    immediate: bool,
    /// Whether an ACK-only packet may be sent at all
    permit_ack_only: bool,
    /// Largest packet number received in this space
    largest_received: Option<u64>,
    /// When the most recent ack-eliciting packet arrived
    latest_incoming: Option<Instant>,
    /// Ack-eliciting packets received since an ACK was last sent
    ack_eliciting_since_ack: u64,
}

impl PendingAcks {
    /// Handle receipt of an authenticated packet
    ///
    /// `threshold` is the number of ack-eliciting packets tolerated before an
    /// immediate acknowledgement; out-of-order arrival and ECN-CE marks always
    /// force one.
    pub(super) fn packet_received(
        &mut self,
        packet: u64,
        now: Instant,
        ack_eliciting: bool,
        ecn: Option<EcnCodepoint>,
        threshold: u64,
    ) {
        let out_of_order = self
            .largest_received
            .is_some_and(|largest| packet < largest || packet > largest + 1);
        self.largest_received = Some(self.largest_received.map_or(packet, |x| x.max(packet)));
        self.ranges.insert_one(packet);
        if self.ranges.len() > MAX_ACK_BLOCKS {
            self.ranges.pop_min();
        }
        if ack_eliciting {
            self.permit_ack_only = true;
            self.ack_eliciting_since_ack += 1;
            self.latest_incoming = Some(now);
            if out_of_order || self.ack_eliciting_since_ack >= threshold {
                self.immediate = true;
            }
        }
        if ecn.is_some_and(|x| x.is_ce()) {
            self.immediate = true;
        }
    }

    /// Force an acknowledgement at the next write, e.g. on IMMEDIATE_ACK
    pub(super) fn set_immediate(&mut self) {
        if !self.ranges.is_empty() {
            self.immediate = true;
        }
    }

    /// Whether an ACK frame can be included in the next packet
    pub(super) fn can_send(&self) -> bool {
        self.permit_ack_only && !self.ranges.is_empty()
    }

    /// Whether an ACK frame must be sent promptly
    pub(super) fn needs_to_send_ack_immediately(&self) -> bool {
        self.immediate && !self.ranges.is_empty()
    }

    /// Should be called whenever ACKs have been sent
    pub(super) fn acks_sent(&mut self) {
        self.immediate = false;
        self.ack_eliciting_since_ack = 0;
        // If we sent any acks, don't immediately resend them. Setting this even if
        // ack_only is false needlessly prevents us from ACKing the next packet if
        // it's ACK-only, but saves the need for subtler logic to avoid
        // double-transmitting acks all the time.
        self.permit_ack_only = false;
    }

    /// Removes ranges that were carried by a now-acknowledged ACK of ours
    pub(super) fn subtract(&mut self, acks: &RangeSet) {
        self.ranges.subtract(acks);
        if self.ranges.is_empty() {
            self.permit_ack_only = false;
            self.immediate = false;
        }
    }

    /// When an ack for the latest ack-eliciting packet becomes due
    pub(super) fn earliest_deadline(&self) -> Option<Instant> {
        if !self.permit_ack_only {
            return None;
        }
        self.latest_incoming
    }

    /// Returns the set of currently pending ACK ranges
    pub(super) fn ranges(&self) -> &RangeSet {
        &self.ranges
    }
}

/// Ensures we can always fit all our ACKs in a single minimum-MTU packet with room
/// to spare
const MAX_ACK_BLOCKS: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_flagged_in_order_accepted() {
        let mut dedup = Dedup::new();
        for pn in 0..5 {
            assert!(!dedup.insert(pn), "fresh packet {pn} flagged");
            assert!(dedup.insert(pn), "replay of {pn} accepted");
        }
    }

    #[test]
    fn reordered_arrivals_within_span() {
        let mut dedup = Dedup::new();
        assert!(!dedup.insert(0));
        assert!(!dedup.insert(4));
        // The gap fills in any order, each number exactly once
        assert!(!dedup.insert(3));
        assert!(!dedup.insert(1));
        assert!(!dedup.insert(2));
        assert!(dedup.insert(3));
        assert!(dedup.insert(4));
    }

    #[test]
    fn ancient_packets_treated_as_replays() {
        let mut dedup = Dedup::new();
        assert!(!dedup.insert(0));
        assert!(!dedup.insert(REPLAY_SPAN + 10));
        // Fell off the window: indistinguishable from a replay, so refused
        assert!(dedup.insert(5));
        // Still inside the window: fine
        assert!(!dedup.insert(11));
    }

    #[test]
    fn forward_jump_clears_history() {
        let mut dedup = Dedup::new();
        for pn in 0..10 {
            dedup.insert(pn);
        }
        assert!(!dedup.insert(10 * REPLAY_SPAN));
        // Everything before the jump now reads as a replay
        assert!(dedup.insert(9));
        assert!(!dedup.insert(10 * REPLAY_SPAN - 1));
    }

    #[test]
    fn immediate_ack_on_threshold() {
        let now = Instant::now();
        let mut acks = PendingAcks::default();
        for pn in 0..9 {
            acks.packet_received(pn, now, true, None, 10);
        }
        assert!(!acks.needs_to_send_ack_immediately());
        acks.packet_received(9, now, true, None, 10);
        assert!(acks.needs_to_send_ack_immediately());
        acks.acks_sent();
        assert!(!acks.needs_to_send_ack_immediately());
    }

    #[test]
    fn immediate_ack_on_reorder() {
        let now = Instant::now();
        let mut acks = PendingAcks::default();
        acks.packet_received(0, now, true, None, 10);
        acks.packet_received(5, now, true, None, 10);
        assert!(acks.needs_to_send_ack_immediately());
    }

    #[test]
    fn immediate_ack_on_ce() {
        let now = Instant::now();
        let mut acks = PendingAcks::default();
        acks.packet_received(0, now, true, Some(EcnCodepoint::Ce), 10);
        assert!(acks.needs_to_send_ack_immediately());
    }

    #[test]
    fn acked_ranges_subtracted() {
        let now = Instant::now();
        let mut acks = PendingAcks::default();
        acks.packet_received(0, now, true, None, 10);
        acks.packet_received(1, now, true, None, 10);
        let mut sent = RangeSet::new();
        sent.insert(0..2);
        acks.subtract(&sent);
        assert!(!acks.can_send());
    }

    #[test]
    fn clone_accounting() {
        let now = Instant::now();
        let mut space = PacketSpace::new(now);
        let packet = |clone_id| SentPacket {
            time_sent: now,
            size: 100,
            ack_eliciting: true,
            clone_id: Some(clone_id),
            ..SentPacket::default()
        };
        space.sent(1, packet(7));
        space.sent(2, packet(7));
        // Ack of the original: effects apply, and the sibling's loss is moot
        assert!(!space.clone_erased(Some(7), true));
        assert!(space.clone_group_acked(7));
        assert!(!space.clone_erased(Some(7), false));
        // Group is gone once both members are erased
        assert!(space.clones.is_empty());
    }

    #[test]
    fn ecn_validation() {
        let now = Instant::now();
        let mut space = PacketSpace::new(now);
        // 3 newly acked, peer reports 3 ECT(0): fine, no congestion
        assert_eq!(
            space.detect_ecn(
                3,
                EcnCounts {
                    ect0: 3,
                    ect1: 0,
                    ce: 0
                }
            ),
            Ok(false)
        );
        // CE count increase signals congestion
        assert_eq!(
            space.detect_ecn(
                1,
                EcnCounts {
                    ect0: 3,
                    ect1: 0,
                    ce: 1
                }
            ),
            Ok(true)
        );
        // Counts going backwards is a protocol anomaly
        assert!(space
            .detect_ecn(
                1,
                EcnCounts {
                    ect0: 0,
                    ect1: 0,
                    ce: 0
                }
            )
            .is_err());
    }
}
