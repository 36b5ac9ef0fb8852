// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Loss detection and congestion control, RFC 9002.
//!
//! Each epoch owns a [`PacketSpace`]: the sent-packet ledger, the ACK
//! ledger for inbound packets and the loss timer. [`Recovery`] holds the
//! cross-space state: RTT estimator, congestion controller and PTO backoff.

pub mod congestion;
pub mod rtt;

pub use congestion::CongestionController;
pub use rtt::{RttEstimator, K_GRANULARITY, K_INITIAL_RTT};

use crate::{
    builder::SentPacket,
    crypto::Epoch,
    ranges::RangeSet,
    time::Timestamp,
};
use core::ops::RangeInclusive;
use core::time::Duration;
use std::collections::BTreeMap;

//= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.1
//# The RECOMMENDED initial value for the packet reordering threshold
//# (kPacketThreshold) is 3, based on best practices for TCP loss
//# detection
pub const K_PACKET_THRESHOLD: u64 = 3;

//= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.2
//# The RECOMMENDED time threshold (kTimeThreshold), expressed as an
//# RTT multiplier, is 9/8.
const K_TIME_THRESHOLD_NUM: u32 = 9;
const K_TIME_THRESHOLD_DEN: u32 = 8;

/// Consecutive PTO periods that must cover lost ack-eliciting packets
/// before congestion is considered persistent.
const K_PERSISTENT_CONGESTION_THRESHOLD: u32 = 2;

/// Per-epoch packet number space.
#[derive(Default)]
pub struct PacketSpace {
    pub discarded: bool,

    /// Received packet numbers awaiting acknowledgment.
    pub ack_queue: RangeSet,
    /// When a pending acknowledgment must be sent.
    pub ack_at: Option<Timestamp>,
    pub largest_received_packet: Option<u64>,
    pub largest_received_time: Option<Timestamp>,

    /// One more than the largest received packet number; seed for
    /// truncated packet-number reconstruction.
    pub expected_packet_number: u64,

    pub largest_acked_packet: Option<u64>,
    pub loss_time: Option<Timestamp>,
    pub ack_eliciting_in_flight: usize,
    pub last_ack_eliciting_time: Option<Timestamp>,
    pub sent_packets: BTreeMap<u64, SentPacket>,
}

impl PacketSpace {
    /// Records a received packet and returns false when it is a duplicate.
    pub fn on_packet_received(&mut self, packet_number: u64) -> bool {
        if self.ack_queue.contains(packet_number) {
            return false;
        }
        self.ack_queue.insert_value(packet_number);
        if packet_number >= self.expected_packet_number {
            self.expected_packet_number = packet_number + 1;
        }
        true
    }
}

/// What an ACK frame resolved to, handed back to the connection so it can
/// fire delivery handlers.
pub struct AckOutcome {
    pub newly_acked: Vec<SentPacket>,
    pub lost: Vec<SentPacket>,
}

pub struct Recovery {
    pub rtt: RttEstimator,
    pub cc: CongestionController,
    pub pto_count: u32,
}

impl Recovery {
    pub fn new(max_datagram_size: usize) -> Self {
        Self {
            rtt: RttEstimator::default(),
            cc: CongestionController::new(max_datagram_size),
            pto_count: 0,
        }
    }

    fn loss_delay(&self) -> Duration {
        //= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.2
        //# The time threshold is:
        //#
        //# max(kTimeThreshold * max(smoothed_rtt, latest_rtt), kGranularity)
        core::cmp::max(
            core::cmp::max(self.rtt.smoothed_rtt(), self.rtt.latest_rtt())
                * K_TIME_THRESHOLD_NUM
                / K_TIME_THRESHOLD_DEN,
            K_GRANULARITY,
        )
    }

    /// Registers an emitted packet with its space and the congestion
    /// controller.
    pub fn on_packet_sent(&mut self, space: &mut PacketSpace, mut packet: SentPacket, now: Timestamp) {
        packet.sent_time = Some(now);
        if packet.is_ack_eliciting {
            space.ack_eliciting_in_flight += 1;
            space.last_ack_eliciting_time = Some(now);
        }
        if packet.in_flight {
            self.cc.on_packet_sent(packet.sent_bytes);
        }
        space.sent_packets.insert(packet.packet_number, packet);
    }

    /// Applies an ACK frame to `space`.
    ///
    /// `ranges` are the acknowledged packet-number ranges, ascending;
    /// `ack_delay` is already decoded into a duration. Returns the packets
    /// newly acknowledged and those now declared lost; the caller fires
    /// their delivery handlers.
    pub fn on_ack_received(
        &mut self,
        space: &mut PacketSpace,
        ranges: &[RangeInclusive<u64>],
        ack_delay: Duration,
        handshake_confirmed: bool,
        now: Timestamp,
    ) -> AckOutcome {
        let largest_acked = ranges.last().map(|r| *r.end()).unwrap_or(0);

        let mut newly_acked = Vec::new();
        for range in ranges {
            let acked: Vec<u64> = space
                .sent_packets
                .range(range.clone())
                .map(|(pn, _)| *pn)
                .collect();
            for pn in acked {
                let packet = space.sent_packets.remove(&pn).expect("present");
                newly_acked.push(packet);
            }
        }

        if newly_acked.is_empty() {
            return AckOutcome {
                newly_acked,
                lost: Vec::new(),
            };
        }

        if space
            .largest_acked_packet
            .map_or(true, |prev| largest_acked > prev)
        {
            space.largest_acked_packet = Some(largest_acked);
        }

        let mut largest_newly = None;
        for packet in &newly_acked {
            if packet.is_ack_eliciting {
                space.ack_eliciting_in_flight -= 1;
            }
            if largest_newly.map_or(true, |pn| packet.packet_number > pn) {
                largest_newly = Some(packet.packet_number);
            }
        }

        //= https://www.rfc-editor.org/rfc/rfc9002#section-5.1
        //# An endpoint generates an RTT sample on receiving an ACK frame
        //# that meets the following two conditions:
        //# *  the largest acknowledged packet number is newly acknowledged
        //# *  at least one of the newly acknowledged packets was ack-eliciting
        if largest_newly == Some(largest_acked) {
            if let Some(packet) = newly_acked
                .iter()
                .find(|p| p.packet_number == largest_acked)
            {
                if newly_acked.iter().any(|p| p.is_ack_eliciting) {
                    if let Some(sent_time) = packet.sent_time {
                        let sample = now.saturating_duration_since(sent_time);
                        self.rtt.update(sample, ack_delay, handshake_confirmed);
                    }
                }
            }
        }

        for packet in &newly_acked {
            if packet.in_flight {
                self.cc.on_packet_acked(
                    packet.sent_bytes,
                    packet.sent_time.unwrap_or(now),
                );
            }
        }

        let lost = self.detect_loss(space, now);

        //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
        //# The PTO backoff factor is reset when an acknowledgment is
        //# received
        self.pto_count = 0;

        AckOutcome { newly_acked, lost }
    }

    /// Declares packets lost by packet threshold or time threshold and
    /// re-arms the space's loss timer.
    pub fn detect_loss(&mut self, space: &mut PacketSpace, now: Timestamp) -> Vec<SentPacket> {
        let Some(largest_acked) = space.largest_acked_packet else {
            return Vec::new();
        };

        let loss_delay = self.loss_delay();
        let lost_send_time = now.checked_sub(loss_delay);
        space.loss_time = None;

        let mut lost_numbers = Vec::new();
        for (&pn, packet) in space.sent_packets.range(..=largest_acked) {
            //= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.1
            //# the packet was sent kPacketThreshold packets before an
            //# acknowledged packet
            let by_packet_threshold = pn + K_PACKET_THRESHOLD <= largest_acked;

            //= https://www.rfc-editor.org/rfc/rfc9002#section-6.1.2
            //# the packet ... was sent long enough in the past
            let by_time_threshold = match (packet.sent_time, lost_send_time) {
                (Some(sent), Some(threshold)) => sent <= threshold,
                _ => false,
            };

            if by_packet_threshold || by_time_threshold {
                lost_numbers.push(pn);
            } else if let Some(sent) = packet.sent_time {
                let candidate = sent + loss_delay;
                if space.loss_time.map_or(true, |t| candidate < t) {
                    space.loss_time = Some(candidate);
                }
            }
        }

        let mut lost = Vec::with_capacity(lost_numbers.len());
        let mut lost_bytes = 0;
        let mut newest_lost_time: Option<Timestamp> = None;
        let mut oldest_lost_time: Option<Timestamp> = None;
        for pn in lost_numbers {
            let packet = space.sent_packets.remove(&pn).expect("present");
            if packet.is_ack_eliciting {
                space.ack_eliciting_in_flight -= 1;
            }
            if packet.in_flight {
                lost_bytes += packet.sent_bytes;
                if let Some(sent) = packet.sent_time {
                    if newest_lost_time.map_or(true, |t| sent > t) {
                        newest_lost_time = Some(sent);
                    }
                    if packet.is_ack_eliciting && oldest_lost_time.map_or(true, |t| sent < t) {
                        oldest_lost_time = Some(sent);
                    }
                }
            }
            lost.push(packet);
        }

        if lost_bytes > 0 {
            let newest = newest_lost_time.unwrap_or(now);
            self.cc.on_packets_lost(lost_bytes, newest, now);

            //= https://www.rfc-editor.org/rfc/rfc9002#section-7.6
            //# When persistent congestion is declared, the sender's
            //# congestion window MUST be reduced to the minimum congestion
            //# window
            if let (Some(oldest), Some(newest)) = (oldest_lost_time, newest_lost_time) {
                let duration = self.rtt.pto_period(true) * K_PERSISTENT_CONGESTION_THRESHOLD;
                if self.rtt.has_sample() && newest.saturating_duration_since(oldest) >= duration {
                    self.cc.on_persistent_congestion();
                }
            }
        }

        lost
    }

    /// The earliest armed loss timer across `spaces`, if any.
    pub fn earliest_loss_time<'a, I>(&self, spaces: I) -> Option<Timestamp>
    where
        I: Iterator<Item = &'a PacketSpace>,
    {
        spaces
            .filter(|space| !space.discarded)
            .filter_map(|space| space.loss_time)
            .min()
    }

    //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
    //# Even when there are ack-eliciting packets in flight in multiple
    //# packet number spaces, the exponential increase in PTO occurs across
    //# all spaces
    /// The PTO deadline: one backed-off PTO period after the last
    /// ack-eliciting packet in the earliest space still holding one.
    pub fn pto_deadline(&self, spaces: &[&PacketSpace; Epoch::COUNT]) -> Option<Timestamp> {
        let mut deadline = None;
        for (index, space) in spaces.iter().enumerate() {
            if space.discarded || space.ack_eliciting_in_flight == 0 {
                continue;
            }
            let Some(last_sent) = space.last_ack_eliciting_time else {
                continue;
            };
            let is_application = index == Epoch::OneRtt as usize;
            let period = self.rtt.pto_period(is_application) * 2u32.pow(self.pto_count.min(16));
            let candidate = last_sent + period;
            if deadline.map_or(true, |current| candidate < current) {
                deadline = Some(candidate);
            }
        }
        deadline
    }

    /// Bytes no longer tracked after an epoch's keys are discarded.
    pub fn on_space_discarded(&mut self, space: &mut PacketSpace) {
        for (_, packet) in core::mem::take(&mut space.sent_packets) {
            if packet.in_flight {
                self.cc.on_packet_discarded(packet.sent_bytes);
            }
        }
        space.ack_eliciting_in_flight = 0;
        space.loss_time = None;
        space.ack_at = None;
        space.ack_queue = RangeSet::new();
        space.discarded = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{builder::SentPacket, packet::PacketType};
    use smallvec::SmallVec;

    fn ts(ms: u64) -> Timestamp {
        Timestamp::from_duration(Duration::from_millis(ms))
    }

    fn sent(pn: u64, now: Timestamp) -> SentPacket {
        SentPacket {
            epoch: Epoch::OneRtt,
            in_flight: true,
            is_ack_eliciting: true,
            is_crypto_packet: false,
            packet_number: pn,
            packet_type: PacketType::OneRtt,
            sent_time: Some(now),
            sent_bytes: 1200,
            delivery_handlers: SmallVec::new(),
        }
    }

    fn send_packets(recovery: &mut Recovery, space: &mut PacketSpace, at: &[(u64, u64)]) {
        for &(pn, millis) in at {
            let packet = sent(pn, ts(millis));
            recovery.on_packet_sent(space, packet, ts(millis));
        }
    }

    #[test]
    fn receive_ledger_dedups() {
        let mut space = PacketSpace::default();
        assert!(space.on_packet_received(3));
        assert!(!space.on_packet_received(3));
        assert!(space.on_packet_received(5));
        assert_eq!(space.expected_packet_number, 6);
        assert_eq!(space.ack_queue.iter().collect::<Vec<_>>(), vec![3..=3, 5..=5]);
    }

    #[test]
    fn ack_removes_packets_and_updates_rtt() {
        let mut recovery = Recovery::new(1280);
        let mut space = PacketSpace::default();
        send_packets(&mut recovery, &mut space, &[(0, 10), (1, 20), (2, 30)]);
        assert_eq!(recovery.cc.bytes_in_flight(), 3600);

        let outcome = recovery.on_ack_received(
            &mut space,
            &[0..=2],
            Duration::ZERO,
            false,
            ts(130),
        );
        assert_eq!(outcome.newly_acked.len(), 3);
        assert!(outcome.lost.is_empty());
        assert_eq!(recovery.cc.bytes_in_flight(), 0);
        assert_eq!(space.ack_eliciting_in_flight, 0);
        // sample = 130 - 30 = 100ms from packet 2
        assert_eq!(recovery.rtt.latest_rtt(), Duration::from_millis(100));
    }

    #[test]
    fn packet_threshold_declares_loss() {
        let mut recovery = Recovery::new(1280);
        let mut space = PacketSpace::default();
        // sent close together so the time threshold stays out of the picture
        send_packets(&mut recovery, &mut space, &[(0, 10), (1, 11), (2, 12), (3, 13)]);

        // acknowledge only packet 3: packet 0 trails by kPacketThreshold
        let outcome = recovery.on_ack_received(
            &mut space,
            &[3..=3],
            Duration::ZERO,
            false,
            ts(113),
        );
        assert_eq!(outcome.newly_acked.len(), 1);
        assert_eq!(
            outcome.lost.iter().map(|p| p.packet_number).collect::<Vec<_>>(),
            vec![0]
        );
        // 1 and 2 are within the reordering window; the loss timer is armed
        assert!(space.loss_time.is_some());
        assert_eq!(space.sent_packets.len(), 2);
    }

    #[test]
    fn time_threshold_declares_loss_on_timer() {
        let mut recovery = Recovery::new(1280);
        let mut space = PacketSpace::default();
        send_packets(&mut recovery, &mut space, &[(0, 10), (1, 11)]);

        // rtt sample = 100ms, so the loss delay is 112.5ms
        recovery.on_ack_received(&mut space, &[1..=1], Duration::ZERO, false, ts(111));
        assert_eq!(space.sent_packets.len(), 1);
        let loss_time = space.loss_time.expect("armed");
        assert_eq!(
            loss_time,
            ts(10) + Duration::from_micros(112_500)
        );

        let lost = recovery.detect_loss(&mut space, loss_time);
        assert_eq!(
            lost.iter().map(|p| p.packet_number).collect::<Vec<_>>(),
            vec![0]
        );
        assert!(space.loss_time.is_none());
    }

    #[test]
    fn pto_deadline_prefers_earliest_space_and_backs_off() {
        let mut recovery = Recovery::new(1280);
        let mut initial = PacketSpace::default();
        let handshake = PacketSpace::default();
        let mut one_rtt = PacketSpace::default();

        recovery.on_packet_sent(&mut initial, sent(0, ts(10)), ts(10));
        recovery.on_packet_sent(&mut one_rtt, sent(0, ts(5)), ts(5));

        let spaces = [&initial, &handshake, &one_rtt];
        let base = recovery.pto_deadline(&spaces).unwrap();

        recovery.pto_count = 1;
        let backed_off = recovery.pto_deadline(&spaces).unwrap();
        assert!(backed_off > base);
    }

    #[test]
    fn discarding_a_space_returns_its_bytes() {
        let mut recovery = Recovery::new(1280);
        let mut space = PacketSpace::default();
        send_packets(&mut recovery, &mut space, &[(0, 10), (1, 20)]);
        assert_eq!(recovery.cc.bytes_in_flight(), 2400);

        recovery.on_space_discarded(&mut space);
        assert_eq!(recovery.cc.bytes_in_flight(), 0);
        assert!(space.discarded);
        assert!(space.sent_packets.is_empty());
    }
}
